// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker process supervisor.
//!
//! [`WorkerProcessManager`] exclusively owns the worker process and the files
//! it leaves on disk (socket, pid file, config). It is driven by `&mut self`,
//! so at most one lifecycle operation or request is in flight at a time.
//!
//! Lifecycle:
//!
//! ```text
//! NotStarted ──start──► Starting ──socket──► Ready ◄──► Busy
//!      ▲                                       │          │
//!      └──────────── stop ◄── Stopping ◄───────┘          │
//!                                                         ▼
//!                        Starting ◄──restart── Crashed ◄──┘ (exit / timeout)
//! ```

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hover_fastcgi::{Client, ClientConfig};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::{Pid, getpgid, getpid};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::{WorkerBridge, WorkerError, WorkerRequest, WorkerResponse, WorkerState};
use crate::config::Config;
use crate::deadline::{self, SAFETY_MARGIN_MS};

/// Captured output is truncated from the front beyond this size.
const MAX_CAPTURED_OUTPUT: usize = 64 * 1024;

/// Worker process configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Executable to spawn.
    pub program: String,
    /// Arguments passed to the executable.
    pub args: Vec<String>,
    /// Directory holding the socket, pid and config files.
    pub runtime_dir: PathBuf,
    /// Socket the worker listens on; its existence means "ready".
    pub socket_path: PathBuf,
    /// Pid file the worker writes.
    pub pid_file: PathBuf,
    /// Config file the worker reads.
    pub config_file: PathBuf,
    /// Template copied to `config_file` when that file is absent.
    pub config_template: Option<PathBuf>,
    /// Maximum time to wait for the socket after spawning.
    pub start_timeout: Duration,
    /// Grace period between SIGTERM and SIGKILL on stop.
    pub stop_timeout: Duration,
    /// Maximum time to wait for a leftover process to exit.
    pub kill_wait: Duration,
    /// Poll interval for socket and process checks.
    pub poll_interval: Duration,
}

impl WorkerConfig {
    /// php-fpm style layout under `runtime_dir`.
    pub fn new(program: impl Into<String>, runtime_dir: impl Into<PathBuf>) -> Self {
        let runtime_dir = runtime_dir.into();
        let config_file = runtime_dir.join("php-fpm.conf");
        Self {
            program: program.into(),
            args: vec![
                "--nodaemonize".to_string(),
                "--force-stderr".to_string(),
                "--fpm-config".to_string(),
                config_file.display().to_string(),
            ],
            socket_path: runtime_dir.join("php-fpm.sock"),
            pid_file: runtime_dir.join("php-fpm.pid"),
            config_file,
            runtime_dir,
            config_template: None,
            start_timeout: Duration::from_secs(5),
            stop_timeout: Duration::from_millis(500),
            kill_wait: Duration::from_secs(1),
            poll_interval: Duration::from_millis(5),
        }
    }

    /// Worker configuration derived from the runtime configuration.
    pub fn from_config(config: &Config) -> Self {
        let mut worker = Self::new(&config.worker_binary, &config.runtime_dir);
        worker.config_template = Some(config.worker_config_template.clone());
        worker
    }

    /// Replace the spawned command, keeping the file layout.
    pub fn with_command(mut self, program: impl Into<String>, args: Vec<String>) -> Self {
        self.program = program.into();
        self.args = args;
        self
    }
}

/// Supervisor of one worker process.
pub struct WorkerProcessManager {
    config: WorkerConfig,
    child: Option<Child>,
    output: Arc<Mutex<String>>,
    forwarders: Vec<JoinHandle<()>>,
    state: WorkerState,
    restarts: u64,
    /// Whether `start` was ever called; a stopped or crashed worker is then
    /// brought back on the next request.
    started: bool,
}

impl WorkerProcessManager {
    /// Create a manager; nothing is spawned until [`start`](Self::start).
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            config,
            child: None,
            output: Arc::new(Mutex::new(String::new())),
            forwarders: Vec::new(),
            state: WorkerState::NotStarted,
            restarts: 0,
            started: false,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Number of restarts after crashes or timeouts.
    pub fn restarts(&self) -> u64 {
        self.restarts
    }

    /// Pid of the owned process, if running.
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    /// Configuration in use.
    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Output captured from the current process.
    pub fn captured_output(&self) -> String {
        self.output
            .lock()
            .map(|output| output.clone())
            .unwrap_or_default()
    }

    /// Start the worker and wait until its socket appears.
    ///
    /// A process this manager already owns is stopped first. A process left
    /// behind by a previous runtime instance (detected through the socket and
    /// pid files) is terminated and its files removed.
    #[instrument(skip(self), fields(program = %self.config.program))]
    pub async fn start(&mut self) -> Result<(), WorkerError> {
        self.started = true;
        if self.child.is_some() {
            self.stop().await?;
        }

        if self.config.socket_path.exists() {
            self.kill_existing().await?;
        }

        self.state = WorkerState::Starting;
        tokio::fs::create_dir_all(&self.config.runtime_dir).await?;
        self.materialize_config().await?;

        if let Ok(mut output) = self.output.lock() {
            output.clear();
        }

        let mut child = Command::new(&self.config.program)
            .args(&self.config.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                self.state = WorkerState::Crashed;
                WorkerError::StartFailed {
                    message: format!("failed to spawn {}: {}", self.config.program, e),
                    output: String::new(),
                }
            })?;

        self.forwarders.clear();
        if let Some(stdout) = child.stdout.take() {
            self.forwarders.push(forward_output(stdout, self.output.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            self.forwarders.push(forward_output(stderr, self.output.clone()));
        }

        info!(pid = ?child.id(), "Worker process spawned");
        self.child = Some(child);

        self.wait_until_ready().await
    }

    /// Stop the worker: SIGTERM, then SIGKILL after the grace period.
    ///
    /// Fails with [`WorkerError::StopFailed`] when a running process exited
    /// but left its socket behind.
    #[instrument(skip(self))]
    pub async fn stop(&mut self) -> Result<(), WorkerError> {
        let Some(mut child) = self.child.take() else {
            self.state = WorkerState::NotStarted;
            return Ok(());
        };

        if let Some(status) = child.try_wait()? {
            debug!(status = %status, "Worker already exited");
            self.state = WorkerState::NotStarted;
            return Ok(());
        }

        self.state = WorkerState::Stopping;
        if let Some(pid) = child.id() {
            match signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => warn!(pid = pid, error = %e, "Failed to send SIGTERM to worker"),
            }
        }

        match tokio::time::timeout(self.config.stop_timeout, child.wait()).await {
            Ok(status) => {
                let status = status?;
                debug!(status = %status, "Worker stopped");
            }
            Err(_) => {
                warn!("Worker ignored SIGTERM, sending SIGKILL");
                child.kill().await?;
            }
        }
        self.state = WorkerState::NotStarted;

        if self.config.socket_path.exists() {
            return Err(WorkerError::StopFailed(format!(
                "socket {} still present after the worker exited",
                self.config.socket_path.display()
            )));
        }
        Ok(())
    }

    /// Stop the worker at teardown, logging instead of failing.
    pub async fn shutdown(&mut self) {
        if let Err(e) = self.stop().await {
            warn!(error = %e, "Worker did not shut down cleanly");
        }
    }

    /// Send one request, bounded by `timeout_ms` minus the safety margin.
    ///
    /// On timeout the worker is restarted once and
    /// [`WorkerError::Timeout`] is returned. If the worker died during the
    /// exchange it is restarted and [`WorkerError::Crashed`] is returned. A
    /// failed restart is logged; the next request tries again.
    #[instrument(skip(self, request), fields(method = %request.method, uri = %request.uri))]
    pub async fn send_request(
        &mut self,
        request: &WorkerRequest,
        timeout_ms: i64,
    ) -> Result<WorkerResponse, WorkerError> {
        match self.state {
            WorkerState::Ready => {}
            WorkerState::Busy => return Err(WorkerError::Busy),
            WorkerState::NotStarted | WorkerState::Crashed if self.started => {
                warn!(state = %self.state, "Worker is down, restarting before the request");
                self.restart().await?;
            }
            other => return Err(WorkerError::NotReady(other)),
        }

        if self.has_exited()? {
            warn!("Worker exited between requests, restarting");
            self.state = WorkerState::Crashed;
            self.restart().await?;
        }

        self.state = WorkerState::Busy;
        let budget = deadline::budget_after_margin(timeout_ms);
        let client = Client::new(ClientConfig::new(&self.config.socket_path));
        let fastcgi_request = request.to_fastcgi();

        match tokio::time::timeout(budget, client.execute(&fastcgi_request)).await {
            Ok(Ok(response)) => {
                self.state = WorkerState::Ready;
                debug!(status = response.status, "Worker responded");
                Ok(response.into())
            }
            Ok(Err(e)) => {
                if self.exited_within(Duration::from_millis(100)).await? {
                    warn!(error = %e, "Worker crashed during the request, restarting");
                    self.state = WorkerState::Crashed;
                    self.restart_logged().await;
                    Err(WorkerError::Crashed(e.to_string()))
                } else {
                    self.state = WorkerState::Ready;
                    Err(WorkerError::Protocol(e))
                }
            }
            Err(_) => {
                warn!(
                    budget_ms = budget.as_millis() as u64,
                    "Worker request timed out, restarting the worker"
                );
                self.state = WorkerState::Crashed;
                self.restart_logged().await;
                Err(WorkerError::Timeout {
                    margin_secs: (SAFETY_MARGIN_MS / 1000) as u64,
                })
            }
        }
    }

    /// Stop then start. A failed stop does not prevent the start: leftover
    /// files are cleaned up by the stale-process check.
    async fn restart(&mut self) -> Result<(), WorkerError> {
        self.restarts += 1;
        if let Err(e) = self.stop().await {
            warn!(error = %e, "Worker did not stop cleanly before restart");
        }
        self.start().await
    }

    /// Restart on the error path, where the request's own error wins.
    async fn restart_logged(&mut self) {
        if let Err(e) = self.restart().await {
            error!(error = %e, state = %self.state, "Worker restart failed");
            if self.state != WorkerState::Ready {
                self.state = WorkerState::Crashed;
            }
        }
    }

    fn has_exited(&mut self) -> Result<bool, WorkerError> {
        match self.child.as_mut() {
            Some(child) => Ok(child.try_wait()?.is_some()),
            None => Ok(true),
        }
    }

    /// The exit of a crashing worker can trail the broken connection slightly.
    async fn exited_within(&mut self, window: Duration) -> Result<bool, WorkerError> {
        let started = Instant::now();
        loop {
            if self.has_exited()? {
                return Ok(true);
            }
            if started.elapsed() >= window {
                return Ok(false);
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    async fn wait_until_ready(&mut self) -> Result<(), WorkerError> {
        let started = Instant::now();

        while !self.config.socket_path.exists() {
            tokio::time::sleep(self.config.poll_interval).await;

            if started.elapsed() > self.config.start_timeout {
                warn!("Worker socket did not appear in time");
                self.state = WorkerState::Crashed;
                if let Some(mut child) = self.child.take() {
                    let _ = child.kill().await;
                }
                return Err(WorkerError::StartTimeout);
            }

            if let Some(status) = self.child.as_mut().map(Child::try_wait).transpose()?.flatten() {
                self.child = None;
                self.state = WorkerState::Crashed;
                self.drain_output().await;
                return Err(WorkerError::StartFailed {
                    message: format!("worker exited with {}", status),
                    output: self.captured_output(),
                });
            }
        }

        self.state = WorkerState::Ready;
        info!(
            socket = %self.config.socket_path.display(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Worker ready"
        );
        Ok(())
    }

    async fn drain_output(&mut self) {
        for handle in self.forwarders.drain(..) {
            let _ = tokio::time::timeout(Duration::from_millis(200), handle).await;
        }
    }

    async fn materialize_config(&self) -> Result<(), WorkerError> {
        let Some(template) = &self.config.config_template else {
            return Ok(());
        };
        if self.config.config_file.exists() {
            return Ok(());
        }
        tokio::fs::copy(template, &self.config.config_file)
            .await
            .map_err(|e| WorkerError::StartFailed {
                message: format!(
                    "failed to copy worker config from {}: {}",
                    template.display(),
                    e
                ),
                output: String::new(),
            })?;
        debug!(config = %self.config.config_file.display(), "Worker config written");
        Ok(())
    }

    /// Terminate a worker left behind by a previous runtime instance.
    async fn kill_existing(&self) -> Result<(), WorkerError> {
        let socket = &self.config.socket_path;
        let pid_file = &self.config.pid_file;

        let raw = match tokio::fs::read_to_string(pid_file).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Stale socket without pid file, removing");
                remove_if_exists(socket)?;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let pid: i32 = raw.trim().parse().unwrap_or(0);
        if pid <= 0 {
            debug!(raw = %raw.trim(), "Invalid pid file, removing stale files");
            return remove_stale(socket, pid_file);
        }

        let pid = Pid::from_raw(pid);
        if getpgid(Some(pid)).is_err() || pid == getpid() {
            debug!(pid = %pid, "Previous worker is gone, removing stale files");
            return remove_stale(socket, pid_file);
        }

        if let Err(e) = signal::kill(pid, Signal::SIGTERM) {
            debug!(pid = %pid, error = %e, "Could not signal previous worker, removing stale files");
            return remove_stale(socket, pid_file);
        }

        info!(pid = %pid, "Stopping worker left by a previous instance");
        let started = Instant::now();
        while getpgid(Some(pid)).is_ok() {
            tokio::time::sleep(self.config.poll_interval).await;
            if started.elapsed() > self.config.kill_wait {
                return Err(WorkerError::StopFailed(format!(
                    "timeout while waiting for previous worker {} to stop",
                    pid
                )));
            }
        }

        remove_stale(socket, pid_file)
    }
}

impl Drop for WorkerProcessManager {
    fn drop(&mut self) {
        for handle in &self.forwarders {
            handle.abort();
        }
    }
}

#[async_trait]
impl WorkerBridge for WorkerProcessManager {
    async fn send_request(
        &mut self,
        request: &WorkerRequest,
        timeout_ms: i64,
    ) -> Result<WorkerResponse, WorkerError> {
        WorkerProcessManager::send_request(self, request, timeout_ms).await
    }

    async fn shutdown(&mut self) {
        WorkerProcessManager::shutdown(self).await
    }
}

/// Forward each line to our stderr and keep a bounded copy.
///
/// Lines are raw bytes: the worker's output is not necessarily UTF-8, and
/// the pipe must be drained until the worker closes it.
fn forward_output<R>(reader: R, sink: Arc<Mutex<String>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(pump_output(reader, sink))
}

async fn pump_output<R>(reader: R, sink: Arc<Mutex<String>>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "Failed to read worker output");
                break;
            }
        }
        if !line.ends_with(b"\n") {
            line.push(b'\n');
        }

        let _ = std::io::stderr().lock().write_all(&line);
        if let Ok(mut output) = sink.lock() {
            output.push_str(&String::from_utf8_lossy(&line));
            if output.len() > MAX_CAPTURED_OUTPUT {
                let mut cut = output.len() - MAX_CAPTURED_OUTPUT;
                while !output.is_char_boundary(cut) {
                    cut += 1;
                }
                output.drain(..cut);
            }
        }
    }
}

fn remove_if_exists(path: &Path) -> Result<(), WorkerError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn remove_stale(socket: &Path, pid_file: &Path) -> Result<(), WorkerError> {
    remove_if_exists(socket)?;
    remove_if_exists(pid_file)
}
