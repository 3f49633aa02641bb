// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! CLI processor: runs a console command as a subprocess.

use std::io::Write;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{info, instrument, warn};

use super::EventProcessor;
use crate::control_plane::Invocation;
use crate::deadline::{self, SAFETY_MARGIN_MS};
use crate::error::{Error, Result};

/// Runs `<entrypoint> <command> --no-interaction` for `{"command": ...}`
/// payloads.
#[derive(Debug, Clone)]
pub struct CliProcessor {
    entrypoint: String,
}

impl CliProcessor {
    /// Processor prefixing every command with `entrypoint`.
    pub fn new(entrypoint: impl Into<String>) -> Self {
        Self {
            entrypoint: entrypoint.into(),
        }
    }

    /// Full shell command line for `command`.
    pub fn command_line(&self, command: &str) -> String {
        format!("{} {} --no-interaction 2>&1", self.entrypoint, command.trim())
    }
}

#[async_trait]
impl EventProcessor for CliProcessor {
    #[instrument(skip_all, fields(invocation_id = %invocation.id))]
    async fn process(&mut self, invocation: &Invocation) -> Result<Value> {
        let command = invocation
            .payload
            .get("command")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::BadRequestPayload("command must be a string".to_string()))?;

        let margin_secs = (SAFETY_MARGIN_MS / 1000) as u64;
        let limit = deadline::whole_seconds_budget(invocation.deadline.remaining_millis());
        if limit <= 0 {
            return Err(Error::CommandTimedOut(margin_secs));
        }

        info!(command = %command.trim(), limit_secs = limit, "Executing command");

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(self.command_line(command))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()?;
        let pid = child.id();
        let stdout = child.stdout.take();

        let run = async {
            let mut output = Vec::new();
            if let Some(stdout) = stdout {
                let mut reader = BufReader::new(stdout);
                let mut line = Vec::new();
                loop {
                    line.clear();
                    if reader.read_until(b'\n', &mut line).await? == 0 {
                        break;
                    }
                    let _ = std::io::stderr().lock().write_all(&line);
                    output.extend_from_slice(&line);
                }
            }
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((status, output))
        };

        match tokio::time::timeout(Duration::from_secs(limit as u64), run).await {
            Ok(result) => {
                let (status, output) = result?;
                let exit_code = status.code().unwrap_or(-1);
                info!(exit_code = exit_code, "Command finished");
                Ok(json!({
                    "exit_code": exit_code,
                    "output": STANDARD.encode(output),
                }))
            }
            Err(_) => {
                warn!(limit_secs = limit, "Command timed out, killing its process group");
                if let Some(pid) = pid {
                    match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                        Ok(()) | Err(Errno::ESRCH) => {}
                        Err(e) => warn!(pid = pid, error = %e, "Failed to kill command"),
                    }
                }
                Err(Error::CommandTimedOut(margin_secs))
            }
        }
    }
}
