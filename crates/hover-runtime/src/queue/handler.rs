// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job handlers.

use std::collections::VecDeque;
use std::io::Write;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::debug;

use super::{JobError, QueueJob};

/// Lines of output kept for the failure message.
const OUTPUT_TAIL_LINES: usize = 20;

/// Executes one attempt of a job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Run the job. `Ok` means the job succeeded.
    async fn handle(&self, job: &QueueJob) -> Result<(), JobError>;
}

/// Runs the application's job command with the job JSON on stdin.
///
/// Exit status 0 is success. The command is killed when the attempt is
/// abandoned (timeout), since the child is bound to the handler future.
#[derive(Debug, Clone)]
pub struct CommandJobHandler {
    command: String,
}

impl CommandJobHandler {
    /// Handler running `command` through `sh -c`.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    /// Command this handler runs.
    pub fn command(&self) -> &str {
        &self.command
    }
}

#[async_trait]
impl JobHandler for CommandJobHandler {
    async fn handle(&self, job: &QueueJob) -> Result<(), JobError> {
        let payload = serde_json::to_vec(&job.to_payload())
            .map_err(|e| JobError::Failed(format!("failed to encode job: {}", e)))?;

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(format!("{} 2>&1", self.command))
            .env("HOVER_JOB_ID", &job.message_id)
            .env("HOVER_JOB_ATTEMPTS", job.attempts.to_string())
            .env("HOVER_QUEUE_NAME", &job.queue.name)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            // A handler that never reads stdin closes the pipe early
            if let Err(e) = stdin.write_all(&payload).await {
                debug!(error = %e, "Job command did not read the full payload");
            }
        }

        let mut tail = VecDeque::with_capacity(OUTPUT_TAIL_LINES);
        if let Some(stdout) = child.stdout.take() {
            let mut reader = BufReader::new(stdout);
            let mut line = Vec::new();
            loop {
                line.clear();
                if reader.read_until(b'\n', &mut line).await? == 0 {
                    break;
                }
                let _ = std::io::stderr().lock().write_all(&line);
                if tail.len() == OUTPUT_TAIL_LINES {
                    tail.pop_front();
                }
                let text = String::from_utf8_lossy(&line);
                tail.push_back(text.trim_end_matches(['\r', '\n']).to_string());
            }
        }

        let status = child.wait().await?;
        if status.success() {
            return Ok(());
        }

        let code = status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        let output = tail.into_iter().collect::<Vec<_>>().join("\n");
        Err(JobError::Failed(format!(
            "job command exited with {}: {}",
            code, output
        )))
    }
}
