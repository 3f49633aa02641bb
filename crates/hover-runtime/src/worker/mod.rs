// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Request-serving worker process.
//!
//! The worker is a long-lived FastCGI application (php-fpm by default) that
//! listens on a Unix socket. This module contains:
//!
//! - [`request`]: turns an HTTP-shaped invocation payload into a
//!   [`WorkerRequest`] with its CGI environment.
//! - [`manager`]: the [`WorkerProcessManager`] supervisor that owns the
//!   process, its socket and pid files, and restarts it after crashes or
//!   timeouts.
//! - [`WorkerBridge`]: the seam the HTTP processor talks to, so processors
//!   can be exercised without a real worker.

pub mod manager;
pub mod request;

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use hover_fastcgi::FastCgiError;
use thiserror::Error;

pub use manager::{WorkerConfig, WorkerProcessManager};
pub use request::{WorkerRequest, build_request};

/// Lifecycle state of the worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// No process has been started.
    NotStarted,
    /// Process spawned, waiting for its socket.
    Starting,
    /// Accepting one request.
    Ready,
    /// A request is in flight.
    Busy,
    /// The process exited or was abandoned after a timeout.
    Crashed,
    /// Termination in progress.
    Stopping,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            WorkerState::NotStarted => "not_started",
            WorkerState::Starting => "starting",
            WorkerState::Ready => "ready",
            WorkerState::Busy => "busy",
            WorkerState::Crashed => "crashed",
            WorkerState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Worker supervision and bridging errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WorkerError {
    /// The process exited before it became ready.
    #[error("Worker failed to start: {message}\n{output}")]
    StartFailed {
        /// What went wrong.
        message: String,
        /// Output captured from the process so far.
        output: String,
    },

    /// The socket did not appear in time.
    #[error("Timeout while waiting for the worker to start")]
    StartTimeout,

    /// A previous or current process could not be stopped cleanly.
    #[error("Worker failed to stop: {0}")]
    StopFailed(String),

    /// The exchange did not finish within the caller's budget.
    #[error("Worker request timed out {margin_secs} second(s) before the deadline")]
    Timeout {
        /// Safety margin left before the real deadline, in seconds.
        margin_secs: u64,
    },

    /// The process died while serving a request.
    #[error("Worker crashed while serving the request: {0}")]
    Crashed(String),

    /// A request is already in flight.
    #[error("Worker is busy with another request")]
    Busy,

    /// The worker is not in a state that accepts requests.
    #[error("Worker is not ready (state: {0})")]
    NotReady(WorkerState),

    /// FastCGI exchange failed.
    #[error("FastCGI error: {0}")]
    Protocol(#[from] FastCgiError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    /// Stable name reported as `errorType`.
    pub fn error_type(&self) -> &'static str {
        match self {
            WorkerError::StartFailed { .. } | WorkerError::StartTimeout => "WorkerStartError",
            WorkerError::StopFailed(_) => "WorkerStopError",
            WorkerError::Timeout { .. } => "WorkerTimeoutError",
            WorkerError::Crashed(_) => "WorkerCrashedError",
            WorkerError::Busy
            | WorkerError::NotReady(_)
            | WorkerError::Protocol(_)
            | WorkerError::Io(_) => "WorkerError",
        }
    }
}

/// Response produced by the worker for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerResponse {
    /// HTTP status (200 unless the worker sent a `Status` header).
    pub status: u16,
    /// Headers keyed by lower-case name, all values in arrival order.
    pub headers: BTreeMap<String, Vec<String>>,
    /// Raw body.
    pub body: Bytes,
}

impl Default for WorkerResponse {
    fn default() -> Self {
        Self {
            status: hover_fastcgi::response::DEFAULT_STATUS,
            headers: BTreeMap::new(),
            body: Bytes::new(),
        }
    }
}

impl From<hover_fastcgi::Response> for WorkerResponse {
    fn from(response: hover_fastcgi::Response) -> Self {
        Self {
            status: response.status,
            headers: response.headers,
            body: response.body,
        }
    }
}

/// Something that can serve a [`WorkerRequest`] within a time budget.
///
/// `timeout_ms` is the time left until the invocation deadline; implementors
/// keep their own safety margin below it.
#[async_trait]
pub trait WorkerBridge: Send {
    /// Send one request and wait for the complete response.
    async fn send_request(
        &mut self,
        request: &WorkerRequest,
        timeout_ms: i64,
    ) -> Result<WorkerResponse, WorkerError>;

    /// Stop the worker at teardown.
    async fn shutdown(&mut self) {}
}
