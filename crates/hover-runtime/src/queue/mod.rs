// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Generic queue job runner.
//!
//! [`run_worker`] pulls jobs from a [`JobSource`], runs each through a
//! [`JobHandler`] under a timeout, and applies retry accounting (attempt
//! limits and backoff). Behaviour that differs between hosts is supplied
//! explicitly through [`WorkerOptions`] and [`WorkerPolicy`].

pub mod handler;
pub mod job;
pub mod runner;

use thiserror::Error;

pub use handler::{CommandJobHandler, JobHandler};
pub use job::{JobState, QueueIdentity, QueueJob};
pub use runner::{
    JobSource, RunSummary, SingleJobSource, StopContext, TimeoutAction, WorkerOptions,
    WorkerPolicy, run_worker,
};

/// Failure of a single job attempt. Handled by the runner's retry
/// accounting, never surfaced as an invocation error.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum JobError {
    /// The handler reported failure.
    #[error("Job failed: {0}")]
    Failed(String),

    /// The attempt exceeded its timeout.
    #[error("Job timed out after {0} second(s). It will be retried again.")]
    TimedOut(u64),

    /// The handler could not be run.
    #[error("Job handler IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that stop the runner itself.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum QueueError {
    /// A batch record could not be turned into a job.
    #[error("Invalid queue record: {0}")]
    InvalidRecord(String),

    /// A job exceeded its timeout and the policy says to kill the worker.
    #[error("Job timed out after {timeout_secs} second(s). It will be retried again.")]
    Killed {
        /// Timeout that was exceeded.
        timeout_secs: u64,
    },

    /// The job source failed.
    #[error("Job source error: {0}")]
    Source(String),
}
