// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The job loop.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use super::{JobError, JobHandler, QueueError, QueueJob};

/// Tunables of one [`run_worker`] call.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Pause when no job is available or the worker is paused.
    pub sleep: Duration,
    /// Stop after this many jobs; `0` means no limit.
    pub max_jobs: u32,
    /// Per-job timeout in seconds; `0` or less means no timeout.
    pub timeout: i64,
    /// Attempts allowed per job; `0` means unlimited.
    pub max_tries: u32,
    /// Seconds to wait before each retry, indexed by attempt. The last entry
    /// applies to every later attempt.
    pub backoff: Vec<u64>,
    /// Process jobs even in maintenance mode.
    pub force: bool,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            sleep: Duration::from_secs(3),
            max_jobs: 0,
            timeout: 60,
            max_tries: 1,
            backoff: vec![0],
            force: false,
        }
    }
}

impl WorkerOptions {
    /// Backoff before the retry that follows attempt number `attempts`.
    pub fn backoff_for(&self, attempts: u32) -> u64 {
        let index = attempts.saturating_sub(1) as usize;
        self.backoff
            .get(index)
            .or_else(|| self.backoff.last())
            .copied()
            .unwrap_or(0)
    }
}

/// What to do when a job exceeds its timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutAction {
    /// Abort the whole runner with [`QueueError::Killed`].
    Kill,
    /// Count the timeout as a failed attempt and continue.
    Retry,
}

/// State visible to the stop callback.
#[derive(Debug, Clone, Copy)]
pub struct StopContext {
    /// Jobs processed so far.
    pub jobs_processed: u32,
    /// Whether the last poll found no job.
    pub queue_empty: bool,
    /// Configured job limit.
    pub max_jobs: u32,
}

type Predicate = Box<dyn Fn() -> bool + Send + Sync>;

/// Host-specific hooks of the job loop.
pub struct WorkerPolicy {
    /// Whether jobs should be processed right now.
    pub should_run: Predicate,
    /// Whether the loop should end.
    pub should_stop: Box<dyn Fn(&StopContext) -> bool + Send + Sync>,
    /// Timeout handling.
    pub on_timeout: TimeoutAction,
    /// Whether the application is in maintenance mode.
    pub maintenance_mode: Predicate,
    /// Called before every job to reset per-job application state.
    pub reset_scope: Option<Box<dyn Fn() + Send + Sync>>,
}

impl Default for WorkerPolicy {
    /// Long-running daemon behaviour: stop only at the job limit, kill on
    /// timeout.
    fn default() -> Self {
        Self {
            should_run: Box::new(|| true),
            should_stop: Box::new(|ctx: &StopContext| ctx.max_jobs > 0 && ctx.jobs_processed >= ctx.max_jobs),
            on_timeout: TimeoutAction::Kill,
            maintenance_mode: Box::new(|| false),
            reset_scope: None,
        }
    }
}

/// Where jobs come from and where processed jobs go.
#[async_trait]
pub trait JobSource: Send {
    /// Next job, or `None` when the queue is currently empty.
    async fn next_job(&mut self) -> Result<Option<QueueJob>, QueueError>;

    /// Hand back a job after processing, with its final state.
    async fn finish(&mut self, job: QueueJob) -> Result<(), QueueError>;
}

/// Source holding exactly one pre-received job.
#[derive(Debug, Default)]
pub struct SingleJobSource {
    pending: Option<QueueJob>,
    finished: Option<QueueJob>,
}

impl SingleJobSource {
    /// Source yielding `job` once.
    pub fn new(job: QueueJob) -> Self {
        Self {
            pending: Some(job),
            finished: None,
        }
    }

    /// The job after processing, if it was processed.
    pub fn into_finished(self) -> Option<QueueJob> {
        self.finished
    }
}

#[async_trait]
impl JobSource for SingleJobSource {
    async fn next_job(&mut self) -> Result<Option<QueueJob>, QueueError> {
        Ok(self.pending.take())
    }

    async fn finish(&mut self, job: QueueJob) -> Result<(), QueueError> {
        self.finished = Some(job);
        Ok(())
    }
}

/// Result of a [`run_worker`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Jobs taken from the source.
    pub jobs_processed: u32,
    /// Jobs released for another attempt.
    pub released: u32,
    /// Jobs that failed permanently.
    pub failed: u32,
}

/// Run the job loop until the policy says stop.
#[instrument(skip_all, fields(max_jobs = options.max_jobs, timeout = options.timeout))]
pub async fn run_worker<S, H>(
    source: &mut S,
    handler: &H,
    options: &WorkerOptions,
    policy: &WorkerPolicy,
) -> Result<RunSummary, QueueError>
where
    S: JobSource + ?Sized,
    H: JobHandler + ?Sized,
{
    let mut summary = RunSummary::default();

    loop {
        let paused = !(policy.should_run)() || ((policy.maintenance_mode)() && !options.force);
        let mut queue_empty = false;

        if paused {
            debug!("Worker paused");
            tokio::time::sleep(options.sleep).await;
        } else {
            if let Some(reset) = &policy.reset_scope {
                reset();
            }

            match source.next_job().await? {
                Some(mut job) => {
                    process_job(&mut job, handler, options, policy).await?;
                    summary.jobs_processed += 1;
                    if job.is_released() {
                        summary.released += 1;
                    }
                    if job.has_failed() {
                        summary.failed += 1;
                    }
                    source.finish(job).await?;
                }
                None => {
                    queue_empty = true;
                    tokio::time::sleep(options.sleep).await;
                }
            }
        }

        let ctx = StopContext {
            jobs_processed: summary.jobs_processed,
            queue_empty,
            max_jobs: options.max_jobs,
        };
        if (policy.should_stop)(&ctx) {
            break;
        }
    }

    Ok(summary)
}

/// Run one job and settle its state.
async fn process_job<H>(
    job: &mut QueueJob,
    handler: &H,
    options: &WorkerOptions,
    policy: &WorkerPolicy,
) -> Result<(), QueueError>
where
    H: JobHandler + ?Sized,
{
    let max_tries = job.max_tries().unwrap_or(options.max_tries);

    if max_tries > 0 && job.attempts > max_tries {
        warn!(
            message_id = %job.message_id,
            attempts = job.attempts,
            max_tries = max_tries,
            "Job has been attempted too many times, failing without running"
        );
        job.fail(format!("{} has been attempted too many times", job.message_id));
        return Ok(());
    }

    let timeout = effective_timeout(job.timeout(), options.timeout);
    info!(
        message_id = %job.message_id,
        queue = %job.queue.name,
        attempts = job.attempts,
        timeout = ?timeout,
        "Processing job"
    );

    let outcome = match timeout {
        Some(secs) => {
            match tokio::time::timeout(Duration::from_secs(secs), handler.handle(job)).await {
                Ok(result) => result,
                Err(_) => match policy.on_timeout {
                    TimeoutAction::Kill => {
                        return Err(QueueError::Killed { timeout_secs: secs });
                    }
                    TimeoutAction::Retry => Err(JobError::TimedOut(secs)),
                },
            }
        }
        None => handler.handle(job).await,
    };

    match outcome {
        Ok(()) => {
            info!(message_id = %job.message_id, "Job processed");
            job.complete();
        }
        Err(error) => {
            warn!(message_id = %job.message_id, error = %error, "Job attempt failed");
            if max_tries > 0 && job.attempts >= max_tries {
                job.fail(error.to_string());
            } else {
                let delay = options.backoff_for(job.attempts);
                debug!(message_id = %job.message_id, delay = delay, "Releasing job");
                job.release(delay);
            }
        }
    }

    Ok(())
}

/// The job's own timeout capped by the worker's. `None` means unbounded.
fn effective_timeout(job_timeout: Option<u64>, worker_timeout: i64) -> Option<u64> {
    let worker = (worker_timeout > 0).then_some(worker_timeout as u64);
    match (job_timeout.filter(|t| *t > 0), worker) {
        (Some(job), Some(worker)) => Some(job.min(worker)),
        (Some(job), None) => Some(job),
        (None, worker) => worker,
    }
}
