// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Queue processor: feeds batch records through the job runner.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{info, instrument, warn};

use super::EventProcessor;
use crate::control_plane::Invocation;
use crate::deadline;
use crate::error::{Error, Result};
use crate::manifest::QueuePolicy;
use crate::queue::{
    JobHandler, QueueJob, SingleJobSource, StopContext, TimeoutAction, WorkerOptions,
    WorkerPolicy, run_worker,
};

/// Runs each received record as one job with the queue's retry policy.
pub struct QueueBridge {
    queue_name: String,
    policy: QueuePolicy,
    handler: Arc<dyn JobHandler>,
}

impl QueueBridge {
    /// Bridge for `queue_name` governed by `policy`.
    pub fn new(queue_name: impl Into<String>, policy: QueuePolicy, handler: Arc<dyn JobHandler>) -> Self {
        Self {
            queue_name: queue_name.into(),
            policy,
            handler,
        }
    }

    /// Queue name encoded in a `{app}-{queue}-queue` function name.
    pub fn queue_name_for(function_name: &str, app_name: &str) -> String {
        let prefix = format!("{}-", app_name);
        let name = function_name.strip_prefix(&prefix).unwrap_or(function_name);
        name.strip_suffix("-queue").unwrap_or(name).to_string()
    }

    /// Queue this bridge serves.
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Options for one single-job run with `timeout_secs` left.
    pub fn worker_options(&self, timeout_secs: i64) -> WorkerOptions {
        WorkerOptions {
            sleep: Duration::ZERO,
            max_jobs: 1,
            timeout: timeout_secs,
            max_tries: self.policy.tries(),
            backoff: self.policy.backoff(),
            force: false,
        }
    }

    /// Policy for one single-job run: always run, stop on the job count
    /// alone, retry on timeout.
    pub fn worker_policy() -> WorkerPolicy {
        WorkerPolicy {
            should_run: Box::new(|| true),
            should_stop: Box::new(|ctx: &StopContext| {
                ctx.jobs_processed >= ctx.max_jobs || ctx.queue_empty
            }),
            on_timeout: TimeoutAction::Retry,
            maintenance_mode: Box::new(|| false),
            reset_scope: None,
        }
    }

    /// Run one record. Returns whether it must be reported as a batch item
    /// failure.
    async fn run_record(&self, record: &Value, invocation: &Invocation) -> Result<(String, bool)> {
        let job = QueueJob::from_record(record)?;
        let message_id = job.message_id.clone();

        let timeout_secs = deadline::whole_seconds_budget(invocation.deadline.remaining_millis());
        if timeout_secs <= 0 {
            warn!(message_id = %message_id, "No time left to run the job, handing it back");
            return Ok((message_id, true));
        }

        let options = self.worker_options(timeout_secs);
        let policy = Self::worker_policy();
        let mut source = SingleJobSource::new(job);
        run_worker(&mut source, self.handler.as_ref(), &options, &policy).await?;

        let retry = source
            .into_finished()
            .map(|job| job.is_released() || job.has_failed())
            .unwrap_or(true);
        Ok((message_id, retry))
    }
}

#[async_trait]
impl EventProcessor for QueueBridge {
    #[instrument(skip_all, fields(invocation_id = %invocation.id, queue = %self.queue_name))]
    async fn process(&mut self, invocation: &Invocation) -> Result<Value> {
        let records = invocation
            .payload
            .get("Records")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::BadRequestPayload("Records must be an array".to_string()))?;

        let mut failures = Vec::new();
        for record in records {
            let (message_id, retry) = self.run_record(record, invocation).await?;
            if retry {
                failures.push(json!({ "itemIdentifier": message_id }));
            }
        }

        info!(
            records = records.len(),
            failures = failures.len(),
            "Queue batch processed"
        );

        if failures.is_empty() {
            Ok(json!({}))
        } else {
            Ok(json!({ "batchItemFailures": failures }))
        }
    }
}
