// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Queue job model.

use serde::Serialize;
use serde_json::{Value, json};

use super::QueueError;

/// Where a job came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueIdentity {
    /// Region of the queue.
    pub region: String,
    /// Owning account id.
    pub account_id: String,
    /// Queue name.
    pub name: String,
    /// Queue URL.
    pub url: String,
}

impl QueueIdentity {
    /// Derive the identity from an event source ARN
    /// (`arn:aws:sqs:{region}:{account}:{name}`) and the record's region.
    pub fn from_arn(arn: &str, region: &str) -> Result<Self, QueueError> {
        let parts: Vec<&str> = arn.split(':').collect();
        if parts.len() < 6 || parts[4].is_empty() || parts[5].is_empty() {
            return Err(QueueError::InvalidRecord(format!(
                "malformed eventSourceARN: {}",
                arn
            )));
        }
        let region = if region.is_empty() { parts[3] } else { region };

        Ok(Self {
            region: region.to_string(),
            account_id: parts[4].to_string(),
            name: parts[5].to_string(),
            url: format!(
                "https://sqs.{}.amazonaws.com/{}/{}",
                region, parts[4], parts[5]
            ),
        })
    }
}

/// Outcome of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    /// Not processed yet.
    Pending,
    /// Handled successfully.
    Completed,
    /// Handed back to the queue for another attempt after `delay` seconds.
    Released {
        /// Seconds before the next attempt.
        delay: u64,
    },
    /// Attempts exhausted.
    Failed {
        /// Why the job gave up.
        reason: String,
    },
}

/// One message received from a queue.
#[derive(Debug, Clone)]
pub struct QueueJob {
    /// Message id, reported back as the batch item identifier.
    pub message_id: String,
    /// Receipt handle of this delivery.
    pub receipt_handle: String,
    /// Raw message body.
    pub body: String,
    /// System attributes.
    pub attributes: Value,
    /// User attributes.
    pub message_attributes: Value,
    /// Source queue.
    pub queue: QueueIdentity,
    /// Delivery count, starting at 1.
    pub attempts: u32,
    /// Current outcome.
    pub state: JobState,
}

impl QueueJob {
    /// Build a job from one batch record.
    pub fn from_record(record: &Value) -> Result<Self, QueueError> {
        let field = |name: &str| -> Result<String, QueueError> {
            record
                .get(name)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| QueueError::InvalidRecord(format!("record is missing {}", name)))
        };

        let attributes = record.get("attributes").cloned().unwrap_or_else(|| json!({}));
        let attempts = attributes
            .get("ApproximateReceiveCount")
            .and_then(|v| match v {
                Value::String(s) => s.parse().ok(),
                Value::Number(n) => n.as_u64().map(|n| n as u32),
                _ => None,
            })
            .unwrap_or(1)
            .max(1);

        let region = record
            .get("awsRegion")
            .and_then(Value::as_str)
            .unwrap_or_default();

        Ok(Self {
            message_id: field("messageId")?,
            receipt_handle: field("receiptHandle").unwrap_or_default(),
            body: record
                .get("body")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            attributes,
            message_attributes: record
                .get("messageAttributes")
                .cloned()
                .unwrap_or_else(|| json!({})),
            queue: QueueIdentity::from_arn(&field("eventSourceARN")?, region)?,
            attempts,
            state: JobState::Pending,
        })
    }

    /// Body parsed as JSON, when it is JSON.
    fn body_json(&self) -> Option<Value> {
        serde_json::from_str(&self.body).ok()
    }

    /// Timeout in seconds requested by the job itself.
    pub fn timeout(&self) -> Option<u64> {
        self.body_json()?.get("timeout")?.as_u64()
    }

    /// Maximum attempts requested by the job itself.
    pub fn max_tries(&self) -> Option<u32> {
        self.body_json()?
            .get("maxTries")?
            .as_u64()
            .map(|n| n as u32)
    }

    /// Mark as successfully handled.
    pub fn complete(&mut self) {
        self.state = JobState::Completed;
    }

    /// Hand the job back for another attempt.
    pub fn release(&mut self, delay: u64) {
        self.state = JobState::Released { delay };
    }

    /// Give up on the job.
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.state = JobState::Failed {
            reason: reason.into(),
        };
    }

    /// Whether the job was released.
    pub fn is_released(&self) -> bool {
        matches!(self.state, JobState::Released { .. })
    }

    /// Whether the job failed permanently.
    pub fn has_failed(&self) -> bool {
        matches!(self.state, JobState::Failed { .. })
    }

    /// JSON handed to the job handler.
    pub fn to_payload(&self) -> Value {
        json!({
            "messageId": self.message_id,
            "receiptHandle": self.receipt_handle,
            "body": self.body,
            "attributes": self.attributes,
            "messageAttributes": self.message_attributes,
            "queue": self.queue,
            "attempts": self.attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> Value {
        json!({
            "messageId": "059f36b4-87a3-44ab-83d2-661975830a7d",
            "receiptHandle": "AQEBwJnKyrHigUMZj6rYigCgxlaS3SLy0a",
            "body": "{\"job\":\"SendEmail\",\"timeout\":30,\"maxTries\":4}",
            "attributes": {"ApproximateReceiveCount": "2"},
            "messageAttributes": {},
            "eventSourceARN": "arn:aws:sqs:eu-central-1:123456789012:shop-emails",
            "awsRegion": "eu-central-1"
        })
    }

    #[test]
    fn test_from_record() {
        let job = QueueJob::from_record(&record()).unwrap();
        assert_eq!(job.message_id, "059f36b4-87a3-44ab-83d2-661975830a7d");
        assert_eq!(job.attempts, 2);
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(
            job.queue.url,
            "https://sqs.eu-central-1.amazonaws.com/123456789012/shop-emails"
        );
        assert_eq!(job.timeout(), Some(30));
        assert_eq!(job.max_tries(), Some(4));
    }

    #[test]
    fn test_missing_message_id_is_invalid() {
        let mut record = record();
        record.as_object_mut().unwrap().remove("messageId");
        assert!(matches!(
            QueueJob::from_record(&record),
            Err(QueueError::InvalidRecord(_))
        ));
    }

    #[test]
    fn test_malformed_arn() {
        assert!(QueueIdentity::from_arn("arn:aws:sqs", "us-east-1").is_err());
    }

    #[test]
    fn test_arn_region_fallback() {
        let identity = QueueIdentity::from_arn("arn:aws:sqs:us-west-2:1:q", "").unwrap();
        assert_eq!(identity.region, "us-west-2");
        assert_eq!(identity.url, "https://sqs.us-west-2.amazonaws.com/1/q");
    }

    #[test]
    fn test_state_transitions() {
        let mut job = QueueJob::from_record(&record()).unwrap();
        job.release(10);
        assert!(job.is_released());
        job.fail("boom");
        assert!(job.has_failed());
        assert!(!job.is_released());
        job.complete();
        assert_eq!(job.state, JobState::Completed);
    }

    #[test]
    fn test_non_json_body_has_no_overrides() {
        let mut record = record();
        record["body"] = json!("plain text");
        let job = QueueJob::from_record(&record).unwrap();
        assert_eq!(job.timeout(), None);
        assert_eq!(job.max_tries(), None);
        assert_eq!(job.to_payload()["body"], "plain text");
    }
}
