// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Control-plane API client.
//!
//! Speaks the runtime API of the execution environment:
//!
//! | Call | Endpoint |
//! |------|----------|
//! | next invocation | `GET /2018-06-01/runtime/invocation/next` |
//! | success | `POST /2018-06-01/runtime/invocation/{id}/response` |
//! | failure | `POST /2018-06-01/runtime/invocation/{id}/error` |
//! | init failure | `POST /2018-06-01/runtime/init/error` |

use serde_json::Value;
use tracing::{debug, instrument};

use crate::deadline::Deadline;
use crate::error::{Error, ErrorReport, Result};

/// API version prefix.
const API_PREFIX: &str = "2018-06-01/runtime";

/// Header carrying the invocation id.
pub const REQUEST_ID_HEADER: &str = "lambda-runtime-aws-request-id";
/// Header carrying the deadline in epoch milliseconds.
pub const DEADLINE_HEADER: &str = "lambda-runtime-deadline-ms";
/// Header carrying the tracing id.
pub const TRACE_ID_HEADER: &str = "lambda-runtime-trace-id";
/// Header naming the error type on error reports.
pub const ERROR_TYPE_HEADER: &str = "lambda-runtime-function-error-type";

/// One unit of work fetched from the control plane.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Opaque invocation id.
    pub id: String,
    /// Absolute deadline.
    pub deadline: Deadline,
    /// Decoded payload. A body that is not JSON is kept as a JSON string.
    pub payload: Value,
    /// Tracing id, when the control plane sends one.
    pub trace_id: Option<String>,
}

impl Invocation {
    /// Invocation with the given payload and a deadline `budget_ms` from now.
    pub fn new(id: impl Into<String>, payload: Value, budget_ms: u64) -> Self {
        Self {
            id: id.into(),
            deadline: Deadline::after(std::time::Duration::from_millis(budget_ms)),
            payload,
            trace_id: None,
        }
    }
}

/// HTTP client for the control plane.
#[derive(Debug, Clone)]
pub struct ControlPlaneClient {
    client: reqwest::Client,
    base_url: String,
}

impl ControlPlaneClient {
    /// Create a client for `runtime_api` (`host:port`, or a full URL).
    ///
    /// No request timeout is set: polling blocks until work arrives.
    pub fn new(runtime_api: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::ControlPlane(format!("failed to build HTTP client: {}", e)))?;

        let root = if runtime_api.contains("://") {
            runtime_api.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", runtime_api.trim_end_matches('/'))
        };

        Ok(Self {
            client,
            base_url: format!("{}/{}", root, API_PREFIX),
        })
    }

    /// Base URL including the API version prefix.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Block until the next invocation is available.
    #[instrument(skip(self))]
    pub async fn poll_next(&self) -> Result<Invocation> {
        let url = format!("{}/invocation/next", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::ControlPlane(format!("failed to poll next invocation: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::ControlPlane(format!(
                "next invocation returned {}: {}",
                status, body
            )));
        }

        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };

        let id = header(REQUEST_ID_HEADER)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Error::ControlPlane("next invocation carries no request id".to_string()))?;
        let deadline_ms: i64 = header(DEADLINE_HEADER)
            .and_then(|v| v.trim().parse().ok())
            .ok_or_else(|| {
                Error::ControlPlane(format!("invocation {} carries no valid deadline", id))
            })?;
        let trace_id = header(TRACE_ID_HEADER);

        let body = response
            .bytes()
            .await
            .map_err(|e| Error::ControlPlane(format!("failed to read invocation body: {}", e)))?;
        if body.is_empty() {
            return Err(Error::ControlPlane(format!(
                "invocation {} has an empty body",
                id
            )));
        }

        let payload = serde_json::from_slice(&body)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&body).into_owned()));

        debug!(invocation_id = %id, deadline_ms = deadline_ms, "Received invocation");
        Ok(Invocation {
            id,
            deadline: Deadline::from_epoch_millis(deadline_ms),
            payload,
            trace_id,
        })
    }

    /// Report a successful result.
    #[instrument(skip(self, result))]
    pub async fn report_success(&self, id: &str, result: &Value) -> Result<()> {
        let body = serde_json::to_vec(result)
            .map_err(|e| Error::ResponseEncoding(e.to_string()))?;
        let url = format!("{}/invocation/{}/response", self.base_url, id);
        self.post(&url, body, None).await
    }

    /// Report a failed invocation.
    #[instrument(skip(self, report))]
    pub async fn report_error(&self, id: &str, report: &ErrorReport) -> Result<()> {
        let url = format!("{}/invocation/{}/error", self.base_url, id);
        self.post(&url, serde_json::to_vec(report)?, Some(&report.error_type))
            .await
    }

    /// Report that the runtime could not initialize.
    #[instrument(skip(self, report))]
    pub async fn report_init_failure(&self, report: &ErrorReport) -> Result<()> {
        let url = format!("{}/init/error", self.base_url);
        self.post(&url, serde_json::to_vec(report)?, Some(&report.error_type))
            .await
    }

    async fn post(&self, url: &str, body: Vec<u8>, error_type: Option<&str>) -> Result<()> {
        let mut request = self
            .client
            .post(url)
            .header("content-type", "application/json")
            .body(body);
        if let Some(error_type) = error_type {
            request = request.header(ERROR_TYPE_HEADER, error_type);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::ControlPlane(format!("POST {} failed: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::ControlPlane(format!(
                "POST {} returned {}: {}",
                url, status, body
            )));
        }
        Ok(())
    }
}
