// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP processor: bridges requests to the worker and serves warm-pool
//! payloads.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use super::{EventProcessor, InvocationKind};
use crate::control_plane::Invocation;
use crate::error::{Error, Result};
use crate::gateway::HttpResult;
use crate::warmer::WarmPool;
use crate::worker::{WorkerBridge, WorkerResponse, build_request};

/// Serves HTTP-shaped invocations.
pub struct HttpProcessor {
    worker: Box<dyn WorkerBridge>,
    warm_pool: WarmPool,
    script_filename: String,
    /// Set once the worker has been sent any request, including the priming
    /// request of a first warm ping.
    worker_exercised: bool,
}

impl HttpProcessor {
    /// Create a processor around an already started worker.
    pub fn new(worker: Box<dyn WorkerBridge>, warm_pool: WarmPool, script_filename: String) -> Self {
        Self {
            worker,
            warm_pool,
            script_filename,
            worker_exercised: false,
        }
    }

    async fn forward(&mut self, invocation: &Invocation) -> Result<WorkerResponse> {
        self.worker_exercised = true;

        let mut extra_env = BTreeMap::new();
        extra_env.insert("AWS_REQUEST_ID".to_string(), invocation.id.clone());
        extra_env.insert(
            "AWS_REQUEST_DEADLINE".to_string(),
            invocation.deadline.epoch_millis().to_string(),
        );
        extra_env.insert("SCRIPT_FILENAME".to_string(), self.script_filename.clone());

        let request = build_request(&invocation.payload, &extra_env)?;
        let timeout_ms = invocation.deadline.remaining_millis();
        Ok(self.worker.send_request(&request, timeout_ms).await?)
    }
}

#[async_trait]
impl EventProcessor for HttpProcessor {
    #[instrument(skip_all, fields(invocation_id = %invocation.id))]
    async fn process(&mut self, invocation: &Invocation) -> Result<Value> {
        let payload = &invocation.payload;

        match InvocationKind::classify(payload) {
            InvocationKind::WarmFanOut => {
                let containers = payload
                    .get("containers")
                    .and_then(|v| v.as_u64().or_else(|| v.as_str()?.parse().ok()))
                    .unwrap_or(1);
                Ok(self.warm_pool.warm_containers(containers).await)
            }
            InvocationKind::WarmPing => {
                if !self.worker_exercised {
                    // Prime the worker (opcache, autoloader) on a fresh instance
                    match self.forward(invocation).await {
                        Ok(response) => {
                            debug!(status = response.status, "Priming request served")
                        }
                        Err(e) => warn!(error = %e, "Priming request failed"),
                    }
                }
                Ok(self.warm_pool.warm_container().await)
            }
            _ => {
                if payload.get("requestContext").is_none() {
                    return Err(Error::UnexpectedInvocationType(
                        "HTTP invocation without requestContext".to_string(),
                    ));
                }
                let response = self.forward(invocation).await?;
                HttpResult::from_worker(&response)?.into_value()
            }
        }
    }

    async fn shutdown(&mut self) {
        self.worker.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::warmer::SelfInvoker;
    use crate::worker::{WorkerError, WorkerRequest};
    use bytes::Bytes;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    /// Records requests and answers with a fixed response.
    struct MockWorker {
        requests: Arc<Mutex<Vec<(WorkerRequest, i64)>>>,
        fail: bool,
    }

    #[async_trait]
    impl WorkerBridge for MockWorker {
        async fn send_request(
            &mut self,
            request: &WorkerRequest,
            timeout_ms: i64,
        ) -> std::result::Result<WorkerResponse, WorkerError> {
            self.requests
                .lock()
                .unwrap()
                .push((request.clone(), timeout_ms));
            if self.fail {
                return Err(WorkerError::Timeout { margin_secs: 1 });
            }
            let mut headers = BTreeMap::new();
            headers.insert("content-type".to_string(), vec!["application/json".to_string()]);
            Ok(WorkerResponse {
                status: 201,
                headers,
                body: Bytes::from_static(b"{\"ok\":true}"),
            })
        }
    }

    struct NoopInvoker;

    #[async_trait]
    impl SelfInvoker for NoopInvoker {
        async fn invoke_async(&self, _payload: &Value) -> Result<()> {
            Ok(())
        }
    }

    fn processor(fail: bool) -> (HttpProcessor, Arc<Mutex<Vec<(WorkerRequest, i64)>>>) {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let worker = MockWorker {
            requests: requests.clone(),
            fail,
        };
        let processor = HttpProcessor::new(
            Box::new(worker),
            WarmPool::new(Arc::new(NoopInvoker)),
            "/var/task/hover_runtime/index.php".to_string(),
        );
        (processor, requests)
    }

    #[tokio::test]
    async fn test_request_is_bridged_and_transformed() {
        let (mut processor, requests) = processor(false);
        let invocation = Invocation::new(
            "req-1",
            json!({"rawPath": "/orders", "requestContext": {"http": {"method": "POST"}}}),
            30_000,
        );

        let result = processor.process(&invocation).await.unwrap();
        assert_eq!(result["statusCode"], 201);
        assert_eq!(result["body"], "{\"ok\":true}");
        assert_eq!(result["isBase64Encoded"], false);

        let requests = requests.lock().unwrap();
        let (request, timeout_ms) = &requests[0];
        assert_eq!(request.env["AWS_REQUEST_ID"], "req-1");
        assert_eq!(
            request.env["AWS_REQUEST_DEADLINE"],
            invocation.deadline.epoch_millis().to_string()
        );
        assert_eq!(request.env["SCRIPT_FILENAME"], "/var/task/hover_runtime/index.php");
        assert!(*timeout_ms <= 30_000 && *timeout_ms > 25_000);
    }

    #[tokio::test]
    async fn test_missing_request_context_is_rejected() {
        let (mut processor, requests) = processor(false);
        let result = processor
            .process(&Invocation::new("req-2", json!({"httpMethod": "GET"}), 30_000))
            .await;

        assert!(matches!(result, Err(Error::UnexpectedInvocationType(_))));
        assert!(requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_first_ping_primes_worker_once() {
        let (mut processor, requests) = processor(false);
        let ping = Invocation::new("ping", json!({"warmer_ping": true}), 30_000);

        let first = processor.process(&ping).await.unwrap();
        let second = processor.process(&ping).await.unwrap();

        assert_eq!(first, json!({"output": "Warmed!"}));
        assert_eq!(first, second);
        let requests = requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].0.uri, crate::worker::request::DEFAULT_PATH);
    }

    #[tokio::test]
    async fn test_ping_after_real_request_does_not_prime() {
        let (mut processor, requests) = processor(false);
        processor
            .process(&Invocation::new("r", json!({"requestContext": {}}), 30_000))
            .await
            .unwrap();
        processor
            .process(&Invocation::new("p", json!({"warmer_ping": true}), 30_000))
            .await
            .unwrap();

        assert_eq!(requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_priming_failure_is_swallowed() {
        let (mut processor, _) = processor(true);
        let result = processor
            .process(&Invocation::new("p", json!({"warmer_ping": true}), 30_000))
            .await
            .unwrap();
        assert_eq!(result["output"], "Warmed!");
    }

    #[tokio::test]
    async fn test_worker_error_propagates() {
        let (mut processor, _) = processor(true);
        let result = processor
            .process(&Invocation::new("r", json!({"requestContext": {}}), 30_000))
            .await;
        match result {
            Err(e) => assert_eq!(e.error_type(), "WorkerTimeoutError"),
            Ok(v) => panic!("Expected error, got {}", v),
        }
    }

    #[tokio::test]
    async fn test_warm_fan_out() {
        let (mut processor, requests) = processor(false);
        let result = processor
            .process(&Invocation::new(
                "w",
                json!({"warmer": true, "containers": 3}),
                30_000,
            ))
            .await
            .unwrap();
        assert_eq!(result, json!({"output": "Warming done!"}));
        assert!(requests.lock().unwrap().is_empty());
    }
}
