// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Warm-container pre-provisioning.
//!
//! A scheduled `{"warmer": true, "containers": N}` invocation makes this
//! instance fire `N - 1` asynchronous self-invocations carrying
//! `{"warmer_ping": true}`, so the platform keeps that many execution
//! environments alive.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::sigv4::{self, Credentials, SignableRequest};

/// Payload sent to every warmed instance.
pub fn ping_payload() -> Value {
    json!({ "warmer_ping": true })
}

/// Fires an asynchronous invocation of this same function.
#[async_trait]
pub trait SelfInvoker: Send + Sync {
    /// Queue one invocation with `payload` without waiting for its result.
    async fn invoke_async(&self, payload: &Value) -> Result<()>;
}

/// Self-invocation through the function Invoke API with `Event` invocation
/// type.
pub struct LambdaInvoker {
    client: reqwest::Client,
    endpoint: String,
    function_name: String,
    qualifier: String,
    region: String,
    credentials: Option<Credentials>,
}

impl LambdaInvoker {
    /// HTTP timeout per invocation.
    pub const TIMEOUT: Duration = Duration::from_secs(5);

    /// Create an invoker for the given function.
    pub fn new(
        endpoint: impl Into<String>,
        function_name: impl Into<String>,
        qualifier: impl Into<String>,
        region: impl Into<String>,
        credentials: Option<Credentials>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Self::TIMEOUT)
            .connect_timeout(Self::TIMEOUT)
            .build()
            .map_err(|e| Error::Warmer(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            function_name: function_name.into(),
            qualifier: qualifier.into(),
            region: region.into(),
            credentials,
        })
    }

    /// Invoker for the running function.
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(
            &config.lambda_endpoint,
            &config.function_name,
            &config.function_version,
            &config.region,
            config.credentials.clone(),
        )
    }
}

#[async_trait]
impl SelfInvoker for LambdaInvoker {
    async fn invoke_async(&self, payload: &Value) -> Result<()> {
        let path = format!(
            "/2015-03-31/functions/{}/invocations",
            urlencoding::encode(&self.function_name)
        );
        let url = format!(
            "{}{}?Qualifier={}",
            self.endpoint,
            path,
            urlencoding::encode(&self.qualifier)
        );
        let parsed = url::Url::parse(&url)
            .map_err(|e| Error::Warmer(format!("invalid invoke URL {}: {}", url, e)))?;
        let host = match (parsed.host_str(), parsed.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => return Err(Error::Warmer(format!("invoke URL {} has no host", url))),
        };

        let body = serde_json::to_vec(payload)?;
        let mut request = self
            .client
            .post(parsed.clone())
            .header("content-type", "application/json")
            .header("x-amz-invocation-type", "Event")
            .header("x-amz-log-type", "None");

        if let Some(credentials) = &self.credentials {
            let signable = SignableRequest {
                method: "POST",
                host: &host,
                path: parsed.path(),
                query: &[("Qualifier", self.qualifier.as_str())],
                headers: &[],
                payload: &body,
            };
            for (name, value) in sigv4::sign(&signable, credentials, &self.region, "lambda", Utc::now()) {
                request = request.header(name, value);
            }
        } else {
            debug!("No credentials available, sending unsigned invocation");
        }

        let response = request
            .body(body)
            .send()
            .await
            .map_err(|e| Error::Warmer(format!("invoke request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::Warmer(format!(
                "invoke returned {}: {}",
                status, text
            )));
        }
        Ok(())
    }
}

/// Warm-pool scheduler.
#[derive(Clone)]
pub struct WarmPool {
    invoker: Arc<dyn SelfInvoker>,
}

impl WarmPool {
    /// Create a pool that fans out through `invoker`.
    pub fn new(invoker: Arc<dyn SelfInvoker>) -> Self {
        Self { invoker }
    }

    /// Fire `containers - 1` concurrent pings and wait for all of them to
    /// settle. Individual failures are logged, never returned.
    #[instrument(skip(self))]
    pub async fn warm_containers(&self, containers: u64) -> Value {
        info!(containers = containers, "Warming containers");

        let payload = ping_payload();
        let pings = (1..containers).map(|_| self.invoker.invoke_async(&payload));
        let results = join_all(pings).await;

        let failed = results.iter().filter(|r| r.is_err()).count();
        for error in results.iter().filter_map(|r| r.as_ref().err()) {
            warn!(error = %error, "Warming invocation failed");
        }
        if failed > 0 {
            warn!(failed = failed, "Some warming invocations failed");
        }
        info!(containers = containers, "Containers have been warmed");

        json!({ "output": "Warming done!" })
    }

    /// Answer a warm ping.
    pub async fn warm_container(&self) -> Value {
        tokio::time::sleep(Duration::from_millis(50)).await;
        info!("1 container warmed");
        json!({ "output": "Warmed!" })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts invocations; fails every `fail_every`-th one when set.
    struct CountingInvoker {
        calls: AtomicUsize,
        fail_every: Option<usize>,
    }

    #[async_trait]
    impl SelfInvoker for CountingInvoker {
        async fn invoke_async(&self, payload: &Value) -> Result<()> {
            assert_eq!(payload, &ping_payload());
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            match self.fail_every {
                Some(k) if n % k == 0 => Err(Error::Warmer("throttled".to_string())),
                _ => Ok(()),
            }
        }
    }

    fn pool(fail_every: Option<usize>) -> (WarmPool, Arc<CountingInvoker>) {
        let invoker = Arc::new(CountingInvoker {
            calls: AtomicUsize::new(0),
            fail_every,
        });
        (WarmPool::new(invoker.clone()), invoker)
    }

    #[tokio::test]
    async fn test_fans_out_n_minus_one() {
        let (pool, invoker) = pool(None);
        let result = pool.warm_containers(5).await;
        assert_eq!(result, json!({"output": "Warming done!"}));
        assert_eq!(invoker.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_single_container_needs_no_invocations() {
        let (pool, invoker) = pool(None);
        pool.warm_containers(1).await;
        pool.warm_containers(0).await;
        assert_eq!(invoker.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failures_do_not_fail_the_batch() {
        let (pool, invoker) = pool(Some(2));
        let result = pool.warm_containers(7).await;
        assert_eq!(result["output"], "Warming done!");
        assert_eq!(invoker.calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_warm_container_is_idempotent() {
        let (pool, invoker) = pool(None);
        let first = pool.warm_container().await;
        let second = pool.warm_container().await;
        assert_eq!(first, json!({"output": "Warmed!"}));
        assert_eq!(first, second);
        assert_eq!(invoker.calls.load(Ordering::SeqCst), 0);
    }
}
