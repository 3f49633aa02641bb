// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Event processors and the dispatcher.
//!
//! The dispatcher classifies each payload by the keys it carries and hands
//! the invocation to the processor configured for that kind:
//!
//! | Payload key | Kind | Processor |
//! |-------------|------|-----------|
//! | `warmer` | [`InvocationKind::WarmFanOut`] | HTTP |
//! | `warmer_ping` | [`InvocationKind::WarmPing`] | HTTP |
//! | `Records` | [`InvocationKind::Queue`] | Queue |
//! | `command` | [`InvocationKind::Cli`] | CLI |
//! | `requestContext` / `httpMethod` | [`InvocationKind::Http`] | HTTP |
//! | anything else | [`InvocationKind::Unknown`] | HTTP (rejects it) |

pub mod cli;
pub mod http;
pub mod queue;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};

use crate::config::{Config, FunctionRole};
use crate::control_plane::Invocation;
use crate::error::{Error, Result};
use crate::manifest::Manifest;
use crate::queue::CommandJobHandler;
use crate::warmer::{LambdaInvoker, WarmPool};
use crate::worker::{WorkerConfig, WorkerProcessManager};

pub use cli::CliProcessor;
pub use http::HttpProcessor;
pub use queue::QueueBridge;

/// Handles one kind of invocation.
#[async_trait]
pub trait EventProcessor: Send {
    /// Process an invocation and produce its result.
    async fn process(&mut self, invocation: &Invocation) -> Result<Value>;

    /// Release resources at teardown.
    async fn shutdown(&mut self) {}
}

/// Shape of an invocation payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationKind {
    /// Fan out warm pings.
    WarmFanOut,
    /// Keep this instance warm.
    WarmPing,
    /// HTTP request.
    Http,
    /// Console command.
    Cli,
    /// Queue batch.
    Queue,
    /// Nothing recognizable.
    Unknown,
}

impl InvocationKind {
    /// Classify a payload by key presence.
    pub fn classify(payload: &Value) -> Self {
        let has = |key: &str| payload.get(key).is_some();
        if has("warmer") {
            InvocationKind::WarmFanOut
        } else if has("warmer_ping") {
            InvocationKind::WarmPing
        } else if has("Records") {
            InvocationKind::Queue
        } else if has("command") {
            InvocationKind::Cli
        } else if has("requestContext") || has("httpMethod") {
            InvocationKind::Http
        } else {
            InvocationKind::Unknown
        }
    }
}

/// Routes invocations to processors.
#[derive(Default)]
pub struct Dispatcher {
    http: Option<Box<dyn EventProcessor>>,
    cli: Option<Box<dyn EventProcessor>>,
    queue: Option<Box<dyn EventProcessor>>,
}

impl Dispatcher {
    /// Dispatcher with no processors.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the HTTP processor (also serves warm-pool payloads).
    pub fn with_http(mut self, processor: impl EventProcessor + 'static) -> Self {
        self.http = Some(Box::new(processor));
        self
    }

    /// Set the CLI processor.
    pub fn with_cli(mut self, processor: impl EventProcessor + 'static) -> Self {
        self.cli = Some(Box::new(processor));
        self
    }

    /// Set the queue processor.
    pub fn with_queue(mut self, processor: impl EventProcessor + 'static) -> Self {
        self.queue = Some(Box::new(processor));
        self
    }

    /// Build the processors for the configured role, starting the worker
    /// process when HTTP is served.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let manifest = Manifest::load(&config.manifest_path).map_err(crate::config::ConfigError::from)?;
        let app_name = config.resolve_app_name(manifest.name.as_deref());
        let role = config.effective_role();
        info!(
            app = %app_name,
            role = role.map(|r| r.as_str()).unwrap_or("all"),
            function = %config.function_name,
            "Configuring processors"
        );

        let mut dispatcher = Self::new();

        if matches!(role, None | Some(FunctionRole::Http)) {
            let mut manager = WorkerProcessManager::new(WorkerConfig::from_config(config));
            manager.start().await?;
            let warm_pool = WarmPool::new(Arc::new(LambdaInvoker::from_config(config)?));
            dispatcher = dispatcher.with_http(HttpProcessor::new(
                Box::new(manager),
                warm_pool,
                config.script_filename.display().to_string(),
            ));
        }

        if matches!(role, None | Some(FunctionRole::Cli)) {
            dispatcher = dispatcher.with_cli(CliProcessor::new(&config.cli_entrypoint));
        }

        if matches!(role, None | Some(FunctionRole::Queue)) {
            let queue_name = QueueBridge::queue_name_for(&config.function_name, &app_name);
            let policy = manifest.queue_policy(&queue_name);
            dispatcher = dispatcher.with_queue(QueueBridge::new(
                queue_name,
                policy,
                Arc::new(CommandJobHandler::new(&config.queue_command)),
            ));
        }

        Ok(dispatcher)
    }

    /// Classify and process one invocation.
    pub async fn dispatch(&mut self, invocation: &Invocation) -> Result<Value> {
        let kind = InvocationKind::classify(&invocation.payload);
        debug!(invocation_id = %invocation.id, kind = ?kind, "Dispatching invocation");

        let processor = match kind {
            InvocationKind::WarmFanOut
            | InvocationKind::WarmPing
            | InvocationKind::Http
            | InvocationKind::Unknown => self.http.as_mut(),
            InvocationKind::Cli => self.cli.as_mut(),
            InvocationKind::Queue => self.queue.as_mut(),
        };

        match processor {
            Some(processor) => processor.process(invocation).await,
            None => Err(Error::UnexpectedInvocationType(format!(
                "no processor handles {:?} invocations in this function",
                kind
            ))),
        }
    }

    /// Shut every processor down.
    pub async fn shutdown(&mut self) {
        for processor in [&mut self.http, &mut self.cli, &mut self.queue]
            .into_iter()
            .flatten()
        {
            processor.shutdown().await;
        }
    }
}
