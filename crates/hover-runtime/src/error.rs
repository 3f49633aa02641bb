// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for the hover runtime.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::worker::WorkerError;

/// Runtime errors.
///
/// Every variant maps to a stable [`Error::error_type`] string which is sent
/// to the control plane as `errorType`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Polling or reporting to the control plane failed.
    #[error("Control plane error: {0}")]
    ControlPlane(String),

    /// Worker process lifecycle or request bridging failed.
    #[error(transparent)]
    Worker(#[from] WorkerError),

    /// The payload does not match any shape this function handles.
    #[error("Unexpected invocation type: {0}")]
    UnexpectedInvocationType(String),

    /// The payload looked like a request but could not be decoded.
    #[error("Bad request payload: {0}")]
    BadRequestPayload(String),

    /// A CLI invocation ran out of time.
    #[error("CLI command timed out {0} second(s) before the deadline")]
    CommandTimedOut(u64),

    /// The result could not be represented as JSON.
    #[error("Error encoding the response into JSON: {0}")]
    ResponseEncoding(String),

    /// The queue job runner failed outside of the job's own retry accounting.
    #[error("Queue error: {0}")]
    Queue(#[from] crate::queue::QueueError),

    /// Self-invocation for warming failed.
    #[error("Warmer error: {0}")]
    Warmer(String),

    /// Processing panicked.
    #[error("Invocation handler panicked: {0}")]
    Panic(String),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Stable name reported as `errorType`.
    pub fn error_type(&self) -> &'static str {
        match self {
            Error::Config(_) => "ConfigError",
            Error::ControlPlane(_) => "ControlPlaneError",
            Error::Worker(e) => e.error_type(),
            Error::UnexpectedInvocationType(_) => "UnexpectedInvocationType",
            Error::BadRequestPayload(_) => "BadRequestPayload",
            Error::CommandTimedOut(_) => "CommandTimedOut",
            Error::ResponseEncoding(_) => "ResponseEncodingError",
            Error::Queue(_) => "QueueError",
            Error::Warmer(_) => "WarmerError",
            Error::Panic(_) => "Panic",
            Error::Io(_) => "IoError",
            Error::Json(_) => "JsonError",
        }
    }
}

/// Result type using the runtime [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Structured error payload posted to the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    /// Human readable message.
    pub error_message: String,
    /// Stable error kind.
    pub error_type: String,
    /// The error followed by its chain of causes, one per line.
    pub stack_trace: Vec<String>,
}

impl From<&Error> for ErrorReport {
    fn from(error: &Error) -> Self {
        let mut stack_trace = vec![format!("{}: {}", error.error_type(), error)];
        let mut source = std::error::Error::source(error);
        while let Some(cause) = source {
            stack_trace.push(format!("caused by: {}", cause));
            source = cause.source();
        }

        Self {
            error_message: error.to_string(),
            error_type: error.error_type().to_string(),
            stack_trace,
        }
    }
}
