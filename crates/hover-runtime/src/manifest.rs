// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Application manifest shipped alongside the deployed code.
//!
//! Only the parts the runtime needs are modelled: the application name and
//! the retry policy of each queue.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer};
use tracing::debug;

/// Attempts allowed when a queue does not configure `tries`.
pub const DEFAULT_TRIES: u32 = 1;

/// Errors reading the manifest.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    /// The file exists but could not be read.
    #[error("Failed to read manifest {path}: {source}")]
    Read {
        /// Manifest location.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// The file is not valid manifest JSON.
    #[error("Invalid manifest {path}: {source}")]
    Parse {
        /// Manifest location.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },
}

/// Parsed manifest.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Manifest {
    /// Application name, the prefix of every function name.
    #[serde(default)]
    pub name: Option<String>,
    /// Queue policies keyed by queue name.
    #[serde(default)]
    pub queue: BTreeMap<String, QueuePolicy>,
}

/// Per-queue settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct QueuePolicy {
    /// Memory of the queue function in MB.
    #[serde(default)]
    pub memory: Option<u32>,
    /// Timeout of the queue function in seconds.
    #[serde(default)]
    pub timeout: Option<u32>,
    /// Reserved concurrency.
    #[serde(default)]
    pub concurrency: Option<u32>,
    /// Maximum attempts per job.
    #[serde(default)]
    pub tries: Option<u32>,
    /// Seconds to wait before each retry, indexed by attempt.
    #[serde(default, deserialize_with = "deserialize_backoff")]
    pub backoff: Option<Vec<u64>>,
}

impl QueuePolicy {
    /// Attempts allowed, defaulting to one.
    pub fn tries(&self) -> u32 {
        self.tries.filter(|t| *t > 0).unwrap_or(DEFAULT_TRIES)
    }

    /// Backoff schedule, defaulting to no delay.
    pub fn backoff(&self) -> Vec<u64> {
        match &self.backoff {
            Some(list) if !list.is_empty() => list.clone(),
            _ => vec![0],
        }
    }
}

impl Manifest {
    /// Read the manifest. A missing file yields an empty manifest.
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No manifest found, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ManifestError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        Self::parse(&raw).map_err(|source| ManifestError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Parse manifest JSON.
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Policy for a queue; unknown queues get the defaults.
    pub fn queue_policy(&self, queue: &str) -> QueuePolicy {
        self.queue.get(queue).cloned().unwrap_or_default()
    }
}

/// Accepts `5`, `"5"`, `"5,10,30"` or `[5, 10, 30]`.
fn deserialize_backoff<'de, D>(deserializer: D) -> Result<Option<Vec<u64>>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error as _;

    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    let Some(value) = value else {
        return Ok(None);
    };

    let parse_item = |item: &serde_json::Value| -> Result<u64, D::Error> {
        match item {
            serde_json::Value::Number(n) => n
                .as_u64()
                .ok_or_else(|| D::Error::custom(format!("invalid backoff value: {}", n))),
            serde_json::Value::String(s) => s
                .trim()
                .parse()
                .map_err(|_| D::Error::custom(format!("invalid backoff value: {}", s))),
            other => Err(D::Error::custom(format!("invalid backoff value: {}", other))),
        }
    };

    match &value {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::Array(items) => items.iter().map(parse_item).collect::<Result<_, _>>().map(Some),
        serde_json::Value::String(s) if s.trim().is_empty() => Ok(None),
        serde_json::Value::String(s) => s
            .split(',')
            .map(|part| parse_item(&serde_json::Value::String(part.to_string())))
            .collect::<Result<_, _>>()
            .map(Some),
        other => parse_item(other).map(|v| Some(vec![v])),
    }
}
