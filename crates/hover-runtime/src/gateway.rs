// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker response to outward HTTP result.
//!
//! Produces the `{statusCode, headers, cookies, isBase64Encoded, body}` shape
//! the platform's HTTP front door expects.

use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Serialize;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::worker::WorkerResponse;

/// Content type assumed when the worker sends none.
pub const DEFAULT_CONTENT_TYPE: &str = "text/html";

/// Outward HTTP result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpResult {
    /// Values of every `Set-Cookie` header.
    pub cookies: Vec<String>,
    /// Whether `body` is base64.
    pub is_base64_encoded: bool,
    /// HTTP status code.
    pub status_code: u16,
    /// Title-cased header names, last value per name.
    pub headers: BTreeMap<String, String>,
    /// Body, raw or base64.
    pub body: String,
}

impl HttpResult {
    /// Build the outward result from a worker response.
    pub fn from_worker(response: &WorkerResponse) -> Result<Self> {
        let mut headers = BTreeMap::new();
        let mut cookies = Vec::new();

        for (name, values) in &response.headers {
            match name.as_str() {
                "status" => {}
                "set-cookie" => cookies.extend(values.iter().cloned()),
                _ => {
                    if let Some(value) = values.last() {
                        headers.insert(title_case(name), value.clone());
                    }
                }
            }
        }

        let content_type = headers
            .get("Content-Type")
            .map(String::as_str)
            .unwrap_or(DEFAULT_CONTENT_TYPE);
        let is_base64_encoded = requires_base64(content_type);

        let body = if is_base64_encoded {
            STANDARD.encode(&response.body)
        } else {
            String::from_utf8(response.body.to_vec()).map_err(|e| {
                Error::ResponseEncoding(format!(
                    "body declared as {} is not valid UTF-8: {}",
                    content_type, e
                ))
            })?
        };

        Ok(Self {
            cookies,
            is_base64_encoded,
            status_code: response.status,
            headers,
            body,
        })
    }

    /// JSON form reported to the control plane.
    pub fn into_value(self) -> Result<Value> {
        serde_json::to_value(self).map_err(|e| Error::ResponseEncoding(e.to_string()))
    }
}

/// Textual content types pass through as-is; everything else is base64.
pub fn requires_base64(content_type: &str) -> bool {
    let content_type = content_type.to_ascii_lowercase();
    !(content_type.starts_with("text/")
        || content_type.contains("xml")
        || content_type.contains("json"))
}

/// `x-request-id` → `X-Request-Id`.
fn title_case(name: &str) -> String {
    name.split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}
