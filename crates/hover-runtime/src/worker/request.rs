// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP-shaped payload to worker request adapter.
//!
//! Pure translation: nothing here touches the worker process. Both the v2
//! (`rawPath`, `rawQueryString`, `cookies`) and v1 (`path`,
//! `queryStringParameters`, `multiValueHeaders`) payload layouts are
//! understood.

use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use serde_json::Value;

use crate::error::{Error, Result};

/// Path used when the payload carries none.
pub const DEFAULT_PATH: &str = "/hover-dummy-route";

/// One request ready to be sent to the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerRequest {
    /// Upper-case HTTP method.
    pub method: String,
    /// Request path without query string.
    pub uri: String,
    /// Normalized query string, possibly empty.
    pub query_string: String,
    /// Headers keyed by lower-case name.
    pub headers: BTreeMap<String, String>,
    /// Decoded body.
    pub body: Bytes,
    /// Complete CGI environment.
    pub env: BTreeMap<String, String>,
}

impl WorkerRequest {
    /// FastCGI form of this request.
    pub fn to_fastcgi(&self) -> hover_fastcgi::Request {
        hover_fastcgi::Request {
            params: self
                .env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            stdin: self.body.clone(),
        }
    }
}

/// Build a [`WorkerRequest`] from an HTTP-shaped payload.
///
/// `extra_env` is merged under the generated variables: fixed CGI variables
/// win over `HTTP_*` variables, which win over `extra_env`.
pub fn build_request(event: &Value, extra_env: &BTreeMap<String, String>) -> Result<WorkerRequest> {
    let headers = collect_headers(event);
    let body = decode_body(event)?;

    let method = event
        .get("httpMethod")
        .and_then(Value::as_str)
        .or_else(|| event.pointer("/requestContext/http/method").and_then(Value::as_str))
        .unwrap_or("GET")
        .to_ascii_uppercase();

    let uri = event
        .get("rawPath")
        .and_then(Value::as_str)
        .or_else(|| event.get("path").and_then(Value::as_str))
        .filter(|p| !p.is_empty())
        .unwrap_or(DEFAULT_PATH)
        .to_string();

    let query_string = query_string(event);

    let mut env = extra_env.clone();
    for (name, value) in &headers {
        env.insert(
            format!("HTTP_{}", name.replace('-', "_").to_ascii_uppercase()),
            value.clone(),
        );
    }

    let port = headers
        .get("x-forwarded-port")
        .cloned()
        .unwrap_or_else(|| "80".to_string());
    let request_uri = if query_string.is_empty() {
        uri.clone()
    } else {
        format!("{}?{}", uri, query_string)
    };
    let protocol = event
        .pointer("/requestContext/http/protocol")
        .or_else(|| event.pointer("/requestContext/protocol"))
        .and_then(Value::as_str)
        .unwrap_or("HTTP/1.1");

    let fixed = [
        ("GATEWAY_INTERFACE", "FastCGI/1.0".to_string()),
        ("REQUEST_METHOD", method.clone()),
        ("REQUEST_URI", request_uri),
        ("SERVER_SOFTWARE", "hover".to_string()),
        ("REMOTE_ADDR", "127.0.0.1".to_string()),
        ("REMOTE_PORT", port.clone()),
        ("SERVER_ADDR", "127.0.0.1".to_string()),
        ("SERVER_PORT", port),
        (
            "SERVER_NAME",
            headers
                .get("host")
                .cloned()
                .unwrap_or_else(|| "localhost".to_string()),
        ),
        ("SERVER_PROTOCOL", protocol.to_string()),
        (
            "CONTENT_TYPE",
            headers.get("content-type").cloned().unwrap_or_default(),
        ),
        ("CONTENT_LENGTH", body.len().to_string()),
        ("PATH_INFO", uri.clone()),
        ("QUERY_STRING", query_string.clone()),
    ];
    for (name, value) in fixed {
        env.insert(name.to_string(), value);
    }

    Ok(WorkerRequest {
        method,
        uri,
        query_string,
        headers,
        body,
        env,
    })
}

fn header_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => items.last().and_then(header_value),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

/// Lower-cased headers; when names collide the last one seen wins.
fn collect_headers(event: &Value) -> BTreeMap<String, String> {
    let mut headers = BTreeMap::new();

    for key in ["multiValueHeaders", "headers"] {
        if let Some(map) = event.get(key).and_then(Value::as_object) {
            for (name, value) in map {
                if let Some(value) = header_value(value) {
                    headers.insert(name.to_ascii_lowercase(), value);
                }
            }
        }
    }

    if let Some(cookies) = event.get("cookies").and_then(Value::as_array) {
        let cookies: Vec<&str> = cookies.iter().filter_map(Value::as_str).collect();
        if !cookies.is_empty() {
            headers.insert("cookie".to_string(), cookies.join("; "));
        }
    }

    headers
}

fn decode_body(event: &Value) -> Result<Bytes> {
    let body = event.get("body").and_then(Value::as_str).unwrap_or("");
    let encoded = event
        .get("isBase64Encoded")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    if encoded {
        STANDARD
            .decode(body)
            .map(Bytes::from)
            .map_err(|e| Error::BadRequestPayload(format!("body is not valid base64: {}", e)))
    } else {
        Ok(Bytes::copy_from_slice(body.as_bytes()))
    }
}

fn query_string(event: &Value) -> String {
    if let Some(raw) = event.get("rawQueryString").and_then(Value::as_str) {
        let pairs = url::form_urlencoded::parse(raw.as_bytes())
            .map(|(k, v)| (k.into_owned(), v.into_owned()));
        return normalize_query(pairs);
    }

    let mut pairs = Vec::new();
    if let Some(multi) = event
        .get("multiValueQueryStringParameters")
        .and_then(Value::as_object)
    {
        for (name, values) in multi {
            if let Some(values) = values.as_array() {
                for value in values.iter().filter_map(Value::as_str) {
                    pairs.push((name.clone(), value.to_string()));
                }
            }
        }
    } else if let Some(single) = event
        .get("queryStringParameters")
        .and_then(Value::as_object)
    {
        for (name, value) in single {
            if let Some(value) = header_value(value) {
                pairs.push((name.clone(), value));
            }
        }
    }
    normalize_query(pairs.into_iter())
}

/// Parse-then-rebuild: a repeated plain key keeps its first position and its
/// last value, `name[]` keys keep every value.
fn normalize_query(pairs: impl Iterator<Item = (String, String)>) -> String {
    let mut normalized: Vec<(String, String)> = Vec::new();
    for (name, value) in pairs {
        if name.is_empty() {
            continue;
        }
        if !name.ends_with("[]")
            && let Some(existing) = normalized.iter_mut().find(|(n, _)| *n == name)
        {
            existing.1 = value;
            continue;
        }
        normalized.push((name, value));
    }

    url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(normalized)
        .finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn build(event: Value) -> WorkerRequest {
        build_request(&event, &BTreeMap::new()).unwrap()
    }

    // ===== Headers =====

    #[test]
    fn test_headers_are_lower_cased_last_value_wins() {
        let request = build(json!({
            "headers": {
                "X-Trace": "first",
                "x-trace": "second",
                "Accept": ["text/html", "application/json"]
            },
            "requestContext": {}
        }));

        assert_eq!(request.headers["x-trace"], "second");
        assert_eq!(request.headers["accept"], "application/json");
        assert!(request.headers.keys().all(|k| *k == k.to_ascii_lowercase()));
        assert_eq!(request.env["HTTP_X_TRACE"], "second");
    }

    #[test]
    fn test_cookies_fold_into_cookie_header() {
        let request = build(json!({
            "headers": {"Cookie": "ignored=1"},
            "cookies": ["a=1", "b=2"]
        }));
        assert_eq!(request.headers["cookie"], "a=1; b=2");
        assert_eq!(request.env["HTTP_COOKIE"], "a=1; b=2");
    }

    #[test]
    fn test_multi_value_headers() {
        let request = build(json!({
            "multiValueHeaders": {"X-Forwarded-For": ["1.1.1.1", "2.2.2.2"]}
        }));
        assert_eq!(request.headers["x-forwarded-for"], "2.2.2.2");
    }

    // ===== Body =====

    #[test]
    fn test_base64_body_is_decoded() {
        let request = build(json!({
            "body": STANDARD.encode([0u8, 159, 146, 150]),
            "isBase64Encoded": true
        }));
        assert_eq!(&request.body[..], &[0u8, 159, 146, 150]);
        assert_eq!(request.env["CONTENT_LENGTH"], "4");
    }

    #[test]
    fn test_plain_body_is_kept() {
        let request = build(json!({"body": "aGVsbG8=", "isBase64Encoded": false}));
        assert_eq!(&request.body[..], b"aGVsbG8=");
    }

    #[test]
    fn test_invalid_base64_is_bad_request() {
        let result = build_request(
            &json!({"body": "***", "isBase64Encoded": true}),
            &BTreeMap::new(),
        );
        assert!(matches!(result, Err(Error::BadRequestPayload(_))));
    }

    // ===== Method, path, query =====

    #[test]
    fn test_method_precedence() {
        assert_eq!(build(json!({})).method, "GET");
        assert_eq!(
            build(json!({"requestContext": {"http": {"method": "post"}}})).method,
            "POST"
        );
        assert_eq!(
            build(json!({
                "httpMethod": "DELETE",
                "requestContext": {"http": {"method": "POST"}}
            }))
            .method,
            "DELETE"
        );
    }

    #[test]
    fn test_default_path() {
        let request = build(json!({}));
        assert_eq!(request.uri, DEFAULT_PATH);
        assert_eq!(request.env["REQUEST_URI"], DEFAULT_PATH);
        assert_eq!(request.env["PATH_INFO"], DEFAULT_PATH);
    }

    #[test]
    fn test_query_string_is_normalized() {
        let request = build(json!({
            "rawPath": "/search",
            "rawQueryString": "q=one&page=2&q=two&tag[]=a&tag[]=b&flag"
        }));
        assert_eq!(request.query_string, "q=two&page=2&tag%5B%5D=a&tag%5B%5D=b&flag=");
        assert_eq!(
            request.env["REQUEST_URI"],
            format!("/search?{}", request.query_string)
        );
        assert_eq!(request.env["QUERY_STRING"], request.query_string);
    }

    #[test]
    fn test_v1_query_parameters() {
        let request = build(json!({
            "httpMethod": "GET",
            "path": "/v1",
            "queryStringParameters": {"a": "1 2"}
        }));
        assert_eq!(request.uri, "/v1");
        assert_eq!(request.query_string, "a=1+2");
    }

    // ===== Environment =====

    #[test]
    fn test_fixed_variables() {
        let request = build(json!({
            "rawPath": "/",
            "headers": {"Host": "example.com", "X-Forwarded-Port": "443", "Content-Type": "application/json"},
            "requestContext": {"http": {"method": "GET", "protocol": "HTTP/2"}}
        }));

        assert_eq!(request.env["GATEWAY_INTERFACE"], "FastCGI/1.0");
        assert_eq!(request.env["SERVER_SOFTWARE"], "hover");
        assert_eq!(request.env["REMOTE_ADDR"], "127.0.0.1");
        assert_eq!(request.env["SERVER_ADDR"], "127.0.0.1");
        assert_eq!(request.env["SERVER_PORT"], "443");
        assert_eq!(request.env["REMOTE_PORT"], "443");
        assert_eq!(request.env["SERVER_NAME"], "example.com");
        assert_eq!(request.env["SERVER_PROTOCOL"], "HTTP/2");
        assert_eq!(request.env["CONTENT_TYPE"], "application/json");
        assert_eq!(request.env["CONTENT_LENGTH"], "0");
        assert_eq!(request.env["QUERY_STRING"], "");
    }

    #[test]
    fn test_fixed_variables_win_over_extra_env() {
        let mut extra = BTreeMap::new();
        extra.insert("REQUEST_METHOD".to_string(), "TRACE".to_string());
        extra.insert("AWS_REQUEST_ID".to_string(), "req-1".to_string());

        let request = build_request(&json!({"httpMethod": "PUT"}), &extra).unwrap();
        assert_eq!(request.env["REQUEST_METHOD"], "PUT");
        assert_eq!(request.env["AWS_REQUEST_ID"], "req-1");
    }

    #[test]
    fn test_to_fastcgi_carries_env_and_body() {
        let request = build(json!({"body": "hi", "httpMethod": "POST"}));
        let fcgi = request.to_fastcgi();
        assert_eq!(&fcgi.stdin[..], b"hi");
        assert!(
            fcgi.params
                .iter()
                .any(|(k, v)| k == "REQUEST_METHOD" && v == "POST")
        );
    }
}
