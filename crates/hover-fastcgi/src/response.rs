// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! CGI-style response parsing.
//!
//! The application writes a header block followed by a blank line and the raw
//! body to its `STDOUT` stream. The `Status` pseudo-header carries the HTTP
//! status code.

use std::collections::BTreeMap;

use bytes::Bytes;

/// Status used when the application does not send a `Status` header.
pub const DEFAULT_STATUS: u16 = 200;

/// A complete response read from the application.
#[derive(Debug, Clone, Default)]
pub struct Response {
    /// HTTP status derived from the `Status` header.
    pub status: u16,
    /// Response headers keyed by lower-case name, in arrival order per name.
    pub headers: BTreeMap<String, Vec<String>>,
    /// Raw response body.
    pub body: Bytes,
    /// Anything the application wrote to its `STDERR` stream.
    pub stderr: Bytes,
    /// Application exit status from `END_REQUEST`.
    pub app_status: u32,
}

impl Response {
    /// Build a response from the concatenated `STDOUT` stream.
    pub fn from_stdout(stdout: Bytes) -> Self {
        let (head, body) = split_head(&stdout);
        let mut headers: BTreeMap<String, Vec<String>> = BTreeMap::new();

        for line in String::from_utf8_lossy(head).lines() {
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            let name = name.trim().to_ascii_lowercase();
            if name.is_empty() {
                continue;
            }
            headers
                .entry(name)
                .or_default()
                .push(value.trim().to_string());
        }

        let status = headers
            .get("status")
            .and_then(|values| values.last())
            .and_then(|value| value.split(' ').next())
            .and_then(|code| code.parse().ok())
            .unwrap_or(DEFAULT_STATUS);

        Self {
            status,
            headers,
            body: stdout.slice_ref(body),
            stderr: Bytes::new(),
            app_status: 0,
        }
    }

    /// Last value of a header, looked up case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .and_then(|values| values.last())
            .map(String::as_str)
    }
}

/// Split the stream at the first blank line. A stream without a blank line is
/// treated as headers only.
fn split_head(stdout: &[u8]) -> (&[u8], &[u8]) {
    if let Some(pos) = find(stdout, b"\r\n\r\n") {
        return (&stdout[..pos], &stdout[pos + 4..]);
    }
    if let Some(pos) = find(stdout, b"\n\n") {
        return (&stdout[..pos], &stdout[pos + 2..]);
    }
    (stdout, &stdout[stdout.len()..])
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_header_sets_status() {
        let response = Response::from_stdout(Bytes::from_static(
            b"Status: 404 Not Found\r\nContent-Type: text/plain\r\n\r\nmissing",
        ));
        assert_eq!(response.status, 404);
        assert_eq!(response.header("Content-Type"), Some("text/plain"));
        assert_eq!(&response.body[..], b"missing");
    }

    #[test]
    fn test_default_status() {
        let response = Response::from_stdout(Bytes::from_static(b"X-Powered-By: hover\r\n\r\n"));
        assert_eq!(response.status, DEFAULT_STATUS);
        assert!(response.body.is_empty());
    }

    #[test]
    fn test_repeated_headers_are_kept() {
        let response = Response::from_stdout(Bytes::from_static(
            b"Set-Cookie: a=1\r\nset-cookie: b=2\r\n\r\n",
        ));
        assert_eq!(
            response.headers.get("set-cookie").unwrap(),
            &vec!["a=1".to_string(), "b=2".to_string()]
        );
        assert_eq!(response.header("set-cookie"), Some("b=2"));
    }

    #[test]
    fn test_bare_newline_separator() {
        let response = Response::from_stdout(Bytes::from_static(b"Status: 201\n\n{\"ok\":true}"));
        assert_eq!(response.status, 201);
        assert_eq!(&response.body[..], b"{\"ok\":true}");
    }

    #[test]
    fn test_binary_body_is_untouched() {
        let mut raw = b"Content-Type: image/png\r\n\r\n".to_vec();
        raw.extend_from_slice(&[0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x0d, 0x0a]);
        let response = Response::from_stdout(Bytes::from(raw));
        assert_eq!(
            &response.body[..],
            &[0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x0d, 0x0a]
        );
    }
}
