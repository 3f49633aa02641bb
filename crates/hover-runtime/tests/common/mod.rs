// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for hover-runtime integration tests.
//!
//! Provides a mocked control plane and a fake FastCGI worker made of a shell
//! process (pid file, TERM handling) and an in-process responder that owns
//! the socket while that process is alive.

#![allow(dead_code)]

use std::path::Path;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use hover_fastcgi::record::{decode_params, read_record, write_record};
use hover_fastcgi::{ProtocolStatus, Record, RecordType};
use hover_runtime::deadline::now_millis;
use hover_runtime::worker::WorkerConfig;
use serde_json::Value;
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const NEXT_PATH: &str = "/2018-06-01/runtime/invocation/next";

// ===== Control plane =====

/// Queue one invocation on the mock control plane. Served once.
pub async fn enqueue_invocation(server: &MockServer, id: &str, payload: &Value, budget_ms: i64) {
    Mock::given(method("GET"))
        .and(path(NEXT_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("lambda-runtime-aws-request-id", id)
                .insert_header(
                    "lambda-runtime-deadline-ms",
                    (now_millis() + budget_ms).to_string().as_str(),
                )
                .insert_header("lambda-runtime-trace-id", "Root=1-5e1b4151-5ac6c58f")
                .set_body_json(payload),
        )
        .up_to_n_times(1)
        .mount(server)
        .await;
}

/// Make every further poll fail, which ends the invocation loop.
pub async fn close_queue(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path(NEXT_PATH))
        .respond_with(ResponseTemplate::new(500).set_body_string("shutting down"))
        .mount(server)
        .await;
}

/// Accept every result and error report.
pub async fn accept_reports(server: &MockServer) {
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(202))
        .mount(server)
        .await;
}

/// Reports received so far as `(path, error type header, body)`.
pub async fn received_reports(server: &MockServer) -> Vec<(String, Option<String>, Value)> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|r| r.method.as_str() == "POST")
        .map(|r| {
            let error_type = r
                .headers
                .get("lambda-runtime-function-error-type")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let body = serde_json::from_slice(&r.body).unwrap_or(Value::Null);
            (r.url.path().to_string(), error_type, body)
        })
        .collect()
}

// ===== Fake worker =====

/// How the fake worker answers requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerBehavior {
    /// Echo the method and URI with a JSON content type.
    Echo,
    /// Read the request and never answer.
    Hang,
}

/// Shell process standing in for php-fpm: writes its pid, removes its files
/// on SIGTERM.
pub fn worker_config(dir: &Path) -> WorkerConfig {
    worker_config_with(dir, "", "rm -f \"$PID_FILE\" \"$SOCKET\"")
}

/// Fake worker running `preamble` before writing its pid file and
/// `on_term` when it receives SIGTERM.
pub fn worker_config_with(dir: &Path, preamble: &str, on_term: &str) -> WorkerConfig {
    let script = dir.join("fake-fpm.sh");
    std::fs::write(
        &script,
        format!(
            "#!/bin/sh\n\
             PID_FILE=\"$1\"\n\
             SOCKET=\"$2\"\n\
             trap '{}; exit 0' TERM\n\
             echo \"fake fpm starting\" >&2\n\
             {}\n\
             echo $$ > \"$PID_FILE\"\n\
             while true; do sleep 0.05; done\n",
            on_term, preamble
        ),
    )
    .unwrap();

    let mut config = WorkerConfig::new("sh", dir.join("runtime"));
    let args = vec![
        script.display().to_string(),
        config.pid_file.display().to_string(),
        config.socket_path.display().to_string(),
    ];
    config = config.with_command("sh", args);
    config.stop_timeout = Duration::from_secs(2);
    config
}

/// Binds the worker socket whenever a worker process has written its pid
/// file and no socket exists yet. The socket is checked first: the script
/// removes its pid file before its socket.
pub struct FakeResponder {
    handle: JoinHandle<()>,
}

impl FakeResponder {
    pub fn spawn(config: &WorkerConfig, behavior: WorkerBehavior) -> Self {
        let socket_path = config.socket_path.clone();
        let pid_file = config.pid_file.clone();
        let handle = tokio::spawn(async move {
            let mut servers: Vec<JoinHandle<()>> = Vec::new();
            loop {
                if !socket_path.exists() && pid_file.exists() {
                    if let Ok(listener) = UnixListener::bind(&socket_path) {
                        servers.push(tokio::spawn(serve(listener, behavior)));
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });
        Self { handle }
    }
}

impl Drop for FakeResponder {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve(listener: UnixListener, behavior: WorkerBehavior) {
    while let Ok((mut stream, _)) = listener.accept().await {
        tokio::spawn(async move {
            let Some((params, _stdin)) = read_request(&mut stream).await else {
                return;
            };
            match behavior {
                WorkerBehavior::Echo => {
                    let body = format!(
                        "{{\"method\":\"{}\",\"uri\":\"{}\"}}",
                        params.iter().find(|(k, _)| k == "REQUEST_METHOD").map(|(_, v)| v.as_str()).unwrap_or(""),
                        params.iter().find(|(k, _)| k == "REQUEST_URI").map(|(_, v)| v.as_str()).unwrap_or(""),
                    );
                    let stdout = format!(
                        "Status: 201 Created\r\nContent-Type: application/json\r\nSet-Cookie: a=1\r\n\r\n{}",
                        body
                    );
                    respond(&mut stream, stdout.as_bytes()).await;
                }
                WorkerBehavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                }
            }
        });
    }
}

async fn read_request(stream: &mut UnixStream) -> Option<(Vec<(String, String)>, Bytes)> {
    let begin = read_record(stream).await.ok()?;
    if begin.record_type != RecordType::BeginRequest {
        return None;
    }

    let mut params = BytesMut::new();
    let mut stdin = BytesMut::new();
    loop {
        let record = read_record(stream).await.ok()?;
        match record.record_type {
            RecordType::Params => params.extend_from_slice(&record.content),
            RecordType::Stdin if record.content.is_empty() => break,
            RecordType::Stdin => stdin.extend_from_slice(&record.content),
            _ => return None,
        }
    }

    let params = decode_params(params.freeze()).ok()?;
    Some((params, stdin.freeze()))
}

async fn respond(stream: &mut UnixStream, stdout: &[u8]) {
    let record = Record::new(RecordType::Stdout, 1, Bytes::copy_from_slice(stdout)).unwrap();
    write_record(stream, &record).await.unwrap();
    let empty = Record::new(RecordType::Stdout, 1, Bytes::new()).unwrap();
    write_record(stream, &empty).await.unwrap();
    let end = Record::end_request(1, 0, ProtocolStatus::RequestComplete);
    write_record(stream, &end).await.unwrap();
}

/// Whether a process with `pid` still exists.
pub fn process_alive(pid: u32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok()
}
