// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Client tests against an in-process FastCGI responder on a Unix socket.

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};
use hover_fastcgi::record::{decode_params, read_record, write_record};
use hover_fastcgi::{
    Client, ClientConfig, FastCgiError, ProtocolStatus, Record, RecordType, Request,
};
use tempfile::TempDir;
use tokio::net::{UnixListener, UnixStream};

/// Read one full request from the stream: params and stdin.
async fn read_request(stream: &mut UnixStream) -> (HashMap<String, String>, Bytes) {
    let begin = read_record(stream).await.unwrap();
    assert_eq!(begin.record_type, RecordType::BeginRequest);

    let mut params = BytesMut::new();
    let mut stdin = BytesMut::new();
    let mut params_done = false;
    loop {
        let record = read_record(stream).await.unwrap();
        match record.record_type {
            RecordType::Params if record.content.is_empty() => params_done = true,
            RecordType::Params => params.extend_from_slice(&record.content),
            RecordType::Stdin if record.content.is_empty() => break,
            RecordType::Stdin => stdin.extend_from_slice(&record.content),
            other => panic!("unexpected record {:?}", other),
        }
    }
    assert!(params_done);

    let params = decode_params(params.freeze()).unwrap().into_iter().collect();
    (params, stdin.freeze())
}

async fn respond(stream: &mut UnixStream, stdout: &[u8]) {
    for chunk in stdout.chunks(1024) {
        let record = Record::new(RecordType::Stdout, 1, Bytes::copy_from_slice(chunk)).unwrap();
        write_record(stream, &record).await.unwrap();
    }
    let empty = Record::new(RecordType::Stdout, 1, Bytes::new()).unwrap();
    write_record(stream, &empty).await.unwrap();
    let end = Record::end_request(1, 0, ProtocolStatus::RequestComplete);
    write_record(stream, &end).await.unwrap();
}

#[tokio::test]
async fn test_echo_request_over_unix_socket() {
    let dir = TempDir::new().unwrap();
    let socket_path = dir.path().join("worker.sock");
    let listener = UnixListener::bind(&socket_path).unwrap();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let (params, stdin) = read_request(&mut stream).await;
        let body = format!(
            "{} {} {}",
            params["REQUEST_METHOD"],
            params["REQUEST_URI"],
            String::from_utf8_lossy(&stdin)
        );
        let out = format!(
            "Status: 201 Created\r\nContent-Type: text/plain\r\nSet-Cookie: a=1\r\nSet-Cookie: b=2\r\n\r\n{}",
            body
        );
        respond(&mut stream, out.as_bytes()).await;
    });

    let client = Client::new(ClientConfig::new(&socket_path));
    let response = client
        .execute(&Request {
            params: vec![
                ("REQUEST_METHOD".to_string(), "PUT".to_string()),
                ("REQUEST_URI".to_string(), "/items/1".to_string()),
            ],
            stdin: Bytes::from_static(b"{\"name\":\"hover\"}"),
        })
        .await
        .unwrap();
    server.await.unwrap();

    assert_eq!(response.status, 201);
    assert_eq!(response.header("content-type"), Some("text/plain"));
    assert_eq!(response.headers["set-cookie"].len(), 2);
    assert_eq!(&response.body[..], b"PUT /items/1 {\"name\":\"hover\"}");
}

#[tokio::test]
async fn test_large_body_spans_multiple_records() {
    let dir = TempDir::new().unwrap();
    let socket_path = dir.path().join("worker.sock");
    let listener = UnixListener::bind(&socket_path).unwrap();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let (_, stdin) = read_request(&mut stream).await;
        let out = format!("Content-Length: {}\r\n\r\n", stdin.len());
        let mut raw = out.into_bytes();
        raw.extend_from_slice(&stdin);
        respond(&mut stream, &raw).await;
    });

    let payload = vec![b'x'; 200_000];
    let client = Client::new(ClientConfig::new(&socket_path));
    let response = client
        .execute(&Request {
            params: Vec::new(),
            stdin: Bytes::from(payload.clone()),
        })
        .await
        .unwrap();
    server.await.unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(response.body.len(), payload.len());
    assert_eq!(response.header("content-length"), Some("200000"));
}

#[tokio::test]
async fn test_connect_to_missing_socket_fails() {
    let dir = TempDir::new().unwrap();
    let client = Client::new(ClientConfig::new(dir.path().join("missing.sock")));

    match client.execute(&Request::default()).await {
        Err(FastCgiError::Io(_)) => {}
        other => panic!("Expected Io error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_server_closing_early_is_connection_closed() {
    let dir = TempDir::new().unwrap();
    let socket_path = dir.path().join("worker.sock");
    let listener = UnixListener::bind(&socket_path).unwrap();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let _ = read_request(&mut stream).await;
        drop(stream);
    });

    let client = Client::new(ClientConfig::new(&socket_path));
    match client.execute(&Request::default()).await {
        Err(FastCgiError::ConnectionClosed) => {}
        other => panic!("Expected ConnectionClosed, got {:?}", other),
    }
}
