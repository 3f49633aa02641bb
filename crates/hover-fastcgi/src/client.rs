// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Unix-socket client for talking to a FastCGI application.

use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::net::UnixStream;
use tracing::{debug, instrument, warn};

use crate::record::{
    FastCgiError, ProtocolStatus, Record, RecordType, encode_params, read_record, stream_records,
    write_record,
};
use crate::response::Response;

/// Request id used for every exchange; connections are never multiplexed.
const REQUEST_ID: u16 = 1;

/// One request to send to the application.
#[derive(Debug, Clone, Default)]
pub struct Request {
    /// CGI parameters (`REQUEST_METHOD`, `HTTP_*`, ...).
    pub params: Vec<(String, String)>,
    /// Request body streamed as `STDIN`.
    pub stdin: Bytes,
}

/// Configuration for the FastCGI client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Path of the application's listening socket.
    pub socket_path: PathBuf,
    /// Connection timeout in milliseconds.
    pub connect_timeout_ms: u64,
}

impl ClientConfig {
    /// Configuration with the default one-second connect timeout.
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            connect_timeout_ms: 1_000,
        }
    }
}

/// FastCGI client bound to one socket path.
///
/// Each call opens a fresh connection, performs one request/response exchange
/// and closes it. Callers bound the overall exchange time themselves.
#[derive(Debug, Clone)]
pub struct Client {
    config: ClientConfig,
}

impl Client {
    /// Create a client for the given configuration.
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    /// Socket path this client connects to.
    pub fn socket_path(&self) -> &Path {
        &self.config.socket_path
    }

    /// Connect, send the request, and read the complete response.
    #[instrument(skip(self, request), fields(socket = %self.config.socket_path.display()))]
    pub async fn execute(&self, request: &Request) -> Result<Response, FastCgiError> {
        let connect = UnixStream::connect(&self.config.socket_path);
        let mut stream =
            tokio::time::timeout(Duration::from_millis(self.config.connect_timeout_ms), connect)
                .await
                .map_err(|_| {
                    FastCgiError::Io(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "connect timed out",
                    ))
                })??;

        let response = exchange(&mut stream, request).await?;
        let _ = stream.shutdown().await;
        Ok(response)
    }
}

/// Perform one request/response exchange over an already connected stream.
pub async fn exchange<S>(stream: &mut S, request: &Request) -> Result<Response, FastCgiError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    send_request(stream, request).await?;
    read_response(stream).await
}

async fn send_request<S>(stream: &mut S, request: &Request) -> Result<(), FastCgiError>
where
    S: AsyncWrite + Unpin,
{
    let mut writer = BufWriter::new(stream);
    write_record(&mut writer, &Record::begin_request(REQUEST_ID, false)).await?;

    let params = encode_params(
        request
            .params
            .iter()
            .map(|(name, value)| (name.as_bytes(), value.as_bytes())),
    );
    for record in stream_records(RecordType::Params, REQUEST_ID, &params) {
        write_record(&mut writer, &record).await?;
    }
    for record in stream_records(RecordType::Stdin, REQUEST_ID, &request.stdin) {
        write_record(&mut writer, &record).await?;
    }
    writer.flush().await?;

    debug!(
        params = request.params.len(),
        body_len = request.stdin.len(),
        "Sent FastCGI request"
    );
    Ok(())
}

async fn read_response<S>(stream: &mut S) -> Result<Response, FastCgiError>
where
    S: AsyncRead + Unpin,
{
    let mut stdout = BytesMut::new();
    let mut stderr = BytesMut::new();

    loop {
        let record = read_record(stream).await?;
        if record.request_id != REQUEST_ID {
            return Err(FastCgiError::UnexpectedRequestId {
                expected: REQUEST_ID,
                actual: record.request_id,
            });
        }

        match record.record_type {
            RecordType::Stdout => stdout.extend_from_slice(&record.content),
            RecordType::Stderr => stderr.extend_from_slice(&record.content),
            RecordType::EndRequest => {
                let (app_status, status) = record.end_request_body()?;
                if status != ProtocolStatus::RequestComplete {
                    return Err(FastCgiError::Rejected(status));
                }
                if !stderr.is_empty() {
                    warn!(
                        stderr = %String::from_utf8_lossy(&stderr),
                        "Application wrote to FastCGI stderr"
                    );
                }
                let mut response = Response::from_stdout(stdout.freeze());
                response.stderr = stderr.freeze();
                response.app_status = app_status;
                return Ok(response);
            }
            other => {
                debug!(record_type = ?other, "Ignoring unexpected FastCGI record");
            }
        }
    }
}
