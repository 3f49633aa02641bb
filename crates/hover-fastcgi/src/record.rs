// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wire format for FastCGI records.
//!
//! Every record on the socket has the following layout:
//! - 1 byte: protocol version (always 1)
//! - 1 byte: record type
//! - 2 bytes: request id (big-endian)
//! - 2 bytes: content length (big-endian)
//! - 1 byte: padding length
//! - 1 byte: reserved
//! - N bytes: content, followed by padding

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Protocol version carried in every record header.
pub const VERSION: u8 = 1;

/// Record header size.
pub const HEADER_SIZE: usize = 8;

/// Largest content a single record can carry.
pub const MAX_CONTENT_SIZE: usize = u16::MAX as usize;

/// Role requested in `BEGIN_REQUEST`.
pub const ROLE_RESPONDER: u16 = 1;

/// `BEGIN_REQUEST` flag asking the application to keep the connection open.
pub const FLAG_KEEP_CONN: u8 = 1;

/// Record types defined by the FastCGI specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    BeginRequest = 1,
    AbortRequest = 2,
    EndRequest = 3,
    Params = 4,
    Stdin = 5,
    Stdout = 6,
    Stderr = 7,
    Data = 8,
    GetValues = 9,
    GetValuesResult = 10,
    UnknownType = 11,
}

impl TryFrom<u8> for RecordType {
    type Error = FastCgiError;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            1 => Ok(RecordType::BeginRequest),
            2 => Ok(RecordType::AbortRequest),
            3 => Ok(RecordType::EndRequest),
            4 => Ok(RecordType::Params),
            5 => Ok(RecordType::Stdin),
            6 => Ok(RecordType::Stdout),
            7 => Ok(RecordType::Stderr),
            8 => Ok(RecordType::Data),
            9 => Ok(RecordType::GetValues),
            10 => Ok(RecordType::GetValuesResult),
            11 => Ok(RecordType::UnknownType),
            _ => Err(FastCgiError::InvalidRecordType(value)),
        }
    }
}

/// Protocol-level status reported in `END_REQUEST`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolStatus {
    RequestComplete,
    CantMultiplexConnection,
    Overloaded,
    UnknownRole,
}

impl TryFrom<u8> for ProtocolStatus {
    type Error = FastCgiError;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0 => Ok(ProtocolStatus::RequestComplete),
            1 => Ok(ProtocolStatus::CantMultiplexConnection),
            2 => Ok(ProtocolStatus::Overloaded),
            3 => Ok(ProtocolStatus::UnknownRole),
            _ => Err(FastCgiError::InvalidProtocolStatus(value)),
        }
    }
}

/// Errors that can occur while encoding, decoding, or exchanging records.
#[derive(Debug, Error)]
pub enum FastCgiError {
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("invalid record type: {0}")]
    InvalidRecordType(u8),

    #[error("invalid protocol status: {0}")]
    InvalidProtocolStatus(u8),

    #[error("record content too large: {0} bytes (max: {MAX_CONTENT_SIZE})")]
    ContentTooLarge(usize),

    #[error("malformed name-value pair")]
    MalformedParams,

    #[error("malformed END_REQUEST body")]
    MalformedEndRequest,

    #[error("request rejected by application: {0:?}")]
    Rejected(ProtocolStatus),

    #[error("unexpected request id {actual} (expected {expected})")]
    UnexpectedRequestId { expected: u16, actual: u16 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed")]
    ConnectionClosed,
}

/// A single FastCGI record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub record_type: RecordType,
    pub request_id: u16,
    pub content: Bytes,
}

impl Record {
    /// Create a record, rejecting content that does not fit in one record.
    pub fn new(
        record_type: RecordType,
        request_id: u16,
        content: impl Into<Bytes>,
    ) -> Result<Self, FastCgiError> {
        let content = content.into();
        if content.len() > MAX_CONTENT_SIZE {
            return Err(FastCgiError::ContentTooLarge(content.len()));
        }
        Ok(Self {
            record_type,
            request_id,
            content,
        })
    }

    /// Create a `BEGIN_REQUEST` record for the responder role.
    pub fn begin_request(request_id: u16, keep_conn: bool) -> Self {
        let mut body = BytesMut::with_capacity(8);
        body.put_u16(ROLE_RESPONDER);
        body.put_u8(if keep_conn { FLAG_KEEP_CONN } else { 0 });
        body.put_bytes(0, 5);
        Self {
            record_type: RecordType::BeginRequest,
            request_id,
            content: body.freeze(),
        }
    }

    /// Create an `END_REQUEST` record.
    pub fn end_request(request_id: u16, app_status: u32, status: ProtocolStatus) -> Self {
        let mut body = BytesMut::with_capacity(8);
        body.put_u32(app_status);
        body.put_u8(status as u8);
        body.put_bytes(0, 3);
        Self {
            record_type: RecordType::EndRequest,
            request_id,
            content: body.freeze(),
        }
    }

    /// Padding needed to align the record to 8 bytes.
    pub fn padding_len(&self) -> usize {
        (8 - self.content.len() % 8) % 8
    }

    /// Encode the record to bytes for wire transmission.
    pub fn encode(&self) -> Bytes {
        let padding = self.padding_len();
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.content.len() + padding);
        buf.put_u8(VERSION);
        buf.put_u8(self.record_type as u8);
        buf.put_u16(self.request_id);
        buf.put_u16(self.content.len() as u16);
        buf.put_u8(padding as u8);
        buf.put_u8(0);
        buf.put(self.content.clone());
        buf.put_bytes(0, padding);
        buf.freeze()
    }

    /// Decode a record from bytes.
    pub fn decode_from_bytes(mut bytes: Bytes) -> Result<Self, FastCgiError> {
        if bytes.len() < HEADER_SIZE {
            return Err(FastCgiError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "incomplete record header",
            )));
        }

        let version = bytes.get_u8();
        if version != VERSION {
            return Err(FastCgiError::UnsupportedVersion(version));
        }
        let record_type = RecordType::try_from(bytes.get_u8())?;
        let request_id = bytes.get_u16();
        let length = bytes.get_u16() as usize;
        let padding = bytes.get_u8() as usize;
        bytes.advance(1);

        if bytes.len() < length + padding {
            return Err(FastCgiError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "incomplete record content",
            )));
        }

        let content = bytes.split_to(length);
        Ok(Self {
            record_type,
            request_id,
            content,
        })
    }

    /// Parse the body of an `END_REQUEST` record.
    pub fn end_request_body(&self) -> Result<(u32, ProtocolStatus), FastCgiError> {
        if self.record_type != RecordType::EndRequest || self.content.len() < 5 {
            return Err(FastCgiError::MalformedEndRequest);
        }
        let mut content = self.content.clone();
        let app_status = content.get_u32();
        let status = ProtocolStatus::try_from(content.get_u8())?;
        Ok((app_status, status))
    }
}

/// Split a byte stream into records of the given type, terminated by an empty record.
pub fn stream_records(record_type: RecordType, request_id: u16, data: &[u8]) -> Vec<Record> {
    let mut records: Vec<Record> = data
        .chunks(MAX_CONTENT_SIZE)
        .map(|chunk| Record {
            record_type,
            request_id,
            content: Bytes::copy_from_slice(chunk),
        })
        .collect();
    records.push(Record {
        record_type,
        request_id,
        content: Bytes::new(),
    });
    records
}

fn put_length(buf: &mut BytesMut, len: usize) {
    if len < 0x80 {
        buf.put_u8(len as u8);
    } else {
        buf.put_u32(len as u32 | 0x8000_0000);
    }
}

fn get_length(buf: &mut Bytes) -> Result<usize, FastCgiError> {
    if !buf.has_remaining() {
        return Err(FastCgiError::MalformedParams);
    }
    if buf[0] & 0x80 == 0 {
        return Ok(buf.get_u8() as usize);
    }
    if buf.remaining() < 4 {
        return Err(FastCgiError::MalformedParams);
    }
    Ok((buf.get_u32() & 0x7fff_ffff) as usize)
}

/// Encode name-value pairs into the body of a `PARAMS` stream.
pub fn encode_params<K, V>(params: impl IntoIterator<Item = (K, V)>) -> Bytes
where
    K: AsRef<[u8]>,
    V: AsRef<[u8]>,
{
    let mut buf = BytesMut::new();
    for (name, value) in params {
        let (name, value) = (name.as_ref(), value.as_ref());
        put_length(&mut buf, name.len());
        put_length(&mut buf, value.len());
        buf.put_slice(name);
        buf.put_slice(value);
    }
    buf.freeze()
}

/// Decode the body of a `PARAMS` stream back into name-value pairs.
pub fn decode_params(mut bytes: Bytes) -> Result<Vec<(String, String)>, FastCgiError> {
    let mut params = Vec::new();
    while bytes.has_remaining() {
        let name_len = get_length(&mut bytes)?;
        let value_len = get_length(&mut bytes)?;
        if bytes.remaining() < name_len + value_len {
            return Err(FastCgiError::MalformedParams);
        }
        let name = bytes.split_to(name_len);
        let value = bytes.split_to(value_len);
        params.push((
            String::from_utf8_lossy(&name).into_owned(),
            String::from_utf8_lossy(&value).into_owned(),
        ));
    }
    Ok(params)
}

/// Write a record to an async writer.
pub async fn write_record<W: AsyncWrite + Unpin>(
    writer: &mut W,
    record: &Record,
) -> Result<(), FastCgiError> {
    writer.write_all(&record.encode()).await?;
    Ok(())
}

/// Read a record from an async reader.
pub async fn read_record<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Record, FastCgiError> {
    let mut header = [0u8; HEADER_SIZE];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FastCgiError::ConnectionClosed);
        }
        Err(e) => return Err(e.into()),
    }

    if header[0] != VERSION {
        return Err(FastCgiError::UnsupportedVersion(header[0]));
    }
    let record_type = RecordType::try_from(header[1])?;
    let request_id = u16::from_be_bytes([header[2], header[3]]);
    let length = u16::from_be_bytes([header[4], header[5]]) as usize;
    let padding = header[6] as usize;

    let mut content = vec![0u8; length + padding];
    reader.read_exact(&mut content).await?;
    content.truncate(length);

    Ok(Record {
        record_type,
        request_id,
        content: Bytes::from(content),
    })
}
