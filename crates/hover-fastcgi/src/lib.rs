// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Hover FastCGI - request bridging to a local worker process
//!
//! This crate provides the wire protocol used by the hover runtime to hand
//! HTTP-shaped work to a persistent FastCGI application (for example
//! `php-fpm`) listening on a Unix domain socket.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       hover-fastcgi                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Client: one request/response exchange per connection       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Records: BEGIN_REQUEST, PARAMS, STDIN, STDOUT, END_REQUEST │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Transport: Unix stream socket (tokio)                      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use hover_fastcgi::{Client, ClientConfig, Request};
//!
//! let client = Client::new(ClientConfig::new("/tmp/.hover/php-fpm.sock"));
//! let request = Request {
//!     params: vec![("REQUEST_METHOD".into(), "GET".into())],
//!     stdin: Default::default(),
//! };
//! let response = client.execute(&request).await?;
//! println!("{} {:?}", response.status, response.body);
//! ```

pub mod client;
pub mod record;
pub mod response;

pub use client::{Client, ClientConfig, Request};
pub use record::{FastCgiError, ProtocolStatus, Record, RecordType};
pub use response::Response;
