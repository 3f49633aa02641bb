// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Hover Runtime - custom serverless runtime for PHP applications
//!
//! The runtime runs inside a function instance and loops forever over the
//! control plane's invocation queue. Each invocation is classified by its
//! payload and handed to one processor:
//!
//! ```text
//!   ┌───────────────┐  poll / report   ┌────────────────────────────────┐
//!   │ control plane │◄────────────────►│ InvocationLoop                 │
//!   └───────────────┘                  │   └── Dispatcher               │
//!                                      │        ├── HttpProcessor ──────┼──► php-fpm (FastCGI, unix socket)
//!                                      │        │     └── WarmPool ─────┼──► Invoke API (Event)
//!                                      │        ├── CliProcessor ───────┼──► sh -c "<entrypoint> <command>"
//!                                      │        └── QueueBridge ────────┼──► job runner ──► queue command
//!                                      └────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | Environment-driven configuration and function role |
//! | [`manifest`] | Deployment manifest with per-queue retry policy |
//! | [`control_plane`] | Runtime API client |
//! | [`runtime`] | The invocation loop |
//! | [`processor`] | Dispatcher and the HTTP, CLI and queue processors |
//! | [`worker`] | FastCGI worker process supervision |
//! | [`gateway`] | Worker response to gateway result conversion |
//! | [`queue`] | Generic job runner with retry accounting |
//! | [`warmer`] | Warm-container pre-provisioning |
//! | [`deadline`] | Time budget arithmetic |
//! | [`sigv4`] | Request signing for self-invocation |

pub mod config;
pub mod control_plane;
pub mod deadline;
pub mod error;
pub mod gateway;
pub mod manifest;
pub mod processor;
pub mod queue;
pub mod runtime;
pub mod sigv4;
pub mod warmer;
pub mod worker;

pub use config::{Config, ConfigError, FunctionRole};
pub use control_plane::{ControlPlaneClient, Invocation};
pub use error::{Error, ErrorReport, Result};
pub use processor::{Dispatcher, EventProcessor, InvocationKind};
pub use runtime::InvocationLoop;
