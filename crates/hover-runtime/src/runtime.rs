// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The invocation loop.
//!
//! Each iteration polls the control plane, dispatches the invocation and
//! reports exactly one outcome for it. Processing failures (including
//! panics) are reported and the loop moves on; only a failed poll ends it.

use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tracing::{error, info, instrument, warn};

use crate::control_plane::{ControlPlaneClient, Invocation};
use crate::error::{Error, ErrorReport, Result};
use crate::processor::Dispatcher;

/// Polls, dispatches and reports, one invocation at a time.
pub struct InvocationLoop {
    control_plane: ControlPlaneClient,
    dispatcher: Dispatcher,
}

impl InvocationLoop {
    /// Loop over `control_plane` feeding `dispatcher`.
    pub fn new(control_plane: ControlPlaneClient, dispatcher: Dispatcher) -> Self {
        Self {
            control_plane,
            dispatcher,
        }
    }

    /// The control-plane client.
    pub fn control_plane(&self) -> &ControlPlaneClient {
        &self.control_plane
    }

    /// Run until polling fails.
    pub async fn run(&mut self) -> Result<()> {
        info!(api = %self.control_plane.base_url(), "Invocation loop started");
        loop {
            self.run_once().await?;
        }
    }

    /// Handle exactly one invocation. Returns an error only when the poll
    /// itself failed.
    pub async fn run_once(&mut self) -> Result<()> {
        let invocation = self.control_plane.poll_next().await?;
        self.handle(&invocation).await;
        Ok(())
    }

    /// Stop the processors.
    pub async fn shutdown(&mut self) {
        info!("Shutting down processors");
        self.dispatcher.shutdown().await;
    }

    #[instrument(skip_all, fields(invocation_id = %invocation.id))]
    async fn handle(&mut self, invocation: &Invocation) {
        let outcome = AssertUnwindSafe(self.dispatcher.dispatch(invocation))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(Error::Panic(panic_message(panic.as_ref()))));

        match outcome {
            Ok(result) => {
                if let Err(e) = self.control_plane.report_success(&invocation.id, &result).await {
                    warn!(error = %e, "Failed to post result, reporting it as an error");
                    self.report_failure(invocation, &e).await;
                }
            }
            Err(e) => {
                error!(error = %e, error_type = e.error_type(), "Invocation failed");
                self.report_failure(invocation, &e).await;
            }
        }
    }

    async fn report_failure(&self, invocation: &Invocation, error: &Error) {
        let report = ErrorReport::from(error);
        if let Err(e) = self.control_plane.report_error(&invocation.id, &report).await {
            error!(error = %e, "Failed to report invocation error");
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
