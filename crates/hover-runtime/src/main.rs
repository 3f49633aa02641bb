// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Hover Runtime - bootstrap binary
//!
//! Loads configuration, builds the processors for this function's role,
//! then serves invocations until the platform stops the instance.

use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};

use hover_runtime::config::Config;
use hover_runtime::control_plane::ControlPlaneClient;
use hover_runtime::error::{Error, ErrorReport};
use hover_runtime::processor::Dispatcher;
use hover_runtime::runtime::InvocationLoop;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout belongs to the worker and commands
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hover_runtime=info,hover_fastcgi=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            let e = Error::from(e);
            error!(error = %e, "Invalid configuration");
            if let Ok(api) = std::env::var("AWS_LAMBDA_RUNTIME_API") {
                report_init_failure(&api, &e).await;
            }
            std::process::exit(1);
        }
    };

    info!(
        function = %config.function_name,
        version = %config.function_version,
        region = %config.region,
        "Starting Hover Runtime"
    );

    let control_plane = ControlPlaneClient::new(&config.runtime_api)?;

    let dispatcher = match Dispatcher::from_config(&config).await {
        Ok(dispatcher) => dispatcher,
        Err(e) => {
            error!(error = %e, error_type = e.error_type(), "Initialization failed");
            report_init_failure(&config.runtime_api, &e).await;
            std::process::exit(1);
        }
    };

    let mut invocation_loop = InvocationLoop::new(control_plane, dispatcher);
    let mut sigterm = signal(SignalKind::terminate())?;

    let outcome = tokio::select! {
        result = invocation_loop.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupt received");
            Ok(())
        }
        _ = sigterm.recv() => {
            info!("Termination signal received");
            Ok(())
        }
    };

    invocation_loop.shutdown().await;

    if let Err(e) = outcome {
        error!(error = %e, "Invocation loop stopped");
        return Err(e.into());
    }

    info!("Hover Runtime shut down");
    Ok(())
}

async fn report_init_failure(runtime_api: &str, error: &Error) {
    let report = ErrorReport::from(error);
    match ControlPlaneClient::new(runtime_api) {
        Ok(client) => {
            if let Err(e) = client.report_init_failure(&report).await {
                error!(error = %e, "Failed to report initialization error");
            }
        }
        Err(e) => error!(error = %e, "Failed to create control plane client"),
    }
}
