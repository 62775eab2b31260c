//! Container supervisor for a userspace NFS server.
//!
//! Starts the portmapper, the system message bus, and the NFS server in order, waiting for each to become ready, then
//! serves health and metrics over HTTP until the NFS server exits or the process is asked to stop.

#![deny(warnings)]
#![deny(missing_docs)]
use std::sync::Arc;

use keel_app::prelude::*;
use keel_dbus::SystemBusConnector;
use keel_error::{ErrorContext as _, GenericError};
use keel_metrics::TelemetryRecorder;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

mod config;
use self::config::SupervisorConfiguration;

mod daemons;
use self::daemons::Daemons;

mod orchestrator;
use self::orchestrator::{Orchestrator, OrchestratorSettings};

#[tokio::main]
async fn main() {
    let logging_config = LoggingConfiguration::from_environment()
        .unwrap_or_else(|e| fatal_and_exit(format!("failed to load logging configuration: {}", e)));
    if let Err(e) = initialize_logging(logging_config) {
        fatal_and_exit(format!("failed to initialize logging: {}", e));
    }

    let config = match SupervisorConfiguration::from_environment() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed to load configuration.");
            std::process::exit(1);
        }
    };

    // Must be installed before anything registers metrics.
    let telemetry = match TelemetryRecorder::new().install() {
        Ok(handle) => handle,
        Err(e) => {
            error!(error = %e, "Failed to install telemetry recorder.");
            std::process::exit(1);
        }
    };

    let stop = CancellationToken::new();
    if let Err(e) = spawn_signal_listener(stop.clone()) {
        error!(error = %e, "Failed to install signal handlers.");
        std::process::exit(1);
    }

    info!(
        ganesha_config_file = %config.ganesha_config_file().display(),
        listen_address = config.listen_address(),
        "NFS supervisor starting."
    );

    let orchestrator = Orchestrator::new(
        OrchestratorSettings::from_configuration(&config, Some(telemetry)),
        Daemons::standard(config.ganesha_config_file()),
        Arc::new(SystemBusConnector::system()),
    );

    match orchestrator.run(stop).await {
        Ok(()) => info!("NFS supervisor stopped."),
        Err(e) => {
            error!("{:?}", e);
            std::process::exit(1);
        }
    }
}

/// Cancels `stop` on the first SIGINT or SIGTERM.
fn spawn_signal_listener(stop: CancellationToken) -> Result<(), GenericError> {
    let mut sigint = signal(SignalKind::interrupt()).error_context("Failed to set up SIGINT handler.")?;
    let mut sigterm = signal(SignalKind::terminate()).error_context("Failed to set up SIGTERM handler.")?;

    tokio::spawn(async move {
        let name = tokio::select! {
            _ = sigint.recv() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
            _ = stop.cancelled() => return,
        };
        info!(signal = name, "Received stop signal. Shutting down.");
        stop.cancel();
    });

    Ok(())
}
