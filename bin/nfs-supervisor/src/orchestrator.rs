//! Startup sequencing and graceful shutdown of the NFS container.

use std::{fmt, sync::Arc, time::Duration};

use futures::future::FusedFuture as _;
use keel_app::api::{APIBuilder, RunningAPI};
use keel_core::{
    bus::{BusConnector, BusError},
    exit::ExitNotification,
    heartbeat::{HeartbeatBroadcaster, HeartbeatError},
    process::{ProcessError, ProcessExitError},
    readiness::{ReadinessError, ReadinessGate},
};
use keel_error::GenericError;
use keel_health::HealthAPIHandler;
use keel_metrics::{ClientsCollector, ExportsCollector, MetricContext, MetricsAPIHandler, TelemetryHandle};
use snafu::{ResultExt as _, Snafu};
use tokio::{
    select,
    task::JoinHandle,
    time::{timeout_at, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{config::SupervisorConfiguration, daemons::Daemons};

const SERVICE_NAME: &str = "StorageOS NFS";

/// Fatal error while bringing the container up.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum StartupError {
    /// A daemon could not be started.
    #[snafu(display("Failed to start daemon."))]
    StartDaemon { source: ProcessError },

    /// A component did not become ready in time.
    #[snafu(display("Component did not become ready."))]
    NotReady { source: ReadinessError },

    /// The long-lived bus connection could not be established.
    #[snafu(display("Failed to connect to the message bus."))]
    ConnectBus { source: BusError },

    /// The HTTP surface could not be started.
    #[snafu(display("Failed to start HTTP server."))]
    ServeApi { source: GenericError },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Phase {
    Starting,
    BusReady,
    NfsStarting,
    NfsReady,
    Serving,
    ShuttingDown,
    Stopped,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Starting => "starting",
            Self::BusReady => "bus_ready",
            Self::NfsStarting => "nfs_starting",
            Self::NfsReady => "nfs_ready",
            Self::Serving => "serving",
            Self::ShuttingDown => "shutting_down",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Settings for the orchestrator.
#[derive(Clone)]
pub struct OrchestratorSettings {
    pub listen_address: String,
    pub startup_timeout: Duration,
    pub shutdown_timeout: Duration,
    /// `None` disables the metrics endpoint.
    pub metrics: Option<MetricContext>,
    pub telemetry: Option<TelemetryHandle>,
}

impl OrchestratorSettings {
    pub fn from_configuration(config: &SupervisorConfiguration, telemetry: Option<TelemetryHandle>) -> Self {
        Self {
            listen_address: config.listen_address().to_string(),
            startup_timeout: config.startup_timeout(),
            shutdown_timeout: config.shutdown_timeout(),
            metrics: config.metrics(),
            telemetry,
        }
    }
}

/// Everything started so far, torn down in reverse dependency order.
#[derive(Default)]
struct Running {
    rpcbind: Option<ExitNotification<ProcessExitError>>,
    bus: Option<ExitNotification<ProcessExitError>>,
    nfs: Option<ExitNotification<ProcessExitError>>,
    api: Option<(RunningAPI, ExitNotification<GenericError>)>,
    heartbeat: Option<JoinHandle<Result<(), HeartbeatError>>>,
}

/// Brings up the NFS container's daemons in order, serves the HTTP surface, and shuts everything down once asked to or
/// once any component stops.
pub struct Orchestrator {
    settings: OrchestratorSettings,
    daemons: Daemons,
    connector: Arc<dyn BusConnector>,
    readiness: ReadinessGate,
    phase: Phase,
}

impl Orchestrator {
    /// Creates a new `Orchestrator`.
    pub fn new(settings: OrchestratorSettings, daemons: Daemons, connector: Arc<dyn BusConnector>) -> Self {
        Self {
            settings,
            daemons,
            connector,
            readiness: ReadinessGate::new(),
            phase: Phase::Starting,
        }
    }

    /// Runs the container until `stop` is triggered or a component stops.
    ///
    /// A stop request during startup aborts startup, and is not an error.
    ///
    /// # Errors
    ///
    /// If startup fails, whatever was already started is stopped and the error is returned.
    pub async fn run(mut self, stop: CancellationToken) -> Result<(), StartupError> {
        let mut running = Running::default();
        let heartbeat_cancel = CancellationToken::new();

        info!(phase = %self.phase, "Starting NFS container.");
        if let Err(e) = self.start(&mut running, &stop, &heartbeat_cancel).await {
            if matches!(
                e,
                StartupError::NotReady {
                    source: ReadinessError::Cancelled { .. }
                }
            ) {
                info!("Shutdown requested during startup.");
                self.shutdown(running, &heartbeat_cancel).await;
                info!("graceful shutdown completed");
                return Ok(());
            }

            warn!("Startup failed. Stopping components that were already started.");
            self.shutdown(running, &heartbeat_cancel).await;
            return Err(e);
        }

        self.transition(Phase::Serving);
        wait_for_stop(&mut running, &stop).await;

        self.shutdown(running, &heartbeat_cancel).await;
        info!("graceful shutdown completed");
        Ok(())
    }

    async fn start(
        &mut self, running: &mut Running, stop: &CancellationToken, heartbeat_cancel: &CancellationToken,
    ) -> Result<(), StartupError> {
        // Both readiness waits share one deadline.
        let deadline = Instant::now() + self.settings.startup_timeout;

        running.rpcbind = Some(self.daemons.rpcbind.run().await.context(StartDaemon)?);
        running.bus = Some(self.daemons.bus.run().await.context(StartDaemon)?);

        let connector = Arc::clone(&self.connector);
        self.readiness
            .wait_until_ready("dbus", deadline, stop, || {
                let connector = Arc::clone(&connector);
                async move {
                    match connector.probe().await {
                        Ok(()) => true,
                        Err(error) => {
                            debug!(%error, "Message bus not ready yet.");
                            false
                        }
                    }
                }
            })
            .await
            .context(NotReady)?;
        self.transition(Phase::BusReady);

        let handles = self.connector.connect().await.context(ConnectBus)?;
        let broadcaster = HeartbeatBroadcaster::new(Arc::clone(&handles.signals));

        self.transition(Phase::NfsStarting);
        running.nfs = Some(self.daemons.nfs.run().await.context(StartDaemon)?);

        // Monitoring outlives startup, so it gets its own token rather than the startup scope.
        running.heartbeat = Some(tokio::spawn({
            let broadcaster = broadcaster.clone();
            let cancel = heartbeat_cancel.clone();
            async move { broadcaster.run(cancel).await }
        }));

        self.readiness
            .wait_until_ready("ganesha", deadline, stop, || {
                let broadcaster = broadcaster.clone();
                async move {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    broadcaster.wait_for_status(remaining).await == Some(true)
                }
            })
            .await
            .context(NotReady)?;
        self.transition(Phase::NfsReady);

        let mut api = APIBuilder::new(SERVICE_NAME).with_handler(HealthAPIHandler::new(broadcaster));
        if let Some(context) = &self.settings.metrics {
            let mut metrics = MetricsAPIHandler::new()
                .with_collector(ExportsCollector::new(Arc::clone(&handles.stats), context.clone()))
                .with_collector(ClientsCollector::new(Arc::clone(&handles.stats), context.clone()));
            if let Some(telemetry) = &self.settings.telemetry {
                metrics = metrics.with_telemetry(telemetry.clone());
            }
            api = api.with_handler(metrics);
            info!(listen_address = %self.settings.listen_address, "Metrics endpoint enabled.");
        }

        running.api = Some(api.serve(&self.settings.listen_address).await.context(ServeApi)?);
        Ok(())
    }

    async fn shutdown(&mut self, running: Running, heartbeat_cancel: &CancellationToken) {
        self.transition(Phase::ShuttingDown);
        let deadline = Instant::now() + self.settings.shutdown_timeout;

        heartbeat_cancel.cancel();
        self.daemons.nfs.close();
        if let Some((api, _)) = &running.api {
            api.close();
        }
        self.daemons.rpcbind.close();
        self.daemons.bus.close();

        let Running {
            rpcbind,
            bus,
            nfs,
            api,
            heartbeat,
        } = running;

        await_exit("ganesha", nfs, deadline).await;
        await_exit("http", api.map(|(_, exit)| exit), deadline).await;
        await_exit("rpcbind", rpcbind, deadline).await;
        await_exit("dbus", bus, deadline).await;

        if let Some(heartbeat) = heartbeat {
            match timeout_at(deadline, heartbeat).await {
                Ok(Ok(Err(HeartbeatError::Stopped { cause }))) => debug!(%cause, "Heartbeat monitoring stopped."),
                Ok(Ok(result)) => debug!(?result, "Heartbeat monitoring finished."),
                Ok(Err(e)) => warn!(error = %e, "Heartbeat monitoring task failed."),
                Err(_) => warn!("Heartbeat monitoring did not stop before the shutdown deadline."),
            }
        }

        self.transition(Phase::Stopped);
    }

    fn transition(&mut self, next: Phase) {
        info!(from = %self.phase, to = %next, "Supervisor phase changed.");
        self.phase = next;
    }
}

/// Waits for the first of a stop request or any component stopping, and logs which it was.
async fn wait_for_stop(running: &mut Running, stop: &CancellationToken) {
    let (Some(rpcbind), Some(bus), Some(nfs), Some((_, api))) =
        (&mut running.rpcbind, &mut running.bus, &mut running.nfs, &mut running.api)
    else {
        return;
    };

    select! {
        _ = stop.cancelled() => info!("Shutdown requested."),
        result = rpcbind => log_exit("rpcbind", result),
        result = bus => log_exit("dbus", result),
        result = nfs => log_exit("ganesha", result),
        result = api => log_exit("http", result),
    }
}

fn log_exit<E: fmt::Display>(component: &str, result: Result<(), E>) {
    match result {
        Ok(()) => warn!(component, "Component stopped unexpectedly."),
        Err(e) => error!(component, error = %e, "Component stopped unexpectedly."),
    }
}

async fn await_exit<E: fmt::Display>(component: &str, exit: Option<ExitNotification<E>>, deadline: Instant) {
    let Some(exit) = exit else {
        return;
    };
    if exit.is_terminated() {
        return;
    }

    match timeout_at(deadline, exit).await {
        Ok(Ok(())) => debug!(component, "Component stopped."),
        Ok(Err(e)) => debug!(component, error = %e, "Component stopped with error."),
        Err(_) => warn!(component, "Component did not stop before the shutdown deadline."),
    }
}
