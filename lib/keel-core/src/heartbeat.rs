//! NFS server heartbeat monitoring.
//!
//! The NFS server periodically emits a heartbeat signal on the bus while it is healthy, and stays silent otherwise.
//! [`HeartbeatBroadcaster`] holds the single subscription to that signal and republishes each heartbeat to any number of
//! independently registered watchers, so the absence of a heartbeat within some window is how consumers observe that
//! the server is not ready.

use std::{
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

use metrics::{counter, gauge, Counter, Gauge};
use snafu::Snafu;
use tokio::{
    select,
    sync::{mpsc, oneshot},
    time::sleep,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{BusError, SignalBus, SignalMatch};

/// The signal emitted by the NFS server while it is healthy.
pub const HEARTBEAT_SIGNAL: SignalMatch =
    SignalMatch::new("/org/ganesha/nfsd/heartbeat", "org.ganesha.nfsd.admin", "heartbeat");

/// Why a broadcaster stopped, as delivered to each watcher.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Snafu)]
#[snafu(context(suffix(false)))]
pub enum WatchError {
    /// Monitoring was cancelled.
    #[snafu(display("Heartbeat monitoring was cancelled."))]
    Cancelled,

    /// The bus subscription ended on its own.
    #[snafu(display("Heartbeat subscription closed."))]
    SubscriptionClosed,
}

/// Error running the broadcaster.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum HeartbeatError {
    /// The broadcaster was already running, or has already stopped.
    #[snafu(display("Heartbeat broadcaster has already been started."))]
    AlreadyStarted,

    /// Subscribing to the heartbeat signal failed.
    #[snafu(display("Failed to subscribe to heartbeat signal."))]
    Subscribe { source: BusError },

    /// Monitoring stopped.
    #[snafu(display("Heartbeat monitoring stopped: {}", cause))]
    Stopped { cause: WatchError },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Idle,
    Monitoring,
    Stopped(WatchError),
}

struct Watcher {
    status_tx: mpsc::Sender<bool>,
    error_tx: oneshot::Sender<WatchError>,
}

struct Registry {
    state: State,
    watchers: Vec<Watcher>,
}

struct Telemetry {
    heartbeats_received: Counter,
    heartbeats_invalid: Counter,
    watchers: Gauge,
}

impl Telemetry {
    fn new() -> Self {
        Self {
            heartbeats_received: counter!("supervisor_heartbeats_received_total"),
            heartbeats_invalid: counter!("supervisor_heartbeats_invalid_total"),
            watchers: gauge!("supervisor_heartbeat_watchers"),
        }
    }
}

struct Inner {
    bus: Arc<dyn SignalBus>,
    registry: RwLock<Registry>,
    telemetry: Telemetry,
}

/// Fans out heartbeat status to registered watchers.
///
/// Cheap to clone; all clones share the same subscription and watcher registry. Watchers may be added and removed at
/// any time, from any task.
#[derive(Clone)]
pub struct HeartbeatBroadcaster {
    inner: Arc<Inner>,
}

impl HeartbeatBroadcaster {
    /// Creates a new `HeartbeatBroadcaster` over the given bus connection.
    ///
    /// Nothing is subscribed until [`run`][Self::run] is called.
    pub fn new(bus: Arc<dyn SignalBus>) -> Self {
        Self {
            inner: Arc::new(Inner {
                bus,
                registry: RwLock::new(Registry {
                    state: State::Idle,
                    watchers: Vec::new(),
                }),
                telemetry: Telemetry::new(),
            }),
        }
    }

    /// Registers a watcher.
    ///
    /// Watchers are identified by their status channel. Registering a status channel that is already registered
    /// replaces its error channel. If the broadcaster has already stopped, the terminal error is sent to `error_tx`
    /// straight away and nothing is registered.
    pub fn add_watcher(&self, status_tx: mpsc::Sender<bool>, error_tx: oneshot::Sender<WatchError>) {
        let mut registry = self.write_registry();

        if let State::Stopped(cause) = registry.state {
            let _ = error_tx.send(cause);
            return;
        }

        match registry.watchers.iter_mut().find(|w| w.status_tx.same_channel(&status_tx)) {
            Some(existing) => existing.error_tx = error_tx,
            None => registry.watchers.push(Watcher { status_tx, error_tx }),
        }
        self.inner.telemetry.watchers.set(registry.watchers.len() as f64);
    }

    /// Deregisters a watcher.
    ///
    /// Once this returns, no heartbeat received afterwards is delivered to `status_tx`. Does nothing if the channel is
    /// not registered.
    pub fn remove_watcher(&self, status_tx: &mpsc::Sender<bool>) {
        let mut registry = self.write_registry();
        registry.watchers.retain(|w| !w.status_tx.same_channel(status_tx));
        self.inner.telemetry.watchers.set(registry.watchers.len() as f64);
    }

    /// Returns the number of registered watchers.
    pub fn watcher_count(&self) -> usize {
        self.read_registry().watchers.len()
    }

    /// Waits up to `timeout` for the next heartbeat and returns its status.
    ///
    /// Returns `None` if no heartbeat arrives in time or if the broadcaster stops. The temporary watcher is removed
    /// before returning, and also if the returned future is dropped early.
    pub async fn wait_for_status(&self, timeout: Duration) -> Option<bool> {
        let (status_tx, mut status_rx) = mpsc::channel(1);
        let (error_tx, error_rx) = oneshot::channel();

        self.add_watcher(status_tx.clone(), error_tx);
        let _guard = WatcherGuard {
            broadcaster: self,
            status_tx,
        };

        select! {
            status = status_rx.recv() => status,
            result = error_rx => {
                if let Ok(cause) = result {
                    debug!(%cause, "Finished watching for heartbeats.");
                }
                None
            },
            _ = sleep(timeout) => {
                debug!(?timeout, "Timed out waiting for heartbeat.");
                None
            },
        }
    }

    /// Subscribes to the heartbeat signal and forwards heartbeats until cancelled.
    ///
    /// Each heartbeat is delivered to every registered watcher in registration order, waiting on any watcher whose
    /// channel is full. Heartbeats whose payload is not a single boolean are logged and skipped.
    ///
    /// On cancellation, or if the subscription ends on its own, the signal match is removed, every registered watcher
    /// is sent the cause on its error channel and deregistered, and the broadcaster stops for good.
    ///
    /// # Errors
    ///
    /// Always returns an error describing why monitoring ended: [`HeartbeatError::Stopped`] after running, or an error
    /// without side effects if the broadcaster was not idle or the subscription could not be established.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), HeartbeatError> {
        {
            let mut registry = self.write_registry();
            if registry.state != State::Idle {
                return Err(HeartbeatError::AlreadyStarted);
            }
            registry.state = State::Monitoring;
        }

        let mut subscription = match self.inner.bus.subscribe(&HEARTBEAT_SIGNAL).await {
            Ok(subscription) => subscription,
            Err(source) => {
                self.write_registry().state = State::Idle;
                return Err(HeartbeatError::Subscribe { source });
            }
        };

        info!(signal = %HEARTBEAT_SIGNAL, "Monitoring NFS server heartbeats.");

        let cause = loop {
            let next = select! {
                biased;

                _ = cancel.cancelled() => break WatchError::Cancelled,
                next = subscription.next_signal() => next,
            };

            let message = match next {
                Some(Ok(message)) => message,
                Some(Err(error)) => {
                    warn!(%error, "Failed to receive heartbeat.");
                    continue;
                }
                None => break WatchError::SubscriptionClosed,
            };

            let status = match message.decode_bool() {
                Ok(status) => status,
                Err(error) => {
                    self.inner.telemetry.heartbeats_invalid.increment(1);
                    warn!(%error, "Ignoring malformed heartbeat.");
                    continue;
                }
            };

            self.inner.telemetry.heartbeats_received.increment(1);
            if !self.deliver(status, &cancel).await {
                break WatchError::Cancelled;
            }
        };

        if let Err(error) = subscription.unsubscribe().await {
            warn!(%error, "Failed to remove heartbeat subscription.");
        }

        let watchers = {
            let mut registry = self.write_registry();
            registry.state = State::Stopped(cause);
            std::mem::take(&mut registry.watchers)
        };
        self.inner.telemetry.watchers.set(0.0);

        debug!(%cause, watchers = watchers.len(), "Notifying heartbeat watchers.");
        for watcher in watchers {
            let _ = watcher.error_tx.send(cause);
        }

        info!(%cause, "Stopped monitoring NFS server heartbeats.");
        Err(HeartbeatError::Stopped { cause })
    }

    /// Sends `status` to every registered watcher. Returns `false` if cancelled mid-delivery.
    async fn deliver(&self, status: bool, cancel: &CancellationToken) -> bool {
        // Sending can block on a slow watcher, so we work off a snapshot rather than holding the lock while waiting.
        // Registration can then proceed during delivery.
        let targets = self
            .read_registry()
            .watchers
            .iter()
            .map(|w| w.status_tx.clone())
            .collect::<Vec<_>>();

        for status_tx in targets {
            // Watchers removed since the snapshot was taken are skipped.
            if !self.is_registered(&status_tx) {
                continue;
            }

            select! {
                biased;

                _ = cancel.cancelled() => return false,
                result = status_tx.send(status) => if result.is_err() {
                    debug!("Heartbeat watcher went away without deregistering. Removing.");
                    self.remove_watcher(&status_tx);
                },
            }
        }

        true
    }

    fn is_registered(&self, status_tx: &mpsc::Sender<bool>) -> bool {
        self.read_registry()
            .watchers
            .iter()
            .any(|w| w.status_tx.same_channel(status_tx))
    }

    fn read_registry(&self) -> std::sync::RwLockReadGuard<'_, Registry> {
        self.inner.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_registry(&self) -> std::sync::RwLockWriteGuard<'_, Registry> {
        self.inner.registry.write().unwrap_or_else(PoisonError::into_inner)
    }
}

struct WatcherGuard<'a> {
    broadcaster: &'a HeartbeatBroadcaster,
    status_tx: mpsc::Sender<bool>,
}

impl Drop for WatcherGuard<'_> {
    fn drop(&mut self) {
        self.broadcaster.remove_watcher(&self.status_tx);
    }
}
