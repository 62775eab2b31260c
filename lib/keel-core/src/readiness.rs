//! Deadline-bounded readiness polling.

use std::{future::Future, time::Duration};

use snafu::Snafu;
use tokio::{
    select,
    time::{interval, sleep_until, timeout_at, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Error waiting for a component to become ready.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ReadinessError {
    /// The deadline passed before the probe succeeded.
    #[snafu(display("Timed out after {:?} waiting for {} to become ready.", timeout, component))]
    TimedOut { component: String, timeout: Duration },

    /// The wait was cancelled.
    #[snafu(display("Cancelled while waiting for {} to become ready.", component))]
    Cancelled { component: String },
}

/// Polls a probe on a fixed interval until it reports ready.
///
/// The first poll happens immediately, and subsequent polls follow at a fixed interval with no backoff. Probes are
/// expected to be cheap; a probe that needs to rate-limit itself should do so internally.
#[derive(Clone, Debug)]
pub struct ReadinessGate {
    poll_interval: Duration,
}

impl ReadinessGate {
    /// Default interval between probe calls.
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

    /// Creates a new `ReadinessGate` with the default poll interval.
    pub fn new() -> Self {
        Self {
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
        }
    }

    /// Waits until `probe` returns `true`.
    ///
    /// Each probe call is bounded by `deadline` as well, so a hung probe cannot extend the wait.
    ///
    /// # Errors
    ///
    /// Returns [`ReadinessError::TimedOut`] once `deadline` is reached without a successful probe, or
    /// [`ReadinessError::Cancelled`] as soon as `cancel` is triggered, whichever comes first.
    pub async fn wait_until_ready<F, Fut>(
        &self, component: &str, deadline: Instant, cancel: &CancellationToken, mut probe: F,
    ) -> Result<(), ReadinessError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let started = Instant::now();
        let timed_out = || ReadinessError::TimedOut {
            component: component.to_string(),
            timeout: deadline.saturating_duration_since(started),
        };
        let cancelled = || ReadinessError::Cancelled {
            component: component.to_string(),
        };

        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut attempts = 0usize;
        loop {
            select! {
                biased;

                _ = cancel.cancelled() => return Err(cancelled()),
                _ = sleep_until(deadline) => return Err(timed_out()),
                _ = ticker.tick() => {}
            }

            attempts += 1;
            select! {
                biased;

                _ = cancel.cancelled() => return Err(cancelled()),
                result = timeout_at(deadline, probe()) => match result {
                    Ok(true) => {
                        info!(component, attempts, elapsed = ?started.elapsed(), "Component ready.");
                        return Ok(());
                    }
                    Ok(false) => debug!(component, attempts, "Component not ready yet."),
                    Err(_) => return Err(timed_out()),
                },
            }
        }
    }
}
