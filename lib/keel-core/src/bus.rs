//! The control-plane bus, as seen by the supervisor.
//!
//! The supervisor only needs a narrow slice of the bus: checking that it accepts connections, subscribing to a signal
//! by match pattern, and querying the NFS server's statistics objects. These are expressed as traits so the
//! orchestration logic can be exercised without a real bus.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use keel_error::GenericError;
use snafu::Snafu;

use crate::stats::StatsSource;

/// Error talking to the bus.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)), visibility(pub))]
pub enum BusError {
    /// Connecting or completing the handshake failed.
    #[snafu(display("Failed to connect to the bus."))]
    Connect { source: GenericError },

    /// Adding or removing a signal match failed.
    #[snafu(display("Failed to update subscription for {}.", rule))]
    Subscribe { rule: String, source: GenericError },

    /// Receiving a message from an active subscription failed.
    #[snafu(display("Failed to receive signal."))]
    Receive { source: GenericError },

    /// A method call failed, or its reply could not be decoded.
    #[snafu(display("Call to {} failed.", method))]
    Call { method: String, source: GenericError },

    /// A signal arrived with a payload of an unexpected shape.
    #[snafu(display("Unexpected signal payload with signature '{}'.", signature))]
    UnexpectedPayload { signature: String },
}

/// Identifies a signal by object path, interface and member.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SignalMatch {
    pub path: &'static str,
    pub interface: &'static str,
    pub member: &'static str,
}

impl SignalMatch {
    /// Creates a new `SignalMatch`.
    pub const fn new(path: &'static str, interface: &'static str, member: &'static str) -> Self {
        Self {
            path,
            interface,
            member,
        }
    }
}

impl fmt::Display for SignalMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "type='signal',path='{}',interface='{}',member='{}'",
            self.path, self.interface, self.member
        )
    }
}

/// The payload of a received signal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SignalMessage {
    /// A single boolean.
    Bool(bool),

    /// Anything else.
    Other { signature: String },
}

impl SignalMessage {
    /// Decodes the payload as a single boolean.
    ///
    /// # Errors
    ///
    /// If the payload is not a single boolean, [`BusError::UnexpectedPayload`] is returned.
    pub fn decode_bool(&self) -> Result<bool, BusError> {
        match self {
            Self::Bool(value) => Ok(*value),
            Self::Other { signature } => Err(BusError::UnexpectedPayload {
                signature: signature.clone(),
            }),
        }
    }
}

/// Something that can subscribe to signals.
#[async_trait]
pub trait SignalBus: Send + Sync {
    /// Starts receiving signals matching `signal`.
    async fn subscribe(&self, signal: &SignalMatch) -> Result<Box<dyn SignalSubscription>, BusError>;
}

/// An active signal subscription.
#[async_trait]
pub trait SignalSubscription: Send {
    /// Waits for the next matching signal.
    ///
    /// Returns `None` once the subscription can no longer produce signals, such as when the bus connection is lost.
    async fn next_signal(&mut self) -> Option<Result<SignalMessage, BusError>>;

    /// Removes the match from the bus and ends the subscription.
    async fn unsubscribe(self: Box<Self>) -> Result<(), BusError>;
}

/// Handles to an established bus connection.
#[derive(Clone)]
pub struct BusHandles {
    pub signals: Arc<dyn SignalBus>,
    pub stats: Arc<dyn StatsSource>,
}

/// Establishes bus connections.
#[async_trait]
pub trait BusConnector: Send + Sync {
    /// Opens a throwaway connection and completes the handshake, to check that the bus is accepting clients.
    async fn probe(&self) -> Result<(), BusError>;

    /// Opens the long-lived connection used for signals and statistics.
    async fn connect(&self) -> Result<BusHandles, BusError>;
}
