//! D-Bus implementation of the supervisor's bus and statistics interfaces.
#![deny(warnings)]
#![deny(missing_docs)]

use std::sync::Arc;

use async_trait::async_trait;
use keel_core::bus::{BusConnector, BusError, BusHandles};
use tracing::debug;
use zbus::{connection, Connection};

mod ganesha;
pub use self::ganesha::GaneshaStats;

mod signals;
pub use self::signals::DbusSignalBus;

/// Connects to a message bus daemon, the system bus by default.
#[derive(Clone, Debug, Default)]
pub struct SystemBusConnector {
    address: Option<String>,
}

impl SystemBusConnector {
    /// Creates a connector for the system bus at its well-known address.
    pub fn system() -> Self {
        Self::default()
    }

    /// Creates a connector for the bus at the given address, such as `unix:path=/run/dbus/system_bus_socket`.
    pub fn with_address<S: Into<String>>(address: S) -> Self {
        Self {
            address: Some(address.into()),
        }
    }

    async fn open(&self) -> Result<Connection, BusError> {
        let builder = match &self.address {
            Some(address) => connection::Builder::address(address.as_str()),
            None => connection::Builder::system(),
        };

        // Building a bus connection authenticates and sends `Hello` before returning.
        builder
            .map_err(|e| BusError::Connect { source: e.into() })?
            .build()
            .await
            .map_err(|e| BusError::Connect { source: e.into() })
    }
}

#[async_trait]
impl BusConnector for SystemBusConnector {
    async fn probe(&self) -> Result<(), BusError> {
        let connection = self.open().await?;
        debug!(unique_name = ?connection.unique_name().map(|n| n.to_string()), "Bus handshake succeeded.");
        Ok(())
    }

    async fn connect(&self) -> Result<BusHandles, BusError> {
        let connection = self.open().await?;
        Ok(BusHandles {
            signals: Arc::new(DbusSignalBus::new(connection.clone())),
            stats: Arc::new(GaneshaStats::new(connection)),
        })
    }
}
