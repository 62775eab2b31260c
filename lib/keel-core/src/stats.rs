//! NFS server I/O statistics.

use async_trait::async_trait;

use crate::bus::BusError;

/// Cumulative counters for one direction (read or write) of I/O.
///
/// Counters only reset when the server restarts or is explicitly asked to clear its statistics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BasicIo {
    pub requested: u64,
    pub transferred: u64,
    pub total: u64,
    pub errors: u64,
    /// Nanoseconds.
    pub latency: u64,
    /// Nanoseconds.
    pub queue_wait: u64,
}

/// A timestamp as reported by the server.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Timespec {
    pub seconds: u64,
    pub nanos: u64,
}

/// The common header of every statistics reply.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StatsHeader {
    pub status: bool,
    pub error: String,
    pub time: Timespec,
}

/// Read/write statistics for one client and protocol.
///
/// When `header.status` is false, the server sent no counters and `read`/`write` are zeroed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BasicStats {
    pub header: StatsHeader,
    pub read: BasicIo,
    pub write: BasicIo,
}

/// Statistics for a single export.
///
/// `protocol` names the protocol being reported, such as `NFSv40`. An export accessed over several protocols is
/// reported once per protocol, under the same ID.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExportIoStats {
    pub export_id: u16,
    pub protocol: String,
    pub read: BasicIo,
    pub write: BasicIo,
}

/// Statistics for every export.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExportIoStatsList {
    pub header: StatsHeader,
    pub exports: Vec<ExportIoStats>,
}

/// A client known to the server, with the protocols it has been seen using.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Client {
    /// Internal reference for the connection, typically an address such as `::ffff:172.17.0.1`.
    pub address: String,
    pub nfs_v3: bool,
    pub mnt_v3: bool,
    pub nlm_v4: bool,
    pub rquota: bool,
    pub nfs_v40: bool,
    pub nfs_v41: bool,
    pub nfs_v42: bool,
    pub plan9: bool,
    pub last_time: Timespec,
}

/// Protocols with per-client I/O statistics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientProtocol {
    NfsV40,
    NfsV41,
}

impl ClientProtocol {
    /// Returns `true` if the client has used this protocol.
    pub fn used_by(&self, client: &Client) -> bool {
        match self {
            Self::NfsV40 => client.nfs_v40,
            Self::NfsV41 => client.nfs_v41,
        }
    }
}

/// A source of I/O statistics.
#[async_trait]
pub trait StatsSource: Send + Sync {
    /// Lists every client seen since the server started.
    async fn show_clients(&self) -> Result<Vec<Client>, BusError>;

    /// Fetches I/O statistics for one client over one protocol.
    async fn client_io_stats(&self, protocol: ClientProtocol, address: &str) -> Result<BasicStats, BusError>;

    /// Fetches I/O statistics for every export.
    async fn export_io_stats(&self) -> Result<ExportIoStatsList, BusError>;
}
