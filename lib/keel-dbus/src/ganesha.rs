//! Statistics queries against the NFS server's management objects.

use async_trait::async_trait;
use keel_core::{
    bus::BusError,
    stats::{
        BasicIo, BasicStats, Client, ClientProtocol, ExportIoStats, ExportIoStatsList, StatsHeader, StatsSource,
        Timespec,
    },
};
use keel_error::generic_error;
use zbus::{Connection, Message};

const DESTINATION: &str = "org.ganesha.nfsd";
const CLIENT_MGR_PATH: &str = "/org/ganesha/nfsd/ClientMgr";
const CLIENT_MGR_INTERFACE: &str = "org.ganesha.nfsd.clientmgr";
const CLIENT_STATS_INTERFACE: &str = "org.ganesha.nfsd.clientstats";
const EXPORT_MGR_PATH: &str = "/org/ganesha/nfsd/ExportMgr";
const EXPORT_STATS_INTERFACE: &str = "org.ganesha.nfsd.exportstats";

type WireTimespec = (u64, u64);
type WireBasicIo = (u64, u64, u64, u64, u64, u64);
type WireClient = (String, bool, bool, bool, bool, bool, bool, bool, bool, WireTimespec);
type WireExport = (u16, String, WireBasicIo, WireBasicIo);
type WireHeader = (bool, String, WireTimespec);

/// Queries the NFS server's `ClientMgr` and `ExportMgr` objects.
#[derive(Clone)]
pub struct GaneshaStats {
    connection: Connection,
}

impl GaneshaStats {
    /// Creates a new `GaneshaStats` over the given connection.
    pub fn new(connection: Connection) -> Self {
        Self { connection }
    }

    async fn call<B>(&self, path: &str, interface: &str, method: &str, body: &B) -> Result<Message, BusError>
    where
        B: serde::Serialize + zbus::zvariant::DynamicType + Sync,
    {
        self.connection
            .call_method(Some(DESTINATION), path, Some(interface), method, body)
            .await
            .map_err(|e| BusError::Call {
                method: format!("{}.{}", interface, method),
                source: e.into(),
            })
    }
}

#[async_trait]
impl StatsSource for GaneshaStats {
    async fn show_clients(&self) -> Result<Vec<Client>, BusError> {
        let reply = self.call(CLIENT_MGR_PATH, CLIENT_MGR_INTERFACE, "ShowClients", &()).await?;
        decode_clients(&reply)
    }

    async fn client_io_stats(&self, protocol: ClientProtocol, address: &str) -> Result<BasicStats, BusError> {
        let method = match protocol {
            ClientProtocol::NfsV40 => "GetNFSv40IO",
            ClientProtocol::NfsV41 => "GetNFSv41IO",
        };

        let reply = self.call(CLIENT_MGR_PATH, CLIENT_STATS_INTERFACE, method, &address).await?;
        decode_basic_stats(&reply, method)
    }

    async fn export_io_stats(&self) -> Result<ExportIoStatsList, BusError> {
        let reply = self.call(EXPORT_MGR_PATH, EXPORT_STATS_INTERFACE, "GetNFSIO", &()).await?;
        decode_export_stats(&reply)
    }
}

fn decode_error(method: &str, e: zbus::Error) -> BusError {
    BusError::Call {
        method: method.to_string(),
        source: e.into(),
    }
}

fn decode_clients(reply: &Message) -> Result<Vec<Client>, BusError> {
    let (_, clients) = reply
        .body()
        .deserialize::<(WireTimespec, Vec<WireClient>)>()
        .map_err(|e| decode_error("ShowClients", e))?;

    Ok(clients.into_iter().map(client).collect())
}

// Replies carry counters only when their status is true, so we try the full shape first and then fall back to the
// header alone.
fn decode_basic_stats(reply: &Message, method: &str) -> Result<BasicStats, BusError> {
    let body = reply.body();
    if let Ok((status, error, time, read, write)) =
        body.deserialize::<(bool, String, WireTimespec, WireBasicIo, WireBasicIo)>()
    {
        return Ok(BasicStats {
            header: header((status, error, time)),
            read: basic_io(read),
            write: basic_io(write),
        });
    }

    let wire_header = body.deserialize::<WireHeader>().map_err(|e| decode_error(method, e))?;
    let header = checked_header(wire_header, method)?;
    Ok(BasicStats {
        header,
        ..Default::default()
    })
}

fn decode_export_stats(reply: &Message) -> Result<ExportIoStatsList, BusError> {
    let body = reply.body();
    if let Ok((status, error, time, exports)) = body.deserialize::<(bool, String, WireTimespec, Vec<WireExport>)>() {
        return Ok(ExportIoStatsList {
            header: header((status, error, time)),
            exports: exports.into_iter().map(export).collect(),
        });
    }

    let wire_header = body.deserialize::<WireHeader>().map_err(|e| decode_error("GetNFSIO", e))?;
    let header = checked_header(wire_header, "GetNFSIO")?;
    Ok(ExportIoStatsList {
        header,
        exports: Vec::new(),
    })
}

fn checked_header(wire: WireHeader, method: &str) -> Result<StatsHeader, BusError> {
    let header = header(wire);
    if header.status {
        return Err(BusError::Call {
            method: method.to_string(),
            source: generic_error!("successful reply is missing its statistics"),
        });
    }
    Ok(header)
}

fn header((status, error, time): WireHeader) -> StatsHeader {
    StatsHeader {
        status,
        error,
        time: timespec(time),
    }
}

fn timespec((seconds, nanos): WireTimespec) -> Timespec {
    Timespec { seconds, nanos }
}

fn basic_io((requested, transferred, total, errors, latency, queue_wait): WireBasicIo) -> BasicIo {
    BasicIo {
        requested,
        transferred,
        total,
        errors,
        latency,
        queue_wait,
    }
}

fn client(
    (address, nfs_v3, mnt_v3, nlm_v4, rquota, nfs_v40, nfs_v41, nfs_v42, plan9, last_time): WireClient,
) -> Client {
    Client {
        address,
        nfs_v3,
        mnt_v3,
        nlm_v4,
        rquota,
        nfs_v40,
        nfs_v41,
        nfs_v42,
        plan9,
        last_time: timespec(last_time),
    }
}

fn export((export_id, protocol, read, write): WireExport) -> ExportIoStats {
    ExportIoStats {
        export_id,
        protocol,
        read: basic_io(read),
        write: basic_io(write),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Only the body matters to the decoders, so a signal message stands in for a method reply.
    fn reply<B>(body: &B) -> Message
    where
        B: serde::Serialize + zbus::zvariant::DynamicType,
    {
        Message::signal("/org/ganesha/nfsd/ClientMgr", "org.ganesha.nfsd.clientstats", "Reply")
            .unwrap()
            .build(body)
            .unwrap()
    }

    #[test]
    fn full_basic_stats() {
        let read: WireBasicIo = (4096, 4000, 10, 1, 2_500_000_000, 500_000_000);
        let write: WireBasicIo = (8192, 8192, 2, 0, 1_000, 10);
        let message = reply(&(true, "OK".to_string(), (1700000000u64, 5u64), read, write));

        let stats = decode_basic_stats(&message, "GetNFSv40IO").unwrap();
        assert!(stats.header.status);
        assert_eq!(stats.header.error, "OK");
        assert_eq!(
            stats.header.time,
            Timespec {
                seconds: 1700000000,
                nanos: 5
            }
        );
        assert_eq!(stats.read.requested, 4096);
        assert_eq!(stats.read.transferred, 4000);
        assert_eq!(stats.read.latency, 2_500_000_000);
        assert_eq!(stats.write.total, 2);
    }

    #[test]
    fn failed_basic_stats_has_header_only() {
        let message = reply(&(false, "Client IP address not found".to_string(), (1u64, 2u64)));

        let stats = decode_basic_stats(&message, "GetNFSv41IO").unwrap();
        assert!(!stats.header.status);
        assert_eq!(stats.header.error, "Client IP address not found");
        assert_eq!(stats.read, BasicIo::default());
        assert_eq!(stats.write, BasicIo::default());
    }

    #[test]
    fn successful_header_without_counters_is_an_error() {
        let message = reply(&(true, "OK".to_string(), (1u64, 2u64)));
        assert!(decode_basic_stats(&message, "GetNFSv40IO").is_err());
    }

    #[test]
    fn unrelated_shape_is_an_error() {
        let message = reply(&"nonsense");
        let err = decode_export_stats(&message).unwrap_err();
        assert!(matches!(err, BusError::Call { ref method, .. } if method == "GetNFSIO"));
    }

    #[test]
    fn export_stats() {
        let exports: Vec<WireExport> = vec![
            (1, "NFSv40".to_string(), (1, 2, 3, 4, 5, 6), (7, 8, 9, 10, 11, 12)),
            (1, "NFSv42".to_string(), (0, 0, 0, 0, 0, 0), (100, 100, 1, 0, 0, 0)),
        ];
        let message = reply(&(true, "OK".to_string(), (0u64, 0u64), exports));

        let stats = decode_export_stats(&message).unwrap();
        assert_eq!(stats.exports.len(), 2);
        assert_eq!(stats.exports[0].export_id, 1);
        assert_eq!(stats.exports[0].protocol, "NFSv40");
        assert_eq!(stats.exports[0].write.queue_wait, 12);
        assert_eq!(stats.exports[1].protocol, "NFSv42");
        assert_eq!(stats.exports[1].write.requested, 100);
    }

    #[test]
    fn clients() {
        let clients: Vec<WireClient> = vec![(
            "::ffff:172.17.0.1".to_string(),
            false,
            false,
            false,
            false,
            true,
            false,
            true,
            false,
            (10, 20),
        )];
        let message = reply(&((0u64, 0u64), clients));

        let decoded = decode_clients(&message).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].address, "::ffff:172.17.0.1");
        assert!(decoded[0].nfs_v40);
        assert!(!decoded[0].nfs_v41);
        assert!(decoded[0].nfs_v42);
        assert_eq!(decoded[0].last_time.seconds, 10);
    }
}
