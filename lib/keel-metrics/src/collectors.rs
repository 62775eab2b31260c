//! I/O statistics collectors.

use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use keel_core::stats::{BasicIo, ClientProtocol, StatsSource};
use tracing::{debug, warn};

use crate::exposition::{MetricKind, PrometheusWriter};

/// Something that writes metric families on each scrape.
#[async_trait]
pub trait Collector: Send + Sync {
    /// Writes the current values of this collector's families.
    ///
    /// Collection failures are logged and the affected families omitted.
    async fn collect(&self, writer: &mut PrometheusWriter);
}

/// Naming and labelling shared by the collectors.
#[derive(Clone, Debug, Default)]
pub struct MetricContext {
    /// Prefix of every family name.
    pub prefix: String,

    /// Value of the `name` label.
    pub name: String,

    /// Value of the `namespace` label.
    pub namespace: String,
}

/// NFS protocol versions with I/O statistics.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
enum NfsVersion {
    V40,
    V41,
    V42,
}

impl NfsVersion {
    fn from_protocol(protocol: &str) -> Option<Self> {
        match protocol {
            "NFSv40" => Some(Self::V40),
            "NFSv41" => Some(Self::V41),
            "NFSv42" => Some(Self::V42),
            _ => None,
        }
    }

    fn segment(&self) -> &'static str {
        match self {
            Self::V40 => "nfs_v40",
            Self::V41 => "nfs_v41",
            Self::V42 => "nfs_v42",
        }
    }

    fn display_name(&self) -> &'static str {
        match self {
            Self::V40 => "NFSv4.0",
            Self::V41 => "NFSv4.1",
            Self::V42 => "NFSv4.2",
        }
    }
}

impl From<ClientProtocol> for NfsVersion {
    fn from(protocol: ClientProtocol) -> Self {
        match protocol {
            ClientProtocol::NfsV40 => Self::V40,
            ClientProtocol::NfsV41 => Self::V41,
        }
    }
}

struct IoFamily {
    suffix: &'static str,
    help: &'static str,
    value: fn(&BasicIo) -> f64,
}

const NANOS_PER_SECOND: f64 = 1e9;

// `{version}` in the help text is replaced by the protocol's display name.
const IO_FAMILIES: [IoFamily; 6] = [
    IoFamily {
        suffix: "requested_bytes_total",
        help: "Number of requested bytes for {version} operations",
        value: |io| io.requested as f64,
    },
    IoFamily {
        suffix: "transfered_bytes_total",
        help: "Number of transfered bytes for {version} operations",
        value: |io| io.transferred as f64,
    },
    IoFamily {
        suffix: "operations_total",
        help: "Number of operations for {version}",
        value: |io| io.total as f64,
    },
    IoFamily {
        suffix: "operations_errors_total",
        help: "Number of operations in error for {version}",
        value: |io| io.errors as f64,
    },
    IoFamily {
        suffix: "operations_latency_seconds_total",
        help: "Cumulative time consumed by operations for {version}",
        value: |io| io.latency as f64 / NANOS_PER_SECOND,
    },
    IoFamily {
        suffix: "operations_queue_wait_seconds_total",
        help: "Cumulative time spent in rpc wait queue for {version}",
        value: |io| io.queue_wait as f64 / NANOS_PER_SECOND,
    },
];

/// Read and write counters for one label set.
struct IoSample<'a> {
    client_address: Option<&'a str>,
    read: BasicIo,
    write: BasicIo,
}

/// Writes the six I/O families of one protocol version, each with a read and write sample per entry of `samples`.
fn write_io_families(
    writer: &mut PrometheusWriter, family_prefix: &str, version: NfsVersion, context: &MetricContext,
    samples: &[IoSample<'_>],
) {
    for family in &IO_FAMILIES {
        let name = format!("{}_{}_{}", family_prefix, version.segment(), family.suffix);
        let help = family.help.replace("{version}", version.display_name());
        writer.family(&name, Some(&help), MetricKind::Counter);

        for sample in samples {
            for (op, io) in [("read", &sample.read), ("write", &sample.write)] {
                let mut labels = vec![
                    ("op", op),
                    ("name", context.name.as_str()),
                    ("namespace", context.namespace.as_str()),
                ];
                if let Some(address) = sample.client_address {
                    labels.push(("clientip", address));
                }
                writer.sample(&name, &labels, (family.value)(io));
            }
        }
    }
}

fn accumulate(total: &mut BasicIo, io: &BasicIo) {
    total.requested = total.requested.saturating_add(io.requested);
    total.transferred = total.transferred.saturating_add(io.transferred);
    total.total = total.total.saturating_add(io.total);
    total.errors = total.errors.saturating_add(io.errors);
    total.latency = total.latency.saturating_add(io.latency);
    total.queue_wait = total.queue_wait.saturating_add(io.queue_wait);
}

/// Collects per-export I/O statistics.
///
/// The server reports an export once per protocol it was accessed over. Exports are labelled with the configured
/// `name` and `namespace` rather than their server-side ID, so every export reported over a protocol contributes to
/// that protocol's series.
pub struct ExportsCollector {
    stats: Arc<dyn StatsSource>,
    context: MetricContext,
}

impl ExportsCollector {
    /// Creates a new `ExportsCollector`.
    pub fn new(stats: Arc<dyn StatsSource>, context: MetricContext) -> Self {
        Self { stats, context }
    }
}

#[async_trait]
impl Collector for ExportsCollector {
    async fn collect(&self, writer: &mut PrometheusWriter) {
        let list = match self.stats.export_io_stats().await {
            Ok(list) => list,
            Err(error) => {
                warn!(%error, "Failed to get NFS statistics for exports.");
                return;
            }
        };

        if !list.header.status {
            debug!(error = %list.header.error, "NFS server reported no export statistics.");
            return;
        }

        // Exports share one label set, so exports seen over the same protocol are summed into a single series.
        let mut by_version = BTreeMap::<NfsVersion, IoSample<'_>>::new();
        for export in &list.exports {
            match NfsVersion::from_protocol(&export.protocol) {
                Some(version) => {
                    let sample = by_version.entry(version).or_insert(IoSample {
                        client_address: None,
                        read: BasicIo::default(),
                        write: BasicIo::default(),
                    });
                    accumulate(&mut sample.read, &export.read);
                    accumulate(&mut sample.write, &export.write);
                }
                None => warn!(protocol = %export.protocol, "Unhandled NFS version."),
            }
        }

        for (version, sample) in by_version {
            write_io_families(writer, &self.context.prefix, version, &self.context, &[sample]);
        }
    }
}

/// Collects per-client I/O statistics.
///
/// The server only tracks per-client statistics for NFSv4.0 and NFSv4.1, and each client is only queried for the
/// protocols it has been seen using.
pub struct ClientsCollector {
    stats: Arc<dyn StatsSource>,
    context: MetricContext,
}

impl ClientsCollector {
    /// Creates a new `ClientsCollector`.
    pub fn new(stats: Arc<dyn StatsSource>, context: MetricContext) -> Self {
        Self { stats, context }
    }
}

#[async_trait]
impl Collector for ClientsCollector {
    async fn collect(&self, writer: &mut PrometheusWriter) {
        let clients = match self.stats.show_clients().await {
            Ok(clients) => clients,
            Err(error) => {
                warn!(%error, "Failed to get NFS client list.");
                return;
            }
        };

        let mut by_version = BTreeMap::<NfsVersion, Vec<IoSample<'_>>>::new();
        for client in &clients {
            for protocol in [ClientProtocol::NfsV40, ClientProtocol::NfsV41] {
                if !protocol.used_by(client) {
                    continue;
                }

                let version = NfsVersion::from(protocol);
                let stats = match self.stats.client_io_stats(protocol, &client.address).await {
                    Ok(stats) => stats,
                    Err(error) => {
                        warn!(
                            %error,
                            client = %client.address,
                            version = version.display_name(),
                            "Failed to get NFS statistics for client."
                        );
                        continue;
                    }
                };

                if !stats.header.status {
                    debug!(
                        client = %client.address,
                        version = version.display_name(),
                        error = %stats.header.error,
                        "NFS server reported no statistics for client."
                    );
                    continue;
                }

                by_version.entry(version).or_default().push(IoSample {
                    client_address: Some(&client.address),
                    read: stats.read,
                    write: stats.write,
                });
            }
        }

        let family_prefix = format!("{}_clients", self.context.prefix);
        for (version, samples) in by_version {
            write_io_families(writer, &family_prefix, version, &self.context, &samples);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;

    use keel_core::{
        bus::BusError,
        stats::{BasicStats, Client, ExportIoStats, ExportIoStatsList, StatsHeader},
    };
    use keel_error::generic_error;

    use super::*;

    #[derive(Default)]
    pub(crate) struct FakeStats {
        pub(crate) exports: Option<ExportIoStatsList>,
        pub(crate) clients: Option<Vec<Client>>,
        pub(crate) client_stats: HashMap<(String, &'static str), BasicStats>,
    }

    fn unavailable(method: &str) -> BusError {
        BusError::Call {
            method: method.to_string(),
            source: generic_error!("no reply"),
        }
    }

    fn protocol_key(protocol: ClientProtocol) -> &'static str {
        match protocol {
            ClientProtocol::NfsV40 => "v40",
            ClientProtocol::NfsV41 => "v41",
        }
    }

    #[async_trait]
    impl StatsSource for FakeStats {
        async fn show_clients(&self) -> Result<Vec<Client>, BusError> {
            self.clients.clone().ok_or_else(|| unavailable("ShowClients"))
        }

        async fn client_io_stats(&self, protocol: ClientProtocol, address: &str) -> Result<BasicStats, BusError> {
            self.client_stats
                .get(&(address.to_string(), protocol_key(protocol)))
                .cloned()
                .ok_or_else(|| unavailable("GetNFSv4xIO"))
        }

        async fn export_io_stats(&self) -> Result<ExportIoStatsList, BusError> {
            self.exports.clone().ok_or_else(|| unavailable("GetNFSIO"))
        }
    }

    pub(crate) fn ok_header() -> StatsHeader {
        StatsHeader {
            status: true,
            error: "OK".to_string(),
            ..Default::default()
        }
    }

    pub(crate) fn io(requested: u64, latency: u64) -> BasicIo {
        BasicIo {
            requested,
            transferred: requested,
            total: 1,
            errors: 0,
            latency,
            queue_wait: 250_000_000,
        }
    }

    pub(crate) fn context() -> MetricContext {
        MetricContext {
            prefix: "storageos".to_string(),
            name: "pvc-1".to_string(),
            namespace: "default".to_string(),
        }
    }

    async fn collect(collector: &dyn Collector) -> String {
        let mut writer = PrometheusWriter::new();
        collector.collect(&mut writer).await;
        writer.finish()
    }

    #[tokio::test]
    async fn exports_by_protocol() {
        let stats = FakeStats {
            exports: Some(ExportIoStatsList {
                header: ok_header(),
                exports: vec![
                    ExportIoStats {
                        export_id: 1,
                        protocol: "NFSv42".to_string(),
                        read: io(4096, 1_500_000_000),
                        write: io(8192, 0),
                    },
                    ExportIoStats {
                        export_id: 1,
                        protocol: "NFSv40".to_string(),
                        read: io(10, 0),
                        write: io(20, 0),
                    },
                ],
            }),
            ..Default::default()
        };
        let output = collect(&ExportsCollector::new(Arc::new(stats), context())).await;

        assert!(output.contains(
            "# HELP storageos_nfs_v42_requested_bytes_total Number of requested bytes for NFSv4.2 operations\n\
             # TYPE storageos_nfs_v42_requested_bytes_total counter\n\
             storageos_nfs_v42_requested_bytes_total{op=\"read\",name=\"pvc-1\",namespace=\"default\"} 4096\n\
             storageos_nfs_v42_requested_bytes_total{op=\"write\",name=\"pvc-1\",namespace=\"default\"} 8192\n"
        ));
        assert!(output.contains(
            "storageos_nfs_v42_operations_latency_seconds_total{op=\"read\",name=\"pvc-1\",namespace=\"default\"} 1.5\n"
        ));
        assert!(output.contains(
            "storageos_nfs_v40_operations_queue_wait_seconds_total{op=\"write\",name=\"pvc-1\",namespace=\"default\"} 0.25\n"
        ));
        assert!(output.contains("# HELP storageos_nfs_v40_operations_errors_total Number of operations in error for NFSv4.0\n"));
        assert!(!output.contains("nfs_v41"));

        // 2 protocols, 6 families each, with a HELP, a TYPE and two samples per family.
        assert_eq!(output.lines().count(), 2 * 6 * 4);

        // Families of one version are written together, in version order.
        let v40 = output.find("storageos_nfs_v40_").unwrap();
        let v42 = output.find("storageos_nfs_v42_").unwrap();
        assert!(v40 < v42);
    }

    #[tokio::test]
    async fn exports_sharing_a_protocol_are_summed() {
        let stats = FakeStats {
            exports: Some(ExportIoStatsList {
                header: ok_header(),
                exports: vec![
                    ExportIoStats {
                        export_id: 1,
                        protocol: "NFSv41".to_string(),
                        read: io(100, 500_000_000),
                        write: io(1, 0),
                    },
                    ExportIoStats {
                        export_id: 2,
                        protocol: "NFSv41".to_string(),
                        read: io(28, 1_000_000_000),
                        write: io(2, 0),
                    },
                ],
            }),
            ..Default::default()
        };
        let output = collect(&ExportsCollector::new(Arc::new(stats), context())).await;

        let read_requested = output
            .lines()
            .filter(|line| line.starts_with("storageos_nfs_v41_requested_bytes_total{op=\"read\""))
            .collect::<Vec<_>>();
        assert_eq!(
            read_requested,
            ["storageos_nfs_v41_requested_bytes_total{op=\"read\",name=\"pvc-1\",namespace=\"default\"} 128"]
        );
        assert!(output.contains(
            "storageos_nfs_v41_operations_latency_seconds_total{op=\"read\",name=\"pvc-1\",namespace=\"default\"} 1.5\n"
        ));
        assert!(output.contains("storageos_nfs_v41_operations_total{op=\"write\",name=\"pvc-1\",namespace=\"default\"} 2\n"));

        // One version, 6 families, each with a HELP, a TYPE and exactly one read and one write sample.
        assert_eq!(output.lines().count(), 6 * 4);
    }

    #[tokio::test]
    async fn unknown_protocol_is_skipped() {
        let stats = FakeStats {
            exports: Some(ExportIoStatsList {
                header: ok_header(),
                exports: vec![
                    ExportIoStats {
                        export_id: 1,
                        protocol: "NFSv3".to_string(),
                        ..Default::default()
                    },
                    ExportIoStats {
                        export_id: 1,
                        protocol: "NFSv41".to_string(),
                        ..Default::default()
                    },
                ],
            }),
            ..Default::default()
        };
        let output = collect(&ExportsCollector::new(Arc::new(stats), context())).await;

        assert!(output.contains("storageos_nfs_v41_operations_total{op=\"read\",name=\"pvc-1\",namespace=\"default\"} 0\n"));
        assert!(!output.contains("NFSv3"));
        assert_eq!(output.lines().count(), 6 * 4);
    }

    #[tokio::test]
    async fn export_failure_omits_families() {
        let output = collect(&ExportsCollector::new(Arc::new(FakeStats::default()), context())).await;
        assert_eq!(output, "");

        let stats = FakeStats {
            exports: Some(ExportIoStatsList {
                header: StatsHeader {
                    status: false,
                    error: "Export manager unavailable".to_string(),
                    ..Default::default()
                },
                exports: Vec::new(),
            }),
            ..Default::default()
        };
        let output = collect(&ExportsCollector::new(Arc::new(stats), context())).await;
        assert_eq!(output, "");
    }

    #[tokio::test]
    async fn clients_by_protocol_flag() {
        let stats = FakeStats {
            clients: Some(vec![
                Client {
                    address: "::ffff:10.0.0.1".to_string(),
                    nfs_v40: true,
                    nfs_v42: true,
                    ..Default::default()
                },
                Client {
                    address: "::ffff:10.0.0.2".to_string(),
                    nfs_v41: true,
                    ..Default::default()
                },
                Client {
                    address: "::ffff:10.0.0.3".to_string(),
                    nfs_v3: true,
                    ..Default::default()
                },
            ]),
            client_stats: HashMap::from([
                (
                    ("::ffff:10.0.0.1".to_string(), "v40"),
                    BasicStats {
                        header: ok_header(),
                        read: io(100, 0),
                        write: io(200, 0),
                    },
                ),
                (
                    ("::ffff:10.0.0.2".to_string(), "v41"),
                    BasicStats {
                        header: ok_header(),
                        read: io(300, 2_000_000_000),
                        write: io(400, 0),
                    },
                ),
            ]),
            ..Default::default()
        };
        let output = collect(&ClientsCollector::new(Arc::new(stats), context())).await;

        assert!(output.contains(
            "# HELP storageos_clients_nfs_v40_requested_bytes_total Number of requested bytes for NFSv4.0 operations\n\
             # TYPE storageos_clients_nfs_v40_requested_bytes_total counter\n\
             storageos_clients_nfs_v40_requested_bytes_total{op=\"read\",name=\"pvc-1\",namespace=\"default\",clientip=\"::ffff:10.0.0.1\"} 100\n\
             storageos_clients_nfs_v40_requested_bytes_total{op=\"write\",name=\"pvc-1\",namespace=\"default\",clientip=\"::ffff:10.0.0.1\"} 200\n"
        ));
        assert!(output.contains(
            "storageos_clients_nfs_v41_operations_latency_seconds_total{op=\"read\",name=\"pvc-1\",namespace=\"default\",clientip=\"::ffff:10.0.0.2\"} 2\n"
        ));
        assert!(!output.contains("10.0.0.3"));
        assert!(!output.contains("nfs_v42"));
        assert_eq!(output.lines().count(), 2 * 6 * 4);
    }

    #[tokio::test]
    async fn client_failures_skip_that_client() {
        let stats = FakeStats {
            clients: Some(vec![
                Client {
                    address: "::ffff:10.0.0.1".to_string(),
                    nfs_v40: true,
                    ..Default::default()
                },
                Client {
                    address: "::ffff:10.0.0.2".to_string(),
                    nfs_v40: true,
                    ..Default::default()
                },
                Client {
                    address: "::ffff:10.0.0.3".to_string(),
                    nfs_v40: true,
                    ..Default::default()
                },
            ]),
            client_stats: HashMap::from([
                (
                    ("::ffff:10.0.0.1".to_string(), "v40"),
                    BasicStats {
                        header: ok_header(),
                        read: io(1, 0),
                        write: io(2, 0),
                    },
                ),
                (
                    ("::ffff:10.0.0.3".to_string(), "v40"),
                    BasicStats {
                        header: StatsHeader {
                            status: false,
                            error: "Client IP address not found".to_string(),
                            ..Default::default()
                        },
                        ..Default::default()
                    },
                ),
            ]),
            ..Default::default()
        };
        let output = collect(&ClientsCollector::new(Arc::new(stats), context())).await;

        assert!(output.contains("clientip=\"::ffff:10.0.0.1\""));
        assert!(!output.contains("10.0.0.2"));
        assert!(!output.contains("10.0.0.3"));
        assert_eq!(output.lines().count(), 6 * 4);
    }

    #[tokio::test]
    async fn client_list_failure_omits_families() {
        let output = collect(&ClientsCollector::new(Arc::new(FakeStats::default()), context())).await;
        assert_eq!(output, "");
    }
}
