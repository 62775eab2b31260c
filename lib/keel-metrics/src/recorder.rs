use std::{
    collections::{BTreeMap, HashMap},
    sync::{atomic::Ordering, Arc, Mutex, PoisonError},
};

use keel_error::{generic_error, GenericError};
use metrics::{Counter, Gauge, Histogram, Key, KeyName, Metadata, Recorder, SharedString, Unit};
use metrics_util::registry::{AtomicStorage, Registry};

use crate::exposition::{MetricKind, PrometheusWriter};

struct State {
    registry: Registry<Key, AtomicStorage>,
    descriptions: Mutex<HashMap<String, SharedString>>,
}

/// Records the supervisor's own telemetry.
///
/// Counters and gauges are held in an atomic registry and rendered on demand through a [`TelemetryHandle`]. Histograms
/// are not exported.
pub struct TelemetryRecorder {
    state: Arc<State>,
}

impl TelemetryRecorder {
    /// Creates a new, empty `TelemetryRecorder`.
    pub fn new() -> Self {
        Self {
            state: Arc::new(State {
                registry: Registry::new(AtomicStorage {}),
                descriptions: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Returns a handle for rendering whatever this recorder has collected.
    pub fn handle(&self) -> TelemetryHandle {
        TelemetryHandle {
            state: Arc::clone(&self.state),
        }
    }

    /// Installs this recorder as the global recorder.
    ///
    /// # Errors
    ///
    /// If a global recorder has already been installed, an error is returned.
    pub fn install(self) -> Result<TelemetryHandle, GenericError> {
        let handle = self.handle();
        metrics::set_global_recorder(self)
            .map_err(|_| generic_error!("A global metrics recorder has already been installed."))?;
        Ok(handle)
    }

    fn describe(&self, key: KeyName, description: SharedString) {
        self.state
            .descriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.as_str().to_string(), description);
    }
}

impl Recorder for TelemetryRecorder {
    fn describe_counter(&self, key: KeyName, _: Option<Unit>, description: SharedString) {
        self.describe(key, description);
    }

    fn describe_gauge(&self, key: KeyName, _: Option<Unit>, description: SharedString) {
        self.describe(key, description);
    }

    fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

    fn register_counter(&self, key: &Key, _: &Metadata<'_>) -> Counter {
        self.state.registry.get_or_create_counter(key, |c| c.clone().into())
    }

    fn register_gauge(&self, key: &Key, _: &Metadata<'_>) -> Gauge {
        self.state.registry.get_or_create_gauge(key, |g| g.clone().into())
    }

    fn register_histogram(&self, _: &Key, _: &Metadata<'_>) -> Histogram {
        Histogram::noop()
    }
}

/// Renders the telemetry collected by a [`TelemetryRecorder`].
#[derive(Clone)]
pub struct TelemetryHandle {
    state: Arc<State>,
}

impl TelemetryHandle {
    /// Writes every counter and gauge, grouped into families by name.
    pub fn render(&self, writer: &mut PrometheusWriter) {
        let counters = self
            .state
            .registry
            .get_counter_handles()
            .into_iter()
            .map(|(key, counter)| (key, counter.load(Ordering::Relaxed) as f64));
        let gauges = self
            .state
            .registry
            .get_gauge_handles()
            .into_iter()
            .map(|(key, gauge)| (key, f64::from_bits(gauge.load(Ordering::Relaxed))));

        let descriptions = self
            .state
            .descriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        write_families(writer, MetricKind::Counter, group_by_name(counters), &descriptions);
        write_families(writer, MetricKind::Gauge, group_by_name(gauges), &descriptions);
    }
}

type Family = Vec<(Vec<(String, String)>, f64)>;

fn group_by_name(handles: impl Iterator<Item = (Key, f64)>) -> BTreeMap<String, Family> {
    let mut families = BTreeMap::<String, Family>::new();
    for (key, value) in handles {
        let labels = key
            .labels()
            .map(|label| (label.key().to_string(), label.value().to_string()))
            .collect::<Vec<_>>();
        families.entry(key.name().to_string()).or_default().push((labels, value));
    }

    for samples in families.values_mut() {
        samples.sort_by(|a, b| a.0.cmp(&b.0));
    }
    families
}

fn write_families(
    writer: &mut PrometheusWriter, kind: MetricKind, families: BTreeMap<String, Family>,
    descriptions: &HashMap<String, SharedString>,
) {
    for (name, samples) in families {
        writer.family(&name, descriptions.get(&name).map(|d| d.as_ref()), kind);
        for (labels, value) in samples {
            let labels = labels.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect::<Vec<_>>();
            writer.sample(&name, &labels, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use metrics::{counter, describe_counter, gauge, histogram};

    use super::*;

    fn render(recorder: &TelemetryRecorder) -> String {
        let mut writer = PrometheusWriter::new();
        recorder.handle().render(&mut writer);
        writer.finish()
    }

    #[test]
    fn renders_counters_and_gauges() {
        let recorder = TelemetryRecorder::new();
        metrics::with_local_recorder(&recorder, || {
            describe_counter!("supervisor_process_starts_total", "Number of supervised process starts.");
            counter!("supervisor_process_starts_total", "process" => "rpcbind").increment(1);
            counter!("supervisor_process_starts_total", "process" => "dbus").increment(2);
            gauge!("supervisor_heartbeat_watchers").set(3.0);
            histogram!("ignored").record(1.0);
        });

        let expected = "# HELP supervisor_process_starts_total Number of supervised process starts.\n\
                        # TYPE supervisor_process_starts_total counter\n\
                        supervisor_process_starts_total{process=\"dbus\"} 2\n\
                        supervisor_process_starts_total{process=\"rpcbind\"} 1\n\
                        # TYPE supervisor_heartbeat_watchers gauge\n\
                        supervisor_heartbeat_watchers 3\n";
        assert_eq!(render(&recorder), expected);
    }

    #[test]
    fn handles_observe_later_updates() {
        let recorder = TelemetryRecorder::new();
        let counter = metrics::with_local_recorder(&recorder, || counter!("supervisor_heartbeats_received_total"));

        counter.increment(5);
        assert!(render(&recorder).contains("supervisor_heartbeats_received_total 5\n"));

        counter.increment(1);
        assert!(render(&recorder).contains("supervisor_heartbeats_received_total 6\n"));
    }

    #[test]
    fn empty_recorder_renders_nothing() {
        assert_eq!(render(&TelemetryRecorder::new()), "");
    }
}
