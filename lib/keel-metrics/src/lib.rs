//! Prometheus metrics for the NFS server and the supervisor itself.
#![deny(warnings)]
#![deny(missing_docs)]

use std::sync::Arc;

use keel_api::{
    extract::State,
    header,
    response::IntoResponse,
    routing::{get, Router},
    APIHandler,
};

mod collectors;
pub use self::collectors::{ClientsCollector, Collector, ExportsCollector, MetricContext};

mod exposition;
pub use self::exposition::{MetricKind, PrometheusWriter, CONTENT_TYPE};

mod recorder;
pub use self::recorder::{TelemetryHandle, TelemetryRecorder};

/// State used for the metrics API handler.
#[derive(Clone)]
pub struct MetricsState {
    collectors: Arc<Vec<Arc<dyn Collector>>>,
    telemetry: Option<TelemetryHandle>,
}

impl MetricsState {
    async fn render(&self) -> String {
        let mut writer = PrometheusWriter::new();
        for collector in self.collectors.iter() {
            collector.collect(&mut writer).await;
        }
        if let Some(telemetry) = &self.telemetry {
            telemetry.render(&mut writer);
        }
        writer.finish()
    }
}

/// An API handler exposing metrics in the Prometheus text format.
///
/// Every scrape runs each collector in turn, followed by the supervisor's own telemetry if a handle was provided.
pub struct MetricsAPIHandler {
    collectors: Vec<Arc<dyn Collector>>,
    telemetry: Option<TelemetryHandle>,
}

impl MetricsAPIHandler {
    /// Creates a new `MetricsAPIHandler` with no collectors.
    pub fn new() -> Self {
        Self {
            collectors: Vec::new(),
            telemetry: None,
        }
    }

    /// Adds a collector.
    pub fn with_collector<C>(mut self, collector: C) -> Self
    where
        C: Collector + 'static,
    {
        self.collectors.push(Arc::new(collector));
        self
    }

    /// Includes the telemetry rendered by the given handle.
    pub fn with_telemetry(mut self, telemetry: TelemetryHandle) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    async fn metrics_handler(State(state): State<MetricsState>) -> impl IntoResponse {
        ([(header::CONTENT_TYPE, CONTENT_TYPE)], state.render().await)
    }
}

impl APIHandler for MetricsAPIHandler {
    type State = MetricsState;

    fn name(&self) -> &'static str {
        "Metrics"
    }

    fn endpoint(&self) -> &'static str {
        "/metrics"
    }

    fn generate_initial_state(&self) -> Self::State {
        MetricsState {
            collectors: Arc::new(self.collectors.clone()),
            telemetry: self.telemetry.clone(),
        }
    }

    fn generate_routes(&self) -> Router<Self::State> {
        Router::new().route("/metrics", get(Self::metrics_handler))
    }
}

#[cfg(test)]
mod tests {
    use axum::{body::Body, http::Request};
    use http_body_util::BodyExt as _;
    use keel_api::StatusCode;
    use keel_core::stats::{ExportIoStats, ExportIoStatsList};
    use metrics::counter;
    use tower::ServiceExt as _;

    use super::*;
    use crate::collectors::tests::{context, io, ok_header, FakeStats};

    async fn scrape(handler: MetricsAPIHandler) -> (StatusCode, Option<String>, String) {
        let router = handler.generate_routes().with_state(handler.generate_initial_state());
        let response = router
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .map(|v| v.to_str().unwrap().to_string());
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, content_type, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn scrape_includes_collectors_and_telemetry() {
        let stats = Arc::new(FakeStats {
            exports: Some(ExportIoStatsList {
                header: ok_header(),
                exports: vec![ExportIoStats {
                    export_id: 1,
                    protocol: "NFSv41".to_string(),
                    read: io(512, 0),
                    write: io(1024, 0),
                }],
            }),
            ..Default::default()
        });

        let recorder = TelemetryRecorder::new();
        metrics::with_local_recorder(&recorder, || counter!("supervisor_heartbeats_received_total").increment(4));

        let handler = MetricsAPIHandler::new()
            .with_collector(ExportsCollector::new(stats.clone(), context()))
            .with_collector(ClientsCollector::new(stats, context()))
            .with_telemetry(recorder.handle());

        let (status, content_type, body) = scrape(handler).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(content_type.as_deref(), Some(CONTENT_TYPE));
        assert!(body.contains(
            "storageos_nfs_v41_requested_bytes_total{op=\"write\",name=\"pvc-1\",namespace=\"default\"} 1024\n"
        ));
        assert!(body.contains("supervisor_heartbeats_received_total 4\n"));
        assert!(!body.contains("storageos_clients_"));
    }

    #[tokio::test]
    async fn failing_collectors_still_answer() {
        let stats = Arc::new(FakeStats::default());
        let handler = MetricsAPIHandler::new()
            .with_collector(ExportsCollector::new(stats.clone(), context()))
            .with_collector(ClientsCollector::new(stats, context()));

        let (status, _, body) = scrape(handler).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "");
    }
}
