//! Health reporting for the NFS server.
#![deny(warnings)]
#![deny(missing_docs)]

use std::time::Duration;

use keel_api::{
    extract::State,
    response::IntoResponse,
    routing::{get, Router},
    APIHandler, StatusCode,
};
use keel_core::heartbeat::HeartbeatBroadcaster;
use metrics::counter;
use tracing::debug;

/// How long a health check waits for a heartbeat before reporting the server as not ready.
pub const DEFAULT_HEARTBEAT_WAIT: Duration = Duration::from_secs(10);

/// State used for the health API handler.
#[derive(Clone)]
pub struct HealthState {
    broadcaster: HeartbeatBroadcaster,
    wait: Duration,
}

impl HealthState {
    async fn get_response(&self) -> (StatusCode, &'static str) {
        match self.broadcaster.wait_for_status(self.wait).await {
            Some(true) => {
                counter!("supervisor_health_checks_total", "result" => "ready").increment(1);
                (StatusCode::OK, "ok")
            }
            status => {
                debug!(?status, "NFS server did not report healthy.");
                counter!("supervisor_health_checks_total", "result" => "not_ready").increment(1);
                (StatusCode::SERVICE_UNAVAILABLE, "nfs server not ready")
            }
        }
    }
}

/// An API handler reporting whether the NFS server is healthy.
///
/// `/healthz` waits for the next heartbeat from the NFS server. A heartbeat reporting healthy yields 200 OK. Otherwise,
/// including when no heartbeat arrives in time, the response is 503 Service Unavailable.
pub struct HealthAPIHandler {
    state: HealthState,
}

impl HealthAPIHandler {
    /// Creates a new `HealthAPIHandler` backed by the given broadcaster.
    pub fn new(broadcaster: HeartbeatBroadcaster) -> Self {
        Self {
            state: HealthState {
                broadcaster,
                wait: DEFAULT_HEARTBEAT_WAIT,
            },
        }
    }

    /// Sets how long each check waits for a heartbeat.
    pub fn with_heartbeat_wait(mut self, wait: Duration) -> Self {
        self.state.wait = wait;
        self
    }

    async fn health_handler(State(state): State<HealthState>) -> impl IntoResponse {
        state.get_response().await
    }
}

impl APIHandler for HealthAPIHandler {
    type State = HealthState;

    fn name(&self) -> &'static str {
        "Health"
    }

    fn endpoint(&self) -> &'static str {
        "/healthz"
    }

    fn generate_initial_state(&self) -> Self::State {
        self.state.clone()
    }

    fn generate_routes(&self) -> Router<Self::State> {
        Router::new().route("/healthz", get(Self::health_handler))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use axum::{body::Body, http::Request};
    use http_body_util::BodyExt as _;
    use keel_core::bus::{BusError, SignalBus, SignalMatch, SignalMessage, SignalSubscription};
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt as _;

    use super::*;

    struct ChannelBus {
        rx: Mutex<Option<mpsc::UnboundedReceiver<SignalMessage>>>,
    }

    struct ChannelSubscription {
        rx: mpsc::UnboundedReceiver<SignalMessage>,
    }

    #[async_trait]
    impl SignalBus for ChannelBus {
        async fn subscribe(&self, _signal: &SignalMatch) -> Result<Box<dyn SignalSubscription>, BusError> {
            let rx = self.rx.lock().unwrap().take().expect("subscribed twice");
            Ok(Box::new(ChannelSubscription { rx }))
        }
    }

    #[async_trait]
    impl SignalSubscription for ChannelSubscription {
        async fn next_signal(&mut self) -> Option<Result<SignalMessage, BusError>> {
            self.rx.recv().await.map(Ok)
        }

        async fn unsubscribe(self: Box<Self>) -> Result<(), BusError> {
            Ok(())
        }
    }

    fn broadcaster() -> (HeartbeatBroadcaster, mpsc::UnboundedSender<SignalMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let bus = ChannelBus {
            rx: Mutex::new(Some(rx)),
        };
        (HeartbeatBroadcaster::new(Arc::new(bus)), tx)
    }

    async fn check(handler: HealthAPIHandler) -> (StatusCode, String) {
        let router = handler.generate_routes().with_state(handler.generate_initial_state());
        let response = router
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    async fn check_with_heartbeat(heartbeat: SignalMessage) -> (StatusCode, String) {
        let (broadcaster, tx) = broadcaster();
        let cancel = CancellationToken::new();
        let running = tokio::spawn({
            let broadcaster = broadcaster.clone();
            let cancel = cancel.clone();
            async move { broadcaster.run(cancel).await }
        });

        let request = tokio::spawn(check(HealthAPIHandler::new(broadcaster.clone())));
        while broadcaster.watcher_count() == 0 {
            tokio::task::yield_now().await;
        }
        tx.send(heartbeat).unwrap();

        let response = request.await.unwrap();
        cancel.cancel();
        let _ = running.await.unwrap();
        response
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_heartbeat() {
        let (status, body) = check_with_heartbeat(SignalMessage::Bool(true)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
    }

    #[tokio::test(start_paused = true)]
    async fn unhealthy_heartbeat() {
        let (status, body) = check_with_heartbeat(SignalMessage::Bool(false)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body, "nfs server not ready");
    }

    #[tokio::test(start_paused = true)]
    async fn no_heartbeat_times_out() {
        let (broadcaster, _tx) = broadcaster();
        let started = tokio::time::Instant::now();

        let (status, body) = check(HealthAPIHandler::new(broadcaster.clone())).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body, "nfs server not ready");
        assert!(started.elapsed() >= DEFAULT_HEARTBEAT_WAIT);
        assert_eq!(broadcaster.watcher_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_broadcaster_fails_fast() {
        let (broadcaster, _tx) = broadcaster();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(broadcaster.run(cancel).await.is_err());

        let started = tokio::time::Instant::now();
        let (status, _) = check(HealthAPIHandler::new(broadcaster).with_heartbeat_wait(Duration::from_secs(30))).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(started.elapsed() < Duration::from_secs(30));
    }
}
