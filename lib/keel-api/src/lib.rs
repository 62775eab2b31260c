//! Building blocks for the supervisor's HTTP surface.
pub use axum::extract;
pub use axum::response;
pub use axum::routing;
use axum::Router;
pub use http::{header, StatusCode};

/// An API handler.
///
/// API handlers define the initial state and routes for a portion of an API, and are composed together by the API
/// server.
pub trait APIHandler {
    type State: Clone + Send + Sync + 'static;

    /// Human-readable name of this handler, as shown on the index page.
    fn name(&self) -> &'static str;

    /// The route this handler is primarily reachable at, as linked from the index page.
    fn endpoint(&self) -> &'static str;

    fn generate_initial_state(&self) -> Self::State;
    fn generate_routes(&self) -> Router<Self::State>;
}
