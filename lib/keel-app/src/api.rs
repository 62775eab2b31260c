//! API server.

use std::{collections::BTreeMap, fmt::Write as _, net::SocketAddr, sync::Arc};

use axum::Router;
use keel_api::{
    extract::State,
    header,
    response::{Html, IntoResponse},
    routing::get,
    APIHandler,
};
use keel_core::exit::{exit_channel, ExitNotification};
use keel_error::{ErrorContext as _, GenericError};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const INDEX_NAME: &str = "Index";
const INDEX_ENDPOINT: &str = "/";

/// An API builder.
///
/// `APIBuilder` composes an API server from multiple handlers, and serves an index page at `/` linking to the endpoint
/// of every handler added.
pub struct APIBuilder {
    name: String,
    router: Router,
    endpoints: BTreeMap<&'static str, &'static str>,
}

impl APIBuilder {
    /// Creates a new `APIBuilder` with an empty router.
    ///
    /// `name` is used as the title of the index page.
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            router: Router::new(),
            endpoints: BTreeMap::from([(INDEX_ENDPOINT, INDEX_NAME)]),
        }
    }

    /// Adds the given handler to this builder.
    ///
    /// The initial state and routes provided by the handler are merged into this builder. A handler whose endpoint is
    /// already registered is ignored.
    pub fn with_handler<H>(mut self, handler: H) -> Self
    where
        H: APIHandler,
    {
        if self.endpoints.contains_key(handler.endpoint()) {
            debug!(endpoint = handler.endpoint(), "Endpoint already registered. Ignoring handler.");
            return self;
        }

        self.endpoints.insert(handler.endpoint(), handler.name());
        let handler_router = handler.generate_routes();
        let handler_state = handler.generate_initial_state();
        self.router = self.router.merge(handler_router.with_state(handler_state));

        self
    }

    fn into_router(self) -> Router {
        let index = Arc::new(render_index(&self.name, &self.endpoints));
        Router::new()
            .route(INDEX_ENDPOINT, get(index_handler))
            .with_state(index)
            .merge(self.router)
    }

    /// Binds to the given address and serves the API in the background.
    ///
    /// The address is either `host:port` or `:port`, the latter binding to all interfaces.
    ///
    /// Returns a handle for stopping the server, along with a notification that resolves once the server stops:
    /// cleanly after [`RunningAPI::close`], or with an error if serving failed.
    ///
    /// # Errors
    ///
    /// If the address cannot be bound, an error is returned.
    pub async fn serve(self, listen_address: &str) -> Result<(RunningAPI, ExitNotification<GenericError>), GenericError> {
        let address = normalize_listen_address(listen_address);
        let listener = TcpListener::bind(&address)
            .await
            .with_error_context(|| format!("Failed to bind API server to '{}'.", address))?;
        let local_addr = listener
            .local_addr()
            .error_context("Failed to get API server listen address.")?;

        let router = self.into_router();
        let shutdown = CancellationToken::new();
        let (notifier, notification) = exit_channel();

        let server_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
                .await;

            match result {
                Ok(()) => {
                    info!("API server stopped.");
                    notifier.complete();
                }
                Err(e) => notifier.fail(GenericError::from(e).context("API server failed.")),
            }
        });

        info!(%local_addr, "API server listening.");
        Ok((RunningAPI { local_addr, shutdown }, notification))
    }
}

/// A handle to a running API server.
pub struct RunningAPI {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
}

impl RunningAPI {
    /// Returns the address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting connections and shuts down once in-flight requests finish.
    ///
    /// Does not wait; observe completion through the exit notification. Calling it more than once has no further
    /// effect.
    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

async fn index_handler(State(index): State<Arc<String>>) -> impl IntoResponse {
    ([(header::CACHE_CONTROL, "no-store")], Html(index.as_str().to_string()))
}

fn normalize_listen_address(address: &str) -> String {
    if address.starts_with(':') {
        format!("0.0.0.0{}", address)
    } else {
        address.to_string()
    }
}

fn render_index(name: &str, endpoints: &BTreeMap<&'static str, &'static str>) -> String {
    let name = escape_html(name);
    let mut page = String::new();
    let _ = writeln!(page, "<html>\n<head><title>{}</title></head>\n<body>\n<h1>{}</h1>", name, name);
    for (endpoint, endpoint_name) in endpoints {
        let _ = writeln!(
            page,
            "<p><a href=\"{}\">{}</a></p>",
            escape_html(endpoint),
            escape_html(endpoint_name)
        );
    }
    page.push_str("</body>\n</html>\n");
    page
}

fn escape_html(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            c => escaped.push(c),
        }
    }
    escaped
}
