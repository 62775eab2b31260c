//! Application bootstrapping: logging and the HTTP API server.
#![deny(warnings)]
#![deny(missing_docs)]

pub mod api;
pub mod logging;

/// Common imports.
pub mod prelude {
    pub use super::api::{APIBuilder, RunningAPI};
    pub use super::logging::{fatal_and_exit, initialize_logging, LoggingConfiguration};
}
