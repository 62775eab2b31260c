//! Logging.

use keel_config::{deser::PermissiveBool, ConfigurationError, ConfigurationLoader};
use keel_error::{generic_error, ErrorContext as _, GenericError};
use serde::Deserialize;
use serde_with::serde_as;
use tracing_subscriber::{
    filter::LevelFilter, layer::SubscriberExt as _, util::SubscriberInitExt as _, EnvFilter, Layer, Registry,
};

const LOGGING_ENV_KEYS: &[&str] = &["LOG_LEVEL", "LOG_FORMAT_JSON"];

fn default_log_level() -> LogLevel {
    LevelFilter::INFO.into()
}

/// Logging configuration.
///
/// Read from the `LOG_LEVEL` environment variable, holding `tracing` filter directives such as `info` or
/// `keel_core=debug,info` (default `info`), and `LOG_FORMAT_JSON`, selecting JSON output over the human-readable format
/// (default `false`).
#[serde_as]
#[derive(Deserialize)]
pub struct LoggingConfiguration {
    #[serde(default = "default_log_level")]
    log_level: LogLevel,

    #[serde_as(as = "PermissiveBool")]
    #[serde(default)]
    log_format_json: bool,
}

impl LoggingConfiguration {
    /// Loads the logging configuration from the environment.
    ///
    /// # Errors
    ///
    /// If either variable holds an invalid value, an error is returned.
    pub fn from_environment() -> Result<Self, ConfigurationError> {
        ConfigurationLoader::default()
            .from_raw_environment(LOGGING_ENV_KEYS)
            .into_typed()
    }

    /// Returns `true` if logs are formatted as JSON.
    pub fn is_json(&self) -> bool {
        self.log_format_json
    }
}

#[derive(Deserialize)]
#[serde(try_from = "String")]
struct LogLevel(EnvFilter);

impl From<LevelFilter> for LogLevel {
    fn from(level: LevelFilter) -> Self {
        Self(EnvFilter::default().add_directive(level.into()))
    }
}

impl TryFrom<String> for LogLevel {
    type Error = GenericError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.trim().is_empty() {
            return Err(generic_error!("Log level cannot be empty."));
        }

        EnvFilter::builder()
            .parse(value)
            .map(Self)
            .error_context("Failed to parse valid log level.")
    }
}

/// Logs a message to standard error and exits the process with a non-zero exit code.
///
/// Meant for failures that happen before logging is initialized.
pub fn fatal_and_exit(message: String) -> ! {
    eprintln!("FATAL: {}", message);
    std::process::exit(1);
}

/// Initializes the global `tracing` subscriber.
///
/// # Errors
///
/// If a global subscriber was already installed, an error is returned.
pub fn initialize_logging(config: LoggingConfiguration) -> Result<(), GenericError> {
    let formatter: Box<dyn Layer<Registry> + Send + Sync> = if config.log_format_json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(true).boxed()
    };

    tracing_subscriber::registry()
        .with(formatter.with_filter(config.log_level.0))
        .try_init()
        .error_context("Failed to install global logger.")
}
