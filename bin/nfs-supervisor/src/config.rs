use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use keel_config::{
    deser::{PermissiveBool, PermissiveU64},
    ConfigurationError, ConfigurationLoader,
};
use keel_metrics::MetricContext;
use serde::Deserialize;
use serde_with::serde_as;

const SUPERVISOR_ENV_KEYS: &[&str] = &[
    "GANESHA_CONFIGFILE",
    "LISTEN_ADDR",
    "NAME",
    "NAMESPACE",
    "DISABLE_METRICS",
    "METRICS_PREFIX",
    "STARTUP_TIMEOUT_SECS",
    "SHUTDOWN_TIMEOUT_SECS",
];

fn default_listen_addr() -> String {
    ":80".to_string()
}

fn default_metrics_prefix() -> String {
    "storageos".to_string()
}

const fn default_startup_timeout_secs() -> u64 {
    10
}

const fn default_shutdown_timeout_secs() -> u64 {
    5
}

/// Supervisor configuration.
///
/// Read from unprefixed environment variables. Only `GANESHA_CONFIGFILE` is required.
#[serde_as]
#[derive(Clone, Debug, Deserialize)]
pub struct SupervisorConfiguration {
    /// Path to the NFS server's configuration file.
    #[serde(rename = "ganesha_configfile")]
    ganesha_config_file: PathBuf,

    /// Address the HTTP surface listens on. A bare `:port` listens on all interfaces.
    #[serde(default = "default_listen_addr")]
    listen_addr: String,

    /// Name of the volume being served, used as a metric label.
    #[serde(default)]
    name: String,

    /// Namespace of the volume being served, used as a metric label.
    #[serde(default)]
    namespace: String,

    #[serde_as(as = "PermissiveBool")]
    #[serde(default)]
    disable_metrics: bool,

    #[serde(default = "default_metrics_prefix")]
    metrics_prefix: String,

    #[serde_as(as = "PermissiveU64")]
    #[serde(default = "default_startup_timeout_secs")]
    startup_timeout_secs: u64,

    #[serde_as(as = "PermissiveU64")]
    #[serde(default = "default_shutdown_timeout_secs")]
    shutdown_timeout_secs: u64,
}

impl SupervisorConfiguration {
    /// Loads the configuration from the environment.
    ///
    /// # Errors
    ///
    /// If `GANESHA_CONFIGFILE` is unset or empty, or any variable holds an invalid value, an error is returned.
    pub fn from_environment() -> Result<Self, ConfigurationError> {
        Self::from_loader(ConfigurationLoader::default().from_raw_environment(SUPERVISOR_ENV_KEYS))
    }

    fn from_loader(loader: ConfigurationLoader) -> Result<Self, ConfigurationError> {
        loader.into_typed()
    }

    pub fn ganesha_config_file(&self) -> &Path {
        &self.ganesha_config_file
    }

    pub fn listen_address(&self) -> &str {
        &self.listen_addr
    }

    /// Returns the metric naming and labels, or `None` if metrics are disabled.
    pub fn metrics(&self) -> Option<MetricContext> {
        if self.disable_metrics {
            return None;
        }

        Some(MetricContext {
            prefix: self.metrics_prefix.clone(),
            name: self.name.clone(),
            namespace: self.namespace.clone(),
        })
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}
