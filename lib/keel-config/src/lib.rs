//! Typed configuration loading.
//!
//! Configuration is layered from one or more sources and then extracted into a caller-defined, `serde`-deserializable
//! type. Sources added later take precedence over sources added earlier.
#![deny(warnings)]
#![deny(missing_docs)]

use std::borrow::Cow;

use figment::{
    error::Kind,
    providers::{Env, Serialized},
    value::{Dict, Value},
    Figment,
};
use keel_error::GenericError;
use serde::Deserialize;
use tracing::debug;

use snafu::Snafu;

pub mod deser;

/// A configuration error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ConfigurationError {
    /// A required field was not present in any source.
    #[snafu(display("Missing field '{}' in configuration. {}", field, help_text))]
    MissingField {
        /// Hint for the user on how to provide the field.
        help_text: String,

        /// Name of the missing field.
        field: Cow<'static, str>,
    },

    /// A field was present but had the wrong type.
    #[snafu(display(
        "Expected value for field '{}' to be '{}', got '{}' instead.",
        field,
        expected_ty,
        actual_ty
    ))]
    InvalidFieldType {
        /// Period-separated path to the field.
        field: String,

        /// Expected data type.
        expected_ty: String,

        /// Actual data type.
        actual_ty: String,
    },

    /// A field was present with the right type but an unacceptable value.
    #[snafu(display("Invalid value for field '{}': got {}, expected {}.", field, actual, expected))]
    InvalidFieldValue {
        /// Period-separated path to the field.
        field: String,

        /// Description of the value that was found.
        actual: String,

        /// Description of what would have been accepted.
        expected: String,
    },

    /// Generic configuration error.
    #[snafu(display("Failed to query configuration."))]
    Generic {
        /// Error source.
        source: GenericError,
    },
}

impl From<figment::Error> for ConfigurationError {
    fn from(e: figment::Error) -> Self {
        let field = e.path.join(".");
        match e.kind {
            Kind::MissingField(name) => Self::MissingField {
                help_text: format!("Try setting the `{}` environment variable.", name.to_uppercase()),
                field: name,
            },
            Kind::InvalidType(actual_ty, expected_ty) => Self::InvalidFieldType {
                field,
                expected_ty,
                actual_ty: actual_ty.to_string(),
            },
            Kind::InvalidValue(actual, expected) => Self::InvalidFieldValue {
                field,
                actual: actual.to_string(),
                expected,
            },
            _ => Self::Generic { source: e.into() },
        }
    }
}

/// A configuration loader that can pull from various sources.
///
/// Thin wrapper over `figment` which only exposes what the supervisor needs: an explicit list of environment variables,
/// plus static key/value pairs.
///
/// Every value is loaded as a string, exactly as it appeared in its source. Empty values are treated as unset, so a
/// variable exported as `NAME=` falls back to its default (or is reported missing, if required). Typed conversion
/// happens during [`into_typed`][Self::into_typed], where fields can opt into the permissive parsers in [`deser`].
#[derive(Default)]
pub struct ConfigurationLoader {
    layers: Vec<Dict>,
}

impl ConfigurationLoader {
    /// Loads the given environment variables, by exact name.
    ///
    /// Configuration keys are the lowercased variable names, so `LISTEN_ADDR` is loaded as `listen_addr`. Variables not
    /// named in `keys` are ignored.
    pub fn from_raw_environment(self, keys: &[&str]) -> Self {
        self.from_env_provider(Env::raw().only(keys))
    }

    /// Loads the given key/value pairs.
    ///
    /// Keys are used verbatim.
    pub fn from_values<I, K, V>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let layer = values
            .into_iter()
            .filter_map(|(k, v)| non_empty_entry(k.into(), v.into()))
            .collect::<Dict>();
        self.layers.push(layer);
        self
    }

    fn from_env_provider(mut self, env: Env) -> Self {
        // `Env` would otherwise parse values into numbers/booleans on its own, so we pull the raw strings instead.
        let layer = env
            .iter()
            .filter_map(|(key, value)| non_empty_entry(key.as_str().to_ascii_lowercase(), value))
            .collect::<Dict>();
        debug!(keys = layer.len(), "Loaded configuration from environment.");
        self.layers.push(layer);
        self
    }

    /// Consumes the configuration loader and deserializes it as `T`.
    ///
    /// # Errors
    ///
    /// If a required field is missing, or a field cannot be converted to the type `T` expects, an error will be
    /// returned.
    pub fn into_typed<'a, T>(self) -> Result<T, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        let figment = self
            .layers
            .into_iter()
            .fold(Figment::new(), |figment, layer| figment.merge(Serialized::defaults(layer)));

        figment.extract().map_err(Into::into)
    }
}

fn non_empty_entry(key: String, value: String) -> Option<(String, Value)> {
    if value.is_empty() {
        None
    } else {
        Some((key, Value::from(value)))
    }
}
