//! Error plumbing shared by every crate in the supervisor.
//!
//! Typed errors are declared per crate with `snafu`. Anything that only needs to be reported, rather than matched on,
//! travels as a [`GenericError`].
#![deny(warnings)]
#![deny(missing_docs)]

use std::fmt::Display;

#[doc(hidden)]
pub use anyhow::anyhow as _anyhow;

/// An opaque error carrying a chain of causes.
pub type GenericError = anyhow::Error;

/// Builds a [`GenericError`].
///
/// Accepts a string literal, a format string followed by its arguments, or any value implementing both `Debug` and
/// `Display`. When given a value implementing `std::error::Error`, its source chain is preserved.
#[macro_export]
macro_rules! generic_error {
    ($msg:literal $(,)?) => { $crate::_anyhow!($msg) };
    ($err:expr $(,)?) => { $crate::_anyhow!($err) };
    ($fmt:expr, $($arg:tt)*) => { $crate::_anyhow!($fmt, $($arg)*) };
}

mod sealed {
    pub trait Sealed {}

    impl<T, E> Sealed for Result<T, E> {}
}

/// Attaches human-readable context to a failed `Result`, converting it to a [`GenericError`].
///
/// Named differently from `anyhow::Context` so it can be imported alongside `snafu::ResultExt`.
pub trait ErrorContext<T, E>: sealed::Sealed {
    /// Wraps the error with the given context.
    fn error_context<C>(self, context: C) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static;

    /// Wraps the error with context that is only built if an error occurred.
    fn with_error_context<C, F>(self, f: F) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C;
}

impl<T, E> ErrorContext<T, E> for Result<T, E>
where
    Result<T, E>: anyhow::Context<T, E>,
{
    fn error_context<C>(self, context: C) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
    {
        anyhow::Context::context(self, context)
    }

    fn with_error_context<C, F>(self, f: F) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C,
    {
        anyhow::Context::with_context(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_wraps_source() {
        let result: Result<(), std::io::Error> = Err(std::io::Error::other("disk on fire"));
        let err = result.error_context("Failed to read config file.").unwrap_err();

        assert_eq!(err.to_string(), "Failed to read config file.");
        assert_eq!(err.root_cause().to_string(), "disk on fire");
    }

    #[test]
    fn macro_formats_arguments() {
        let err = generic_error!("process '{}' exited with {}", "rpcbind", 3);
        assert_eq!(err.to_string(), "process 'rpcbind' exited with 3");
    }
}
