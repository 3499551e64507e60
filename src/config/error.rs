//! Error types for the monitoring config module.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while validating or loading library monitoring config.
///
/// These are startup-fatal: a malformed override is rejected before any
/// session uses it.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A numeric threshold is out of range (non-finite, zero, or negative).
    #[error("invalid value for `{field}` in config for library '{library}': {value} (expected {expected})")]
    InvalidValue {
        /// Normalized library name the value belongs to.
        library: String,
        /// Field name as it appears in override files.
        field: &'static str,
        /// The rejected value, rendered for display.
        value: String,
        /// Human-readable description of the accepted range.
        expected: &'static str,
    },

    /// Override file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path of the override file.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Override file is not valid JSON or has unknown fields.
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        /// Path of the override file (empty for in-memory sources).
        path: PathBuf,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
}

impl ConfigError {
    pub(crate) fn invalid_value(
        library: &str,
        field: &'static str,
        value: impl ToString,
        expected: &'static str,
    ) -> Self {
        Self::InvalidValue {
            library: library.to_string(),
            field,
            value: value.to_string(),
            expected,
        }
    }
}
