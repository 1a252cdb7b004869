//! Startup-time error types shared by every hermes crate.
//!
//! A [`ConfigError`] is fatal: it is raised before any batch is processed and
//! is never produced by per-record work.

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required option was not provided.
    #[error("Missing required option: {0}")]
    Missing(&'static str),

    /// An option was provided but its value is unusable.
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    /// The configuration file exists but could not be read.
    #[error("Failed to read configuration from {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },

    /// The configuration file could not be deserialized.
    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    /// No configuration file was found in any of the searched locations.
    #[error("No configuration file found. Tried:\n{0}")]
    NotFound(String),
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }
}
