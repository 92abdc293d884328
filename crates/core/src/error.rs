//! Core error types for converge.
//!
//! All errors are explicit, typed, and recoverable - no panics allowed.

use thiserror::Error;

/// Core error type for key parsing and configuration.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    #[error("invalid resource key '{input}': {reason}")]
    InvalidKey { input: String, reason: String },

    #[error("TOML parse error: {reason}")]
    TomlParseFailed { reason: String },

    #[error("invalid configuration: {}", reasons.join("; "))]
    InvalidConfig { reasons: Vec<String> },
}

impl Error {
    /// Create an invalid key error.
    pub fn invalid_key(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidKey {
            input: input.into(),
            reason: reason.into(),
        }
    }

    /// Create a TOML parse error.
    pub fn toml_parse_failed(reason: impl Into<String>) -> Self {
        Self::TomlParseFailed {
            reason: reason.into(),
        }
    }

    /// Create an invalid configuration error from accumulated reasons.
    pub fn invalid_config(reasons: Vec<String>) -> Self {
        Self::InvalidConfig { reasons }
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::toml_parse_failed(err.to_string())
    }
}

/// The standard Result type for converge core operations.
pub type Result<T> = std::result::Result<T, Error>;
