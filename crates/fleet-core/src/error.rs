//! Error types shared across the fleetscale crates.

use thiserror::Error;

/// Result alias for collaborator calls.
pub type CallResult<T> = Result<T, CallError>;

/// A collaborator call (fleet provider, metrics source, load balancer,
/// notifier, dashboard renderer, lease provider) did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("request rejected: {0}")]
    Rejected(String),
}

/// A fleet provider operation (list, launch, start, stop, describe) failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("fleet provider {operation} failed: {source}")]
pub struct ProviderError {
    pub operation: &'static str,
    #[source]
    pub source: CallError,
}

impl ProviderError {
    pub fn new(operation: &'static str, source: CallError) -> Self {
        Self { operation, source }
    }
}

/// Settings file could not be read or failed validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse settings: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid duration for {field}: {value:?}")]
    Duration { field: &'static str, value: String },

    #[error("invalid settings: {0}")]
    Invalid(String),
}
