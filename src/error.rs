use thiserror::Error;

use crate::provider::ProviderKind;

/// Main error type for the tunnel keeper
#[derive(Error, Debug)]
pub enum TunnelError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Validation failed: {0}")]
    Validation(String),

    // Provider start errors
    #[error("Provider {provider} failed to start: {reason}")]
    Start {
        provider: ProviderKind,
        reason: String,
    },

    #[error("Provider {provider} did not produce a URL within {timeout_ms}ms")]
    StartTimeout {
        provider: ProviderKind,
        timeout_ms: u64,
    },

    // Health probe errors
    #[error("Health probe failed: {0}")]
    Probe(String),

    // Lifecycle errors
    #[error("Tunnel process exited unexpectedly (code: {code:?})")]
    UnexpectedExit { code: Option<i32> },

    #[error("Tunnel \"{name}\" exhausted {attempts} restart attempts with no provider left to fail over to")]
    ExhaustedRetries { name: String, attempts: u32 },

    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for TunnelError
pub type Result<T> = std::result::Result<T, TunnelError>;
