//! Error types for dockdns.

use std::path::PathBuf;

use thiserror::Error;

/// Errors produced by the reconciliation core and its adapters.
#[derive(Debug, Error)]
pub enum Error {
    /// IO error (state file, proxy config, ...)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Ledger (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Proxy config serialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Docker API error
    #[error("Docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    /// HTTP transport error (resolver API, notifications)
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The resolver rejected or failed a record change.
    #[error("DNS provider failed to {action} {hostname} -> {ip}: {reason}")]
    Provider {
        action: &'static str,
        hostname: String,
        ip: String,
        reason: String,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Advisory lock on the shared state could not be taken.
    #[error("Cannot lock '{}': {source}", .path.display())]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
