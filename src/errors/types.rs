//! Error type definitions for the mediasync daemon.
//!
//! Nothing in the event or sweep paths aborts the daemon; only startup
//! misconfiguration is fatal. The taxonomy below keeps the two cases
//! apart so call sites can tell a retryable hiccup from a dead end.

use std::path::PathBuf;

use thiserror::Error;

/// Top-level application error type.
#[derive(Error, Debug)]
pub enum AppError {
    /// Missing or invalid configuration; fatal to the startup path that
    /// needs the missing piece, never to a single event.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Network-ish failures that the next enrollment will retry.
    #[error("Transient error: {message}")]
    Transient { message: String },

    /// A path that cannot be resolved to any library section. Logged and
    /// dropped, never retried.
    #[error("No library section contains path: {}", path.display())]
    Consistency { path: PathBuf },

    /// A scan root vanished while a deletion event was in flight; the
    /// mount is assumed dead and the deletion is discarded.
    #[error("Scan root not accessible: {}", root.display())]
    MountFailure { root: PathBuf },

    /// The sweep found more missing items than the configured threshold.
    #[error("Mass deletion guard tripped: {missing} missing items (threshold {threshold})")]
    MassDeletion { missing: u64, threshold: u64 },

    /// Persistent store errors.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Media server client errors.
    #[error("Media server error: {0}")]
    Server(#[from] ServerError),

    /// Filesystem errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors talking to the remote indexing server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Rejected token or API key.
    #[error("Authentication failed for {server}")]
    Unauthorized { server: String },

    /// Non-success HTTP status from the server.
    #[error("HTTP error: {status} - {message}")]
    Http { status: u16, message: String },

    /// Request timed out.
    #[error("Connection timeout: {url}")]
    Timeout { url: String },

    /// The server answered with something we could not interpret.
    #[error("Unexpected payload: {message}")]
    UnexpectedPayload { message: String },

    /// Transport-level failures.
    #[error("HTTP error: {0}")]
    Request(#[from] reqwest::Error),
}

impl AppError {
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn transient<S: Into<String>>(message: S) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }
}

impl ServerError {
    pub fn unexpected<S: Into<String>>(message: S) -> Self {
        Self::UnexpectedPayload {
            message: message.into(),
        }
    }

    /// Auth failures are configuration problems; everything else is
    /// retryable.
    pub fn is_transient(&self) -> bool {
        !matches!(self, ServerError::Unauthorized { .. })
    }
}
