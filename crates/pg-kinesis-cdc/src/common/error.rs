//! Error types for the bridge pipeline
//!
//! Classifies failures the way the supervisor needs to react to them:
//! configuration errors are fatal at startup, connect/replication/parse
//! errors end the current connection (the supervisor reconnects and the
//! slot replays), publish errors surface only after the retry budget is
//! exhausted.

use thiserror::Error;

/// Bridge-specific errors
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Configuration error (fatal at startup)
    #[error("configuration error: {0}")]
    Config(String),

    /// Connection establishment error (retried by the supervisor)
    #[error("connection error: {0}")]
    Connect(String),

    /// Replication protocol error (fatal for the current connection)
    #[error("replication error: {0}")]
    Replication(String),

    /// Logical-decoding parse error, carrying the offending payload
    #[error("unable to parse replication message: {message}; payload: {payload}")]
    Parse { message: String, payload: String },

    /// Encoded record exceeds the per-record size limit (non-retryable)
    #[error("encoded record is {bytes} bytes; records must be at most 1MiB")]
    OversizedRecord { bytes: usize },

    /// Publishing failed after the retry budget was exhausted
    #[error("publish error: {0}")]
    Publish(String),

    /// A retry loop was aborted by shutdown
    #[error("interrupted by shutdown")]
    Interrupted,

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new connection error
    pub fn connect(msg: impl Into<String>) -> Self {
        Self::Connect(msg.into())
    }

    /// Create a new replication error
    pub fn replication(msg: impl Into<String>) -> Self {
        Self::Replication(msg.into())
    }

    /// Create a new publish error
    pub fn publish(msg: impl Into<String>) -> Self {
        Self::Publish(msg.into())
    }

    /// Create a parse error carrying the original payload as context
    pub fn parse(msg: impl Into<String>, payload: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
            payload: payload.into(),
        }
    }

    /// Whether this error was caused by an in-flight shutdown rather than
    /// a real failure.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::Interrupted)
    }
}

/// Result type for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;
