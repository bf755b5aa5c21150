//! Vigil Error Types

use thiserror::Error;

/// Result type alias for Vigil operations
pub type Result<T> = std::result::Result<T, Error>;

/// Vigil error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Consensus errors
    #[error("Not leader: current leader is {}", .0.as_deref().unwrap_or("unknown"))]
    NotLeader(Option<String>),

    #[error("Busy: {0}")]
    Busy(String),

    #[error("Stale term {got}: current term is {current}")]
    StaleTerm { got: u64, current: u64 },

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Invalid role transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    // Persistence errors (fatal to election participation)
    #[error("Persist error: {0}")]
    Persist(String),

    // Side-effect errors
    #[error("Command execution failed ({kind}): {reason}")]
    CommandExecution { kind: String, reason: String },

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    #[error("Message serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    // State errors
    #[error("State error: {0}")]
    State(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if this error is retryable by an administrative caller
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionTimeout(_)
                | Error::ConnectionFailed { .. }
                | Error::Network(_)
                | Error::Busy(_)
                | Error::NotLeader(_)
        )
    }

    /// Check if this error means a peer was unreachable for the current
    /// vote/heartbeat round (absorbed locally, never retried in-round)
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionTimeout(_) | Error::ConnectionFailed { .. } | Error::Io(_)
        )
    }

    /// Check if this error must halt election participation entirely
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Persist(_))
    }
}
