//! WolfMesh Error Types

use thiserror::Error;

use crate::trlog::Position;

/// Result type alias for WolfMesh operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfMesh error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Transaction log errors
    #[error("Transaction log error: {0}")]
    TrLog(String),

    #[error("Transaction log entry corrupted at position {pos}: {reason}")]
    TrLogCorrupted { pos: Position, reason: String },

    #[error("Transaction log position {0} is already occupied")]
    PositionOccupied(Position),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    // Routing errors
    #[error("Topology error: {0}")]
    Topology(String),

    // Protocol / network errors
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Peer {0} is unreachable")]
    PeerUnreachable(uuid::Uuid),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is retryable on the next natural trigger
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Network(_) | Error::PeerUnreachable(_) | Error::Storage(_)
        )
    }
}
