//! Error types for the sync engine and stores.

use thiserror::Error;

/// Main error type for engine and store operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Invalid store format: {0}")]
    InvalidFormat(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Database is locked by another process")]
    Locked,

    #[error("Database not initialized")]
    NotInitialized,

    #[error("No store registered for record kind {0}")]
    StoreNotRegistered(u32),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Subscription closed: {0}")]
    SubscriptionClosed(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for Error {
    fn from(e: rmp_serde::encode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for Error {
    fn from(e: rmp_serde::decode::Error) -> Self {
        Error::Deserialization(e.to_string())
    }
}

/// Result type for engine and store operations.
pub type Result<T> = std::result::Result<T, Error>;
