//! Error types for reqtrace-core

use thiserror::Error;

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for reqtrace-core
#[derive(Error, Debug)]
pub enum Error {
    /// Persistence errors (durable key-value port)
    #[error("Persistence error: {0}")]
    Persist(#[from] PersistError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Runtime errors (task wiring, channel failures, etc.)
    #[error("Runtime error: {0}")]
    Runtime(String),
}

/// Persistence-specific errors
#[derive(Error, Debug)]
pub enum PersistError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Snapshot serialization failed: {0}")]
    Serialize(String),

    #[error("Snapshot deserialization failed: {0}")]
    Deserialize(String),
}

impl From<rusqlite::Error> for PersistError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Database(err.to_string())
    }
}

/// Configuration-specific errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to read config file {0}: {1}")]
    ReadFailed(String, String),

    #[error("Failed to parse config: {0}")]
    ParseFailed(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },
}
