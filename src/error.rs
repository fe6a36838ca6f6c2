//! Error types for the feedback worker.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type for the worker.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Classifier error: {0}")]
    Classifier(#[from] ClassifierError),
}

/// Configuration-related errors. All of them are fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
///
/// Everything except a failure to open the store is treated as transient by
/// the processing loop: the claim is abandoned and retried on a later poll.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Claim {claim} no longer holds record {record}")]
    ClaimLost { claim: Uuid, record: Uuid },
}

/// Classifier collaborator errors. Handled per record, never per batch.
#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    #[error("Classifier {model} failed: {reason}")]
    Failed { model: String, reason: String },

    #[error("Classifier {model} timed out after {timeout:?}")]
    Timeout { model: String, timeout: Duration },
}

/// Result type alias for the worker.
pub type Result<T> = std::result::Result<T, Error>;
