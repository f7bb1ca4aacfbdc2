//! Crate-wide error type. Every fallible component boundary returns a
//! [`ContentEngineError`]; the [`crate::error_classifier`] module is the only
//! place that translates one into an [`crate::model::ErrorFingerprint`].

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ContentEngineError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("manifest schema validation failed: {0}")]
    SchemaValidation(String),

    #[error("invalid state transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: crate::model::ProjectStatus,
        to: crate::model::ProjectStatus,
    },

    #[error("priority queue is full")]
    QueueFull,

    #[error("connection pool acquire timed out after {0:?}")]
    PoolTimeout(std::time::Duration),

    #[error("connection pool is draining")]
    PoolDraining,

    #[error("circuit open for {model}: {failures} consecutive failures")]
    CircuitOpen { model: String, failures: u32 },

    #[error("provider api error ({code}): {message}")]
    ProviderApi { code: String, message: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("all models in the fallback chain failed: {0}")]
    AllModelsFailed(String),

    #[error("project {0} not found")]
    ProjectNotFound(uuid::Uuid),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, ContentEngineError>;
