//! Error types for persistent subscriptions.

use thiserror::Error;

/// Errors raised by the event log collaborator.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Stream not found: {0}")]
    NoStream(String),

    #[error("Stream deleted: {0}")]
    StreamDeleted(String),

    #[error("Wrong expected version for {stream}: expected {expected}, actual {actual}")]
    WrongExpectedVersion {
        stream: String,
        expected: i64,
        actual: i64,
    },

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

impl StorageError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Timeout(_) | StorageError::Unavailable(_))
    }
}

/// Main error type for subscription operations.
#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    #[error("Subscription not found: {0}")]
    NotFound(String),

    #[error("Subscription already exists: {0}")]
    AlreadyExists(String),

    #[error("Maximum subscriber count reached for {0}")]
    MaxSubscribersReached(String),

    #[error("Unknown consumer strategy: {0}")]
    UnknownConsumerStrategy(String),

    #[error("Bad config data in {stream}: {reason}")]
    BadConfigData { stream: String, reason: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Subscription worker stopped: {0}")]
    WorkerStopped(String),

    #[error("Subscription deleted: {0}")]
    Deleted(String),
}

impl From<serde_json::Error> for SubscriptionError {
    fn from(e: serde_json::Error) -> Self {
        SubscriptionError::Serialization(e.to_string())
    }
}

/// Result type for subscription operations.
pub type Result<T> = std::result::Result<T, SubscriptionError>;
