use std::time::Duration;

use thiserror::Error;

use crate::models::ItemId;

/// Errors raised by the offline queue.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("storage is full")]
    StorageFull,
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("corrupt record '{record_id}'")]
    StorageCorrupt { record_id: String },
    #[error("delivery failed, will retry: {0}")]
    RetryableDelivery(String),
    #[error("delivery rejected: {0}")]
    PermanentDelivery(String),
    #[error("delivery timed out after {0:?}")]
    Timeout(Duration),
    #[error("item '{0}' is already queued")]
    DuplicateItem(ItemId),
    #[error("item '{0}' not found")]
    UnknownItem(ItemId),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

impl QueueError {
    /// Whether the sync engine should attempt delivery again later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RetryableDelivery(_) | Self::Timeout(_))
    }
}

impl From<sqlx::Error> for QueueError {
    fn from(err: sqlx::Error) -> Self {
        // SQLITE_FULL
        if let sqlx::Error::Database(db) = &err {
            if db.code().as_deref() == Some("13") {
                return Self::StorageFull;
            }
        }
        Self::StorageUnavailable(err.to_string())
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidPayload(err.to_string())
    }
}

/// Failure reported by a delivery collaborator for a single submit call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    /// Connectivity dropped while the attempt was underway.
    #[error("connection lost: {0}")]
    Offline(String),
    #[error("{0}")]
    Retryable(String),
    /// The remote side refused the payload; retrying will not help.
    #[error("{0}")]
    Permanent(String),
}

impl DeliveryError {
    pub fn is_offline(&self) -> bool {
        matches!(self, Self::Offline(_))
    }
}

impl From<std::io::Error> for DeliveryError {
    fn from(err: std::io::Error) -> Self {
        Self::Retryable(err.to_string())
    }
}

impl From<DeliveryError> for QueueError {
    fn from(err: DeliveryError) -> Self {
        match err {
            DeliveryError::Permanent(reason) => Self::PermanentDelivery(reason),
            other => Self::RetryableDelivery(other.to_string()),
        }
    }
}
