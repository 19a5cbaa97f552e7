use thiserror::Error;
use uuid::Uuid;

use crate::types::EventStatus;

#[derive(Error, Debug)]
pub enum OutboxError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("payload serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("unknown event status: {0}")]
    InvalidStatus(String),

    #[error("outbox event not found: {0}")]
    NotFound(Uuid),

    /// A reconcile update found the row outside the state it expected,
    /// e.g. the claim was recovered as stale by another process.
    #[error("outbox event {id} is {actual}, expected {expected}")]
    InvalidTransition {
        id: Uuid,
        expected: EventStatus,
        actual: EventStatus,
    },
}

pub type Result<T> = std::result::Result<T, OutboxError>;
