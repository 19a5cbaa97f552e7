//! Core types for the outbox. Payloads stay opaque JSON; handlers decode them.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::OutboxError;

/// Delivery state of an outbox event.
///
/// `Pending → Processing → {Sent | Pending (retry) | Failed}`. `Sent` and
/// `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    Pending,
    Processing,
    Sent,
    Failed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "PENDING",
            EventStatus::Processing => "PROCESSING",
            EventStatus::Sent => "SENT",
            EventStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, EventStatus::Sent | EventStatus::Failed)
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventStatus {
    type Err = OutboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(EventStatus::Pending),
            "PROCESSING" => Ok(EventStatus::Processing),
            "SENT" => Ok(EventStatus::Sent),
            "FAILED" => Ok(EventStatus::Failed),
            other => Err(OutboxError::InvalidStatus(other.to_string())),
        }
    }
}

/// An event as stored in `outbox_events`. Returned by claims and reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: Uuid,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub status: EventStatus,
    pub retry_count: i32,
    pub max_retries: i32,
    pub next_run_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl OutboxEvent {
    /// Deserialize the payload into the shape the handler expects.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, OutboxError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    /// Claimable iff pending and due.
    pub fn is_claimable_at(&self, now: DateTime<Utc>) -> bool {
        self.status == EventStatus::Pending && self.next_run_at <= now
    }
}

/// An event to be enqueued. The caller builds this; the store assigns id,
/// status and timestamps.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub event_type: String,
    pub payload: serde_json::Value,
    /// Overrides the configured retry ceiling for this event.
    pub max_retries: Option<i32>,
}

impl NewEvent {
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            max_retries: None,
        }
    }

    /// Create an event from anything that serializes to JSON.
    pub fn json<T: Serialize>(event_type: impl Into<String>, payload: &T) -> Result<Self, OutboxError> {
        Ok(Self::new(event_type, serde_json::to_value(payload)?))
    }

    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// Per-status row counts, for operators watching the outbox.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: i64,
    pub processing: i64,
    pub sent: i64,
    pub failed: i64,
}

impl StatusCounts {
    pub fn total(&self) -> i64 {
        self.pending + self.processing + self.sent + self.failed
    }

    pub fn record(&mut self, status: EventStatus, n: i64) {
        match status {
            EventStatus::Pending => self.pending += n,
            EventStatus::Processing => self.processing += n,
            EventStatus::Sent => self.sent += n,
            EventStatus::Failed => self.failed += n,
        }
    }
}

impl fmt::Display for StatusCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pending={} processing={} sent={} failed={}",
            self.pending, self.processing, self.sent, self.failed
        )
    }
}

// ---------------------------------------------------------------------------
// sqlx::FromRow for OutboxEvent
// ---------------------------------------------------------------------------

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for OutboxEvent {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> std::result::Result<Self, sqlx::Error> {
        use sqlx::Row;
        let status: String = row.try_get("status")?;
        let status = status.parse().map_err(|e: OutboxError| sqlx::Error::ColumnDecode {
            index: "status".to_string(),
            source: Box::new(e),
        })?;
        Ok(OutboxEvent {
            id: row.try_get("id")?,
            event_type: row.try_get("type")?,
            payload: row.try_get("payload")?,
            status,
            retry_count: row.try_get("retry_count")?,
            max_retries: row.try_get("max_retries")?,
            next_run_at: row.try_get("next_run_at")?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
            claimed_at: row.try_get("claimed_at")?,
            processed_at: row.try_get("processed_at")?,
        })
    }
}
