//! Transactional outbox on Postgres.
//!
//! Events are written in the same transaction as the business data that
//! produced them, then claimed one at a time by dispatchers using
//! `FOR UPDATE SKIP LOCKED`. Payloads are opaque JSONB; this crate never
//! looks inside them.

pub mod config;
pub mod error;
pub mod idempotency;
pub mod migrate;
pub mod store;
pub mod transaction;
pub mod types;

#[cfg(feature = "test-utils")]
pub mod testutil;

pub use config::OutboxConfig;
pub use error::{OutboxError, Result};
pub use idempotency::{IdempotencyStore, RunOnce};
pub use migrate::migrate;
pub use store::OutboxStore;
pub use transaction::OutboxTransaction;
pub use types::{EventStatus, NewEvent, OutboxEvent, StatusCounts};
