//! Seams between the dispatch loop and whatever holds the outbox.
//!
//! Implemented for the Postgres store (`postgres.rs`) and for the in-memory
//! outbox (`memory.rs`). Also implemented for `Arc<T>` so one backend can be
//! shared between dispatchers and test assertions.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use outbox_store::{OutboxError, OutboxEvent, RunOnce};
use uuid::Uuid;

/// Why an idle wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    Notified,
    TimedOut,
}

/// Claim and reconcile outbox events.
#[async_trait]
pub trait OutboxBackend: Send + Sync {
    /// Atomically move the oldest due PENDING event to PROCESSING.
    async fn claim(&self) -> Result<Option<OutboxEvent>, OutboxError>;

    async fn complete(&self, id: Uuid) -> Result<(), OutboxError>;

    async fn reschedule(
        &self,
        id: Uuid,
        retry_count: i32,
        delay: Duration,
        error: &str,
    ) -> Result<(), OutboxError>;

    async fn mark_failed(&self, id: Uuid, retry_count: i32, error: &str) -> Result<(), OutboxError>;

    /// Return abandoned PROCESSING claims to the failure path.
    async fn recover_stale(&self, older_than: Duration) -> Result<u64, OutboxError>;

    /// Subscribe to enqueue notifications. Called once per dispatcher run.
    async fn subscribe(&self) -> Result<Box<dyn WakeSource>, OutboxError>;
}

/// Runs an operation at most once per key.
#[async_trait]
pub trait IdempotencyGuard: Send + Sync {
    async fn run_once(
        &self,
        key: &str,
        operation: BoxFuture<'_, anyhow::Result<()>>,
    ) -> anyhow::Result<RunOnce>;
}

/// Something an idle dispatcher can block on until new work may exist.
#[async_trait]
pub trait WakeSource: Send {
    /// Resolve on the first notification, or with `Wake::TimedOut` once
    /// `timeout` elapses.
    async fn wait(&mut self, timeout: Duration) -> Result<Wake, OutboxError>;
}

/// Timer-only wake source, used when no subscription is available.
pub struct PollingWake;

#[async_trait]
impl WakeSource for PollingWake {
    async fn wait(&mut self, timeout: Duration) -> Result<Wake, OutboxError> {
        tokio::time::sleep(timeout).await;
        Ok(Wake::TimedOut)
    }
}

// ---------------------------------------------------------------------------
// Arc<T> blankets
// ---------------------------------------------------------------------------

#[async_trait]
impl<B: OutboxBackend + ?Sized> OutboxBackend for Arc<B> {
    async fn claim(&self) -> Result<Option<OutboxEvent>, OutboxError> {
        (**self).claim().await
    }

    async fn complete(&self, id: Uuid) -> Result<(), OutboxError> {
        (**self).complete(id).await
    }

    async fn reschedule(
        &self,
        id: Uuid,
        retry_count: i32,
        delay: Duration,
        error: &str,
    ) -> Result<(), OutboxError> {
        (**self).reschedule(id, retry_count, delay, error).await
    }

    async fn mark_failed(&self, id: Uuid, retry_count: i32, error: &str) -> Result<(), OutboxError> {
        (**self).mark_failed(id, retry_count, error).await
    }

    async fn recover_stale(&self, older_than: Duration) -> Result<u64, OutboxError> {
        (**self).recover_stale(older_than).await
    }

    async fn subscribe(&self) -> Result<Box<dyn WakeSource>, OutboxError> {
        (**self).subscribe().await
    }
}

#[async_trait]
impl<G: IdempotencyGuard + ?Sized> IdempotencyGuard for Arc<G> {
    async fn run_once(
        &self,
        key: &str,
        operation: BoxFuture<'_, anyhow::Result<()>>,
    ) -> anyhow::Result<RunOnce> {
        (**self).run_once(key, operation).await
    }
}
