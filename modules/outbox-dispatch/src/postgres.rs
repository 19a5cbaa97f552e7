//! Backend implementations over the Postgres outbox store.

use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use outbox_store::{IdempotencyStore, OutboxError, OutboxEvent, OutboxStore, RunOnce};
use sqlx::postgres::PgListener;
use tracing::debug;
use uuid::Uuid;

use crate::traits::{IdempotencyGuard, OutboxBackend, Wake, WakeSource};

#[async_trait]
impl OutboxBackend for OutboxStore {
    async fn claim(&self) -> Result<Option<OutboxEvent>, OutboxError> {
        OutboxStore::claim(self).await
    }

    async fn complete(&self, id: Uuid) -> Result<(), OutboxError> {
        OutboxStore::complete(self, id).await
    }

    async fn reschedule(
        &self,
        id: Uuid,
        retry_count: i32,
        delay: Duration,
        error: &str,
    ) -> Result<(), OutboxError> {
        OutboxStore::reschedule(self, id, retry_count, delay, error).await
    }

    async fn mark_failed(&self, id: Uuid, retry_count: i32, error: &str) -> Result<(), OutboxError> {
        OutboxStore::mark_failed(self, id, retry_count, error).await
    }

    async fn recover_stale(&self, older_than: Duration) -> Result<u64, OutboxError> {
        OutboxStore::recover_stale(self, older_than).await
    }

    async fn subscribe(&self) -> Result<Box<dyn WakeSource>, OutboxError> {
        Ok(Box::new(self.listen().await?))
    }
}

#[async_trait]
impl IdempotencyGuard for IdempotencyStore {
    async fn run_once(
        &self,
        key: &str,
        operation: BoxFuture<'_, anyhow::Result<()>>,
    ) -> anyhow::Result<RunOnce> {
        IdempotencyStore::run_once(self, key, || operation).await
    }
}

#[async_trait]
impl WakeSource for PgListener {
    async fn wait(&mut self, timeout: Duration) -> Result<Wake, OutboxError> {
        match tokio::time::timeout(timeout, self.try_recv()).await {
            Err(_) => Ok(Wake::TimedOut),
            Ok(Ok(Some(notification))) => {
                debug!(channel = notification.channel(), "outbox notification received");
                Ok(Wake::Notified)
            }
            // The connection dropped and reconnects on the next call. Anything
            // sent in between is lost, so poll now rather than wait.
            Ok(Ok(None)) => Ok(Wake::Notified),
            Ok(Err(e)) => Err(e.into()),
        }
    }
}
