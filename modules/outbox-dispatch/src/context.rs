use std::fmt;
use std::future::Future;
use std::sync::Arc;

use outbox_store::RunOnce;
use uuid::Uuid;

use crate::traits::IdempotencyGuard;

/// Passed to every handler invocation alongside the event.
///
/// Gives handlers an at-most-once guard for side effects that must not
/// repeat when the event is redelivered.
#[derive(Clone)]
pub struct HandlerContext {
    event_id: Uuid,
    retry_count: i32,
    guard: Arc<dyn IdempotencyGuard>,
}

impl HandlerContext {
    pub fn new(event_id: Uuid, retry_count: i32, guard: Arc<dyn IdempotencyGuard>) -> Self {
        Self {
            event_id,
            retry_count,
            guard,
        }
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    /// 1 on first delivery, 2 on the first retry, and so on.
    pub fn attempt(&self) -> i32 {
        self.retry_count.saturating_add(1)
    }

    /// Guard keyed by the event id. At most one side effect per event.
    pub async fn run_once<F>(&self, operation: F) -> anyhow::Result<RunOnce>
    where
        F: Future<Output = anyhow::Result<()>> + Send,
    {
        self.run_once_with_key(&self.event_id.to_string(), operation)
            .await
    }

    /// Guard keyed by `"{event_id}:{name}"`, for handlers with several
    /// independent side effects.
    pub async fn run_once_keyed<F>(&self, name: &str, operation: F) -> anyhow::Result<RunOnce>
    where
        F: Future<Output = anyhow::Result<()>> + Send,
    {
        self.run_once_with_key(&format!("{}:{}", self.event_id, name), operation)
            .await
    }

    pub async fn run_once_with_key<F>(&self, key: &str, operation: F) -> anyhow::Result<RunOnce>
    where
        F: Future<Output = anyhow::Result<()>> + Send,
    {
        self.guard.run_once(key, Box::pin(operation)).await
    }
}

impl fmt::Debug for HandlerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerContext")
            .field("event_id", &self.event_id)
            .field("retry_count", &self.retry_count)
            .finish_non_exhaustive()
    }
}
