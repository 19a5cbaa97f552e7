//! In-process outbox for tests and embedded use. No database required.
//!
//! Mirrors the Postgres semantics: claims are exclusive (a mutex stands in
//! for the row lock), reconcile calls require PROCESSING, and every enqueue
//! wakes each subscriber.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use outbox_store::{
    EventStatus, NewEvent, OutboxError, OutboxEvent, RunOnce, StatusCounts,
    config::DEFAULT_MAX_RETRIES,
};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::traits::{IdempotencyGuard, OutboxBackend, Wake, WakeSource};

/// A reschedule as recorded by `MemoryOutbox`, for asserting on backoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reschedule {
    pub id: Uuid,
    pub retry_count: i32,
    pub delay: Duration,
    pub error: String,
}

/// Cloning shares the same outbox.
#[derive(Clone)]
pub struct MemoryOutbox {
    inner: Arc<Inner>,
}

struct Inner {
    events: Mutex<Vec<OutboxEvent>>,
    keys: Mutex<HashSet<String>>,
    reschedules: Mutex<Vec<Reschedule>>,
    claim_failures: Mutex<usize>,
    default_max_retries: i32,
    wake: broadcast::Sender<()>,
}

impl MemoryOutbox {
    pub fn new() -> Self {
        Self::with_max_retries(DEFAULT_MAX_RETRIES)
    }

    /// Events enqueued without their own ceiling get `max_retries`.
    pub fn with_max_retries(max_retries: i32) -> Self {
        let (wake, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                events: Mutex::new(Vec::new()),
                keys: Mutex::new(HashSet::new()),
                reschedules: Mutex::new(Vec::new()),
                claim_failures: Mutex::new(0),
                default_max_retries: max_retries,
                wake,
            }),
        }
    }

    pub fn enqueue(&self, event: NewEvent) -> Uuid {
        let now = Utc::now();
        let id = Uuid::new_v4();
        self.inner.events.lock().unwrap().push(OutboxEvent {
            id,
            event_type: event.event_type,
            payload: event.payload,
            status: EventStatus::Pending,
            retry_count: 0,
            max_retries: event.max_retries.unwrap_or(self.inner.default_max_retries),
            next_run_at: now,
            last_error: None,
            created_at: now,
            claimed_at: None,
            processed_at: None,
        });
        // No receivers just means nobody is idle.
        let _ = self.inner.wake.send(());
        id
    }

    /// Make the next `n` claims fail as if the store were unreachable.
    pub fn fail_next_claims(&self, n: usize) {
        *self.inner.claim_failures.lock().unwrap() = n;
    }

    pub fn event(&self, id: Uuid) -> Option<OutboxEvent> {
        self.inner
            .events
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.id == id)
            .cloned()
    }

    pub fn events(&self) -> Vec<OutboxEvent> {
        self.inner.events.lock().unwrap().clone()
    }

    pub fn count_by_status(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for event in self.inner.events.lock().unwrap().iter() {
            counts.record(event.status, 1);
        }
        counts
    }

    pub fn reschedules(&self) -> Vec<Reschedule> {
        self.inner.reschedules.lock().unwrap().clone()
    }

    pub fn has_key(&self, key: &str) -> bool {
        self.inner.keys.lock().unwrap().contains(key)
    }

    /// Backdate an event's claim, as if its dispatcher died mid-handler.
    pub fn age_claim(&self, id: Uuid, by: Duration) {
        let by = chrono::Duration::from_std(by).unwrap_or(chrono::Duration::zero());
        if let Some(event) = self.inner.events.lock().unwrap().iter_mut().find(|e| e.id == id) {
            event.claimed_at = event.claimed_at.map(|at| at - by);
        }
    }

    fn transition<F>(&self, id: Uuid, apply: F) -> Result<(), OutboxError>
    where
        F: FnOnce(&mut OutboxEvent),
    {
        let mut events = self.inner.events.lock().unwrap();
        let event = events
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(OutboxError::NotFound(id))?;
        if event.status != EventStatus::Processing {
            return Err(OutboxError::InvalidTransition {
                id,
                expected: EventStatus::Processing,
                actual: event.status,
            });
        }
        apply(event);
        event.claimed_at = None;
        Ok(())
    }
}

impl Default for MemoryOutbox {
    fn default() -> Self {
        Self::new()
    }
}

fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[async_trait]
impl OutboxBackend for MemoryOutbox {
    async fn claim(&self) -> Result<Option<OutboxEvent>, OutboxError> {
        {
            let mut failures = self.inner.claim_failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(OutboxError::Database(sqlx::Error::PoolTimedOut));
            }
        }

        let now = Utc::now();
        let mut events = self.inner.events.lock().unwrap();
        // Insertion order is creation order.
        let Some(event) = events.iter_mut().find(|e| e.is_claimable_at(now)) else {
            return Ok(None);
        };
        event.status = EventStatus::Processing;
        event.claimed_at = Some(now);
        Ok(Some(event.clone()))
    }

    async fn complete(&self, id: Uuid) -> Result<(), OutboxError> {
        self.transition(id, |event| {
            event.status = EventStatus::Sent;
            event.processed_at = Some(Utc::now());
        })
    }

    async fn reschedule(
        &self,
        id: Uuid,
        retry_count: i32,
        delay: Duration,
        error: &str,
    ) -> Result<(), OutboxError> {
        self.transition(id, |event| {
            event.status = EventStatus::Pending;
            event.retry_count = retry_count;
            event.last_error = Some(error.to_string());
            event.next_run_at = after(Utc::now(), delay);
        })?;
        self.inner.reschedules.lock().unwrap().push(Reschedule {
            id,
            retry_count,
            delay,
            error: error.to_string(),
        });
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, retry_count: i32, error: &str) -> Result<(), OutboxError> {
        self.transition(id, |event| {
            event.status = EventStatus::Failed;
            event.retry_count = retry_count;
            event.last_error = Some(error.to_string());
        })
    }

    async fn recover_stale(&self, older_than: Duration) -> Result<u64, OutboxError> {
        let now = Utc::now();
        let cutoff = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|d| now.checked_sub_signed(d))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut recovered = 0;
        for event in self.inner.events.lock().unwrap().iter_mut() {
            let stale = event.status == EventStatus::Processing
                && event.claimed_at.is_some_and(|at| at < cutoff);
            if !stale {
                continue;
            }
            event.retry_count += 1;
            event.status = if event.retry_count > event.max_retries {
                EventStatus::Failed
            } else {
                EventStatus::Pending
            };
            event.next_run_at = now;
            event.last_error = Some("claim expired before the event was reconciled".into());
            event.claimed_at = None;
            recovered += 1;
        }
        Ok(recovered)
    }

    async fn subscribe(&self) -> Result<Box<dyn WakeSource>, OutboxError> {
        Ok(Box::new(MemoryWake(self.inner.wake.subscribe())))
    }
}

#[async_trait]
impl IdempotencyGuard for MemoryOutbox {
    async fn run_once(
        &self,
        key: &str,
        operation: BoxFuture<'_, anyhow::Result<()>>,
    ) -> anyhow::Result<RunOnce> {
        // Recorded before the operation runs, and kept if it fails.
        if !self.inner.keys.lock().unwrap().insert(key.to_string()) {
            return Ok(RunOnce::Skipped);
        }
        operation.await?;
        Ok(RunOnce::Executed)
    }
}

struct MemoryWake(broadcast::Receiver<()>);

#[async_trait]
impl WakeSource for MemoryWake {
    async fn wait(&mut self, timeout: Duration) -> Result<Wake, OutboxError> {
        match tokio::time::timeout(timeout, self.0.recv()).await {
            Err(_) => Ok(Wake::TimedOut),
            // Lagged still means something was enqueued.
            Ok(Ok(())) | Ok(Err(broadcast::error::RecvError::Lagged(_))) => Ok(Wake::Notified),
            Ok(Err(broadcast::error::RecvError::Closed)) => Err(OutboxError::Config(
                "memory outbox dropped while subscribed".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn claims_are_exclusive_and_ordered() {
        let outbox = MemoryOutbox::new();
        let first = outbox.enqueue(NewEvent::new("a", json!({})));
        let second = outbox.enqueue(NewEvent::new("b", json!({})));

        assert_eq!(outbox.claim().await.unwrap().unwrap().id, first);
        assert_eq!(outbox.claim().await.unwrap().unwrap().id, second);
        assert!(outbox.claim().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reconcile_requires_a_claim() {
        let outbox = MemoryOutbox::new();
        let id = outbox.enqueue(NewEvent::new("a", json!({})));

        let err = outbox.complete(id).await.unwrap_err();
        assert!(matches!(
            err,
            OutboxError::InvalidTransition {
                actual: EventStatus::Pending,
                ..
            }
        ));
        assert!(matches!(
            outbox.complete(Uuid::new_v4()).await.unwrap_err(),
            OutboxError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn rescheduled_event_waits_out_its_delay() {
        let outbox = MemoryOutbox::new();
        let id = outbox.enqueue(NewEvent::new("a", json!({})));
        outbox.claim().await.unwrap();
        outbox
            .reschedule(id, 1, Duration::from_secs(60), "boom")
            .await
            .unwrap();

        assert!(outbox.claim().await.unwrap().is_none());
        let event = outbox.event(id).unwrap();
        assert_eq!(event.status, EventStatus::Pending);
        assert_eq!(event.retry_count, 1);
        assert_eq!(event.last_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn stale_claims_count_as_an_attempt() {
        let outbox = MemoryOutbox::new();
        let retried = outbox.enqueue(NewEvent::new("a", json!({})));
        let exhausted = outbox.enqueue(NewEvent::new("b", json!({})).with_max_retries(0));
        outbox.claim().await.unwrap();
        outbox.claim().await.unwrap();
        outbox.age_claim(retried, Duration::from_secs(600));
        outbox.age_claim(exhausted, Duration::from_secs(600));

        assert_eq!(outbox.recover_stale(Duration::from_secs(300)).await.unwrap(), 2);
        assert_eq!(outbox.event(retried).unwrap().status, EventStatus::Pending);
        assert_eq!(outbox.event(exhausted).unwrap().status, EventStatus::Failed);
    }

    #[tokio::test]
    async fn enqueue_wakes_subscribers() {
        let outbox = MemoryOutbox::new();
        let mut wake = outbox.subscribe().await.unwrap();

        assert_eq!(
            wake.wait(Duration::from_millis(20)).await.unwrap(),
            Wake::TimedOut
        );
        outbox.enqueue(NewEvent::new("a", json!({})));
        assert_eq!(
            wake.wait(Duration::from_secs(5)).await.unwrap(),
            Wake::Notified
        );
    }
}
