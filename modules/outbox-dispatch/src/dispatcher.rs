//! The claim → dispatch → reconcile loop.

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use outbox_store::{IdempotencyStore, OutboxConfig, OutboxError, OutboxEvent, OutboxStore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::context::HandlerContext;
use crate::error::DispatchError;
use crate::registry::HandlerRegistry;
use crate::retry::{RetryPolicy, Transition};
use crate::traits::{IdempotencyGuard, OutboxBackend, PollingWake, WakeSource};

/// Outcome of a single cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// Nothing was claimable.
    Idle,
    Sent(Uuid),
    Retried {
        id: Uuid,
        retry_count: i32,
        delay: Duration,
    },
    Failed(Uuid),
}

/// Counters for one dispatcher run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub claimed: u64,
    pub sent: u64,
    pub retried: u64,
    pub failed: u64,
    pub recovered: u64,
    pub store_errors: u64,
}

impl DispatchStats {
    fn record(&mut self, tick: &Tick) {
        match tick {
            Tick::Idle => return,
            Tick::Sent(_) => self.sent += 1,
            Tick::Retried { .. } => self.retried += 1,
            Tick::Failed(_) => self.failed += 1,
        }
        self.claimed += 1;
    }
}

impl fmt::Display for DispatchStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "claimed={} sent={} retried={} failed={} recovered={} store_errors={}",
            self.claimed, self.sent, self.retried, self.failed, self.recovered, self.store_errors
        )
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Claims due events one at a time and hands them to registered handlers.
///
/// Any number of dispatchers may run against the same backend; the claim is
/// the only coordination between them. Delivery is at-least-once: a handler
/// can see the same event again after a failure or an abandoned claim.
pub struct Dispatcher<B: OutboxBackend> {
    backend: B,
    guard: Arc<dyn IdempotencyGuard>,
    registry: HandlerRegistry,
    policy: RetryPolicy,
    idle_timeout: Duration,
    error_backoff: Duration,
    processing_timeout: Option<Duration>,
    name: String,
}

impl<B: OutboxBackend + 'static> Dispatcher<B> {
    pub fn new(
        backend: B,
        guard: impl IdempotencyGuard + 'static,
        registry: HandlerRegistry,
        config: &OutboxConfig,
    ) -> Self {
        Self {
            backend,
            guard: Arc::new(guard),
            registry,
            policy: RetryPolicy::from_config(config),
            idle_timeout: config.idle_timeout,
            error_backoff: config.error_backoff,
            processing_timeout: config.processing_timeout,
            name: format!("dispatcher-{}", std::process::id()),
        }
    }

    /// Name used in log lines; useful when several dispatchers share a process.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Validate the registry, then spawn the loop onto the tokio runtime.
    pub fn start(self) -> Result<DispatcherHandle, DispatchError> {
        self.registry.validate()?;

        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let task = tokio::spawn(async move { self.run(token).await });

        Ok(DispatcherHandle { shutdown, task })
    }

    /// Drive the loop in the current task until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<DispatchStats, DispatchError> {
        self.registry.validate()?;
        info!(
            dispatcher = %self.name,
            handlers = ?self.registry.event_types(),
            "outbox dispatcher starting"
        );

        let mut wake = self.subscribe().await;
        let mut stats = DispatchStats::default();
        let mut last_recovery: Option<Instant> = None;

        while !shutdown.is_cancelled() {
            self.recover_if_due(&mut last_recovery, &mut stats).await;

            match self.tick().await {
                Ok(Tick::Idle) => {
                    let woke = tokio::select! {
                        woke = wake.wait(self.idle_timeout) => Some(woke),
                        () = shutdown.cancelled() => None,
                    };
                    match woke {
                        None => break,
                        Some(Ok(reason)) => debug!(dispatcher = %self.name, ?reason, "dispatcher woke"),
                        Some(Err(e)) => {
                            warn!(
                                dispatcher = %self.name,
                                error = %e,
                                "outbox subscription lost, falling back to polling"
                            );
                            wake = Box::new(PollingWake);
                        }
                    }
                }
                Ok(tick) => stats.record(&tick),
                Err(e) => {
                    stats.store_errors += 1;
                    error!(dispatcher = %self.name, error = %e, "outbox store error, backing off");
                    tokio::select! {
                        () = tokio::time::sleep(self.error_backoff) => {}
                        () = shutdown.cancelled() => break,
                    }
                }
            }
        }

        info!(dispatcher = %self.name, %stats, "outbox dispatcher stopped");
        Ok(stats)
    }

    /// One cycle: claim at most one event, run its handler, reconcile.
    ///
    /// Handler failures are not errors here; they come back as `Retried` or
    /// `Failed`. An `Err` means the backend itself failed, in which case a
    /// claimed event stays PROCESSING until stale recovery returns it.
    pub async fn tick(&self) -> Result<Tick, OutboxError> {
        let Some(event) = self.backend.claim().await? else {
            return Ok(Tick::Idle);
        };

        debug!(
            dispatcher = %self.name,
            event_id = %event.id,
            event_type = %event.event_type,
            retry_count = event.retry_count,
            "dispatching outbox event"
        );

        let error = match self.deliver(&event).await {
            Ok(()) => {
                self.backend.complete(event.id).await?;
                info!(event_id = %event.id, event_type = %event.event_type, "outbox event sent");
                return Ok(Tick::Sent(event.id));
            }
            Err(e) => format!("{e:#}"),
        };

        match self.policy.after_failure(&event) {
            Transition::Retry { retry_count, delay } => {
                warn!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    retry_count,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "outbox handler failed, rescheduling"
                );
                self.backend
                    .reschedule(event.id, retry_count, delay, &error)
                    .await?;
                Ok(Tick::Retried {
                    id: event.id,
                    retry_count,
                    delay,
                })
            }
            Transition::Fail { retry_count } => {
                error!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    retry_count,
                    max_retries = event.max_retries,
                    error = %error,
                    "outbox event exhausted its retries"
                );
                self.backend
                    .mark_failed(event.id, retry_count, &error)
                    .await?;
                Ok(Tick::Failed(event.id))
            }
        }
    }

    async fn deliver(&self, event: &OutboxEvent) -> anyhow::Result<()> {
        let handler = self.registry.resolve(&event.event_type)?;
        let ctx = HandlerContext::new(event.id, event.retry_count, self.guard.clone());

        match AssertUnwindSafe(handler.handle(event, &ctx)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(anyhow::anyhow!("handler panicked: {}", panic_message(&*panic))),
        }
    }

    async fn subscribe(&self) -> Box<dyn WakeSource> {
        match self.backend.subscribe().await {
            Ok(source) => source,
            Err(e) => {
                warn!(
                    dispatcher = %self.name,
                    error = %e,
                    "outbox subscription failed, polling every {:?}",
                    self.idle_timeout
                );
                Box::new(PollingWake)
            }
        }
    }

    async fn recover_if_due(&self, last: &mut Option<Instant>, stats: &mut DispatchStats) {
        let Some(timeout) = self.processing_timeout else {
            return;
        };
        if last.is_some_and(|at| at.elapsed() < timeout) {
            return;
        }
        *last = Some(Instant::now());

        match self.backend.recover_stale(timeout).await {
            Ok(recovered) => stats.recovered += recovered,
            Err(e) => {
                stats.store_errors += 1;
                warn!(dispatcher = %self.name, error = %e, "stale claim recovery failed");
            }
        }
    }
}

impl Dispatcher<OutboxStore> {
    /// Dispatcher over a Postgres store, using its pool for idempotency
    /// records and its configuration for timing.
    pub fn postgres(store: OutboxStore, registry: HandlerRegistry) -> Self {
        let config = store.config().clone();
        let guard: IdempotencyStore = store.idempotency();
        Self::new(store, guard, registry, &config)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

// ---------------------------------------------------------------------------
// DispatcherHandle
// ---------------------------------------------------------------------------

/// A running dispatcher. Dropping the handle does not stop it; call `stop`.
#[derive(Debug)]
pub struct DispatcherHandle {
    shutdown: CancellationToken,
    task: JoinHandle<Result<DispatchStats, DispatchError>>,
}

impl DispatcherHandle {
    /// Signal stop and wait for the in-flight cycle to finish.
    pub async fn stop(self) -> Result<DispatchStats, DispatchError> {
        self.shutdown.cancel();
        self.task
            .await
            .map_err(|e| DispatchError::Crashed(e.to_string()))?
    }

    /// Token that stops this dispatcher when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
