//! OutboxStore: the outbox tables in Postgres.
//!
//! Writers enqueue inside their own transactions. Dispatchers claim one due
//! row at a time with `FOR UPDATE SKIP LOCKED`, so any number of dispatcher
//! processes can share the table without coordinating; the row lock is the
//! only mutual exclusion.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use sqlx::postgres::{PgConnectOptions, PgListener, PgPoolOptions};
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::OutboxConfig;
use crate::error::{OutboxError, Result};
use crate::idempotency::IdempotencyStore;
use crate::transaction::{insert_event, OutboxTransaction};
use crate::types::{EventStatus, NewEvent, OutboxEvent, StatusCounts};

const EVENT_COLUMNS: &str = "id, type, payload, status, retry_count, max_retries, \
     next_run_at, last_error, created_at, claimed_at, processed_at";

// ---------------------------------------------------------------------------
// OutboxStore
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct OutboxStore {
    pool: PgPool,
    config: Arc<OutboxConfig>,
}

impl OutboxStore {
    pub fn new(pool: PgPool, config: OutboxConfig) -> Self {
        Self {
            pool,
            config: Arc::new(config),
        }
    }

    /// Open a pool from `config.database_url`, applying the configured
    /// statement timeout to every connection.
    pub async fn connect(config: &OutboxConfig) -> Result<Self> {
        config.validate()?;
        let url = config
            .database_url
            .as_deref()
            .ok_or_else(|| OutboxError::Config("DATABASE_URL is required".into()))?;

        let mut options = PgConnectOptions::from_str(url)?;
        if let Some(timeout) = config.statement_timeout {
            options = options.options([("statement_timeout", format!("{}ms", timeout.as_millis()))]);
        }

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;

        info!(channel = %config.channel, "outbox store connected");
        Ok(Self::new(pool, config.clone()))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn config(&self) -> &OutboxConfig {
        &self.config
    }

    /// Idempotency records share the store's pool.
    pub fn idempotency(&self) -> IdempotencyStore {
        IdempotencyStore::new(self.pool.clone())
    }

    // -- Writer ------------------------------------------------------------

    /// Start a transaction the caller commits or rolls back explicitly.
    pub async fn begin(&self) -> Result<OutboxTransaction> {
        let tx = self.pool.begin().await?;
        Ok(OutboxTransaction::new(
            tx,
            self.config.channel.clone(),
            self.config.max_retries,
        ))
    }

    /// Run `body` inside a transaction: commit if it returns `Ok`, roll back
    /// and hand back its error otherwise. The connection goes back to the
    /// pool on every path.
    ///
    /// ```ignore
    /// store
    ///     .with_transaction(|tx| Box::pin(async move {
    ///         sqlx::query("INSERT INTO orders (amount) VALUES (100)")
    ///             .execute(tx.conn())
    ///             .await?;
    ///         tx.enqueue(NewEvent::new("order.created", json!({"id": 1}))).await?;
    ///         Ok::<_, anyhow::Error>(())
    ///     }))
    ///     .await?;
    /// ```
    pub async fn with_transaction<T, E, F>(&self, body: F) -> std::result::Result<T, E>
    where
        F: for<'c> FnOnce(&'c mut OutboxTransaction) -> BoxFuture<'c, std::result::Result<T, E>>,
        E: From<OutboxError>,
    {
        let mut tx = self.begin().await?;

        match body(&mut tx).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    // The connection is discarded on drop either way.
                    warn!(error = %rollback_err, "outbox transaction rollback failed");
                }
                Err(e)
            }
        }
    }

    /// Enqueue into a transaction the caller already holds.
    pub async fn enqueue(&self, tx: &mut Transaction<'_, Postgres>, event: NewEvent) -> Result<Uuid> {
        insert_event(tx, &event, self.config.max_retries, &self.config.channel).await
    }

    // -- Claim / reconcile -------------------------------------------------

    /// Claim the oldest due PENDING event, or `None` if nothing is claimable.
    ///
    /// Rows locked by a concurrent claimer are skipped rather than waited on.
    /// The lock is released at commit, before any handler runs.
    pub async fn claim(&self) -> Result<Option<OutboxEvent>> {
        let mut tx = self.pool.begin().await?;

        let event = sqlx::query_as::<_, OutboxEvent>(
            r#"
            WITH next AS (
                SELECT id
                FROM outbox_events
                WHERE status = 'PENDING'
                  AND next_run_at <= now()
                ORDER BY created_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE outbox_events e
            SET status = 'PROCESSING',
                claimed_at = now()
            FROM next
            WHERE e.id = next.id
            RETURNING e.id, e.type, e.payload, e.status, e.retry_count, e.max_retries,
                      e.next_run_at, e.last_error, e.created_at, e.claimed_at, e.processed_at
            "#,
        )
        .fetch_optional(&mut *tx)
        .await?;

        tx.commit().await?;

        if let Some(event) = &event {
            debug!(event_id = %event.id, event_type = %event.event_type, "claimed outbox event");
        }
        Ok(event)
    }

    /// PROCESSING → SENT.
    pub async fn complete(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'SENT',
                processed_at = now(),
                claimed_at = NULL
            WHERE id = $1 AND status = 'PROCESSING'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        self.ensure_transitioned(id, result.rows_affected()).await
    }

    /// PROCESSING → PENDING, due again after `delay`.
    pub async fn reschedule(&self, id: Uuid, retry_count: i32, delay: Duration, error: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'PENDING',
                retry_count = $2,
                last_error = $3,
                next_run_at = now() + make_interval(secs => $4::float8),
                claimed_at = NULL
            WHERE id = $1 AND status = 'PROCESSING'
            "#,
        )
        .bind(id)
        .bind(retry_count)
        .bind(error)
        .bind(delay.as_secs_f64())
        .execute(&self.pool)
        .await?;

        self.ensure_transitioned(id, result.rows_affected()).await
    }

    /// PROCESSING → FAILED. Terminal: no claim query ever selects it again.
    pub async fn mark_failed(&self, id: Uuid, retry_count: i32, error: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'FAILED',
                retry_count = $2,
                last_error = $3,
                claimed_at = NULL
            WHERE id = $1 AND status = 'PROCESSING'
            "#,
        )
        .bind(id)
        .bind(retry_count)
        .bind(error)
        .execute(&self.pool)
        .await?;

        self.ensure_transitioned(id, result.rows_affected()).await
    }

    /// Push claims older than `older_than` back through the failure path.
    ///
    /// A PROCESSING row that old belongs to a dispatcher that died between
    /// claim and reconcile. It counts as a failed attempt: FAILED once the
    /// retry budget is spent, otherwise PENDING and immediately due.
    pub async fn recover_stale(&self, older_than: Duration) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET retry_count = retry_count + 1,
                status = CASE WHEN retry_count + 1 > max_retries THEN 'FAILED' ELSE 'PENDING' END,
                next_run_at = now(),
                last_error = 'claim expired before the event was reconciled',
                claimed_at = NULL
            WHERE status = 'PROCESSING'
              AND claimed_at < now() - make_interval(secs => $1::float8)
            "#,
        )
        .bind(older_than.as_secs_f64())
        .execute(&self.pool)
        .await?;

        let recovered = result.rows_affected();
        if recovered > 0 {
            warn!(recovered, "recovered stale outbox claims");
        }
        Ok(recovered)
    }

    async fn ensure_transitioned(&self, id: Uuid, rows_affected: u64) -> Result<()> {
        if rows_affected > 0 {
            return Ok(());
        }
        match self.read_event(id).await? {
            Some(event) => Err(OutboxError::InvalidTransition {
                id,
                expected: EventStatus::Processing,
                actual: event.status,
            }),
            None => Err(OutboxError::NotFound(id)),
        }
    }

    // -- Notifications -----------------------------------------------------

    /// A dedicated listener connection subscribed to the wake channel.
    ///
    /// The connection is detached from the pool, so holding it through long
    /// idle waits never starves transactional work.
    pub async fn listen(&self) -> Result<PgListener> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(&self.config.channel).await?;
        debug!(channel = %self.config.channel, "listening for outbox notifications");
        Ok(listener)
    }

    // -- Inspection --------------------------------------------------------

    pub async fn read_event(&self, id: Uuid) -> Result<Option<OutboxEvent>> {
        let event = sqlx::query_as::<_, OutboxEvent>(&format!(
            "SELECT {EVENT_COLUMNS} FROM outbox_events WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(event)
    }

    /// Events in a given state, oldest first.
    pub async fn list_by_status(&self, status: EventStatus, limit: usize) -> Result<Vec<OutboxEvent>> {
        let events = sqlx::query_as::<_, OutboxEvent>(&format!(
            "SELECT {EVENT_COLUMNS} FROM outbox_events WHERE status = $1 ORDER BY created_at ASC LIMIT $2"
        ))
        .bind(status.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(events)
    }

    pub async fn count_by_status(&self) -> Result<StatusCounts> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT status, COUNT(*) FROM outbox_events GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts = StatusCounts::default();
        for (status, n) in rows {
            counts.record(status.parse()?, n);
        }
        Ok(counts)
    }
}
