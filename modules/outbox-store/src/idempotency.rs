//! Idempotency records: an insert-if-absent row per key, used as a fencing
//! token so a side effect runs at most once across redeliveries.

use std::future::Future;
use std::panic::{self, AssertUnwindSafe};

use futures::FutureExt;

use serde::Serialize;
use sqlx::PgPool;
use tracing::{debug, warn};

use crate::error::{OutboxError, Result};

/// What `run_once` did with the operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunOnce {
    /// First attempt for this key; the operation ran.
    Executed,
    /// The key was already recorded; the operation was not run.
    Skipped,
}

impl RunOnce {
    pub fn executed(&self) -> bool {
        matches!(self, RunOnce::Executed)
    }
}

#[derive(Clone)]
pub struct IdempotencyStore {
    pool: PgPool,
}

impl IdempotencyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run `operation` only if `key` has never been recorded.
    ///
    /// The key is inserted in a transaction that stays open while the
    /// operation runs, so a concurrent attempt on the same key blocks on the
    /// unique index until this one finishes, then sees the key and skips.
    /// The record is committed whether or not the operation succeeds: a
    /// failed operation is never re-run through this key. That includes a
    /// panicking operation; the record is committed before the panic resumes.
    /// Callers whose effect must eventually happen need their own
    /// reconciliation.
    pub async fn run_once<F, Fut, E>(&self, key: &str, operation: F) -> std::result::Result<RunOnce, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<(), E>>,
        E: From<OutboxError>,
    {
        let mut tx = self.pool.begin().await.map_err(OutboxError::from)?;

        let inserted = sqlx::query(
            "INSERT INTO outbox_idempotency (key) VALUES ($1) ON CONFLICT (key) DO NOTHING",
        )
        .bind(key)
        .execute(&mut *tx)
        .await
        .map_err(OutboxError::from)?
        .rows_affected();

        if inserted == 0 {
            tx.commit().await.map_err(OutboxError::from)?;
            debug!(key, "idempotency key already recorded, skipping operation");
            return Ok(RunOnce::Skipped);
        }

        let outcome = match AssertUnwindSafe(operation()).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => {
                if let Err(commit_err) = tx.commit().await {
                    warn!(key, error = %commit_err, "failed to record idempotency key after panicking operation");
                }
                panic::resume_unwind(panic);
            }
        };
        let committed = tx.commit().await;

        match (outcome, committed) {
            (Ok(()), Ok(())) => Ok(RunOnce::Executed),
            (Ok(()), Err(e)) => Err(OutboxError::from(e).into()),
            (Err(e), committed) => {
                if let Err(commit_err) = committed {
                    warn!(key, error = %commit_err, "failed to record idempotency key after failed operation");
                }
                Err(e)
            }
        }
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        let row = sqlx::query_as::<_, (bool,)>(
            "SELECT EXISTS (SELECT 1 FROM outbox_idempotency WHERE key = $1)",
        )
        .bind(key)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.0)
    }
}
