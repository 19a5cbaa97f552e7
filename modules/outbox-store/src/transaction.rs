//! OutboxTransaction: a business transaction that can also enqueue events.

use std::ops::{Deref, DerefMut};

use sqlx::{PgConnection, Postgres, Transaction};
use tracing::debug;
use uuid::Uuid;

use crate::error::Result;
use crate::types::NewEvent;

/// An open Postgres transaction plus the outbox settings needed to enqueue
/// into it. Business writes go through `conn()` (or deref); events go through
/// `enqueue()`. Nothing is visible to dispatchers until `commit()`.
pub struct OutboxTransaction {
    tx: Transaction<'static, Postgres>,
    channel: String,
    max_retries: i32,
    enqueued: Vec<Uuid>,
}

impl OutboxTransaction {
    pub(crate) fn new(tx: Transaction<'static, Postgres>, channel: String, max_retries: i32) -> Self {
        Self {
            tx,
            channel,
            max_retries,
            enqueued: Vec::new(),
        }
    }

    /// Queue an event as part of this transaction. Returns the new event id.
    pub async fn enqueue(&mut self, event: NewEvent) -> Result<Uuid> {
        let id = insert_event(&mut self.tx, &event, self.max_retries, &self.channel).await?;
        self.enqueued.push(id);
        Ok(id)
    }

    /// The underlying connection, for the caller's own writes.
    pub fn conn(&mut self) -> &mut PgConnection {
        &mut self.tx
    }

    /// Ids enqueued so far in this transaction.
    pub fn enqueued(&self) -> &[Uuid] {
        &self.enqueued
    }

    /// Commit. Postgres delivers the pending NOTIFY to listeners at this point.
    pub async fn commit(self) -> Result<Vec<Uuid>> {
        self.tx.commit().await?;
        if !self.enqueued.is_empty() {
            debug!(count = self.enqueued.len(), "outbox events committed");
        }
        Ok(self.enqueued)
    }

    /// Roll back. Events enqueued here never existed.
    pub async fn rollback(self) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

impl Deref for OutboxTransaction {
    type Target = PgConnection;

    fn deref(&self) -> &PgConnection {
        &self.tx
    }
}

impl DerefMut for OutboxTransaction {
    fn deref_mut(&mut self) -> &mut PgConnection {
        &mut self.tx
    }
}

/// Insert a PENDING event and queue a wake-up NOTIFY on the same connection.
///
/// NOTIFY inside a transaction is held by Postgres until commit and dropped
/// on rollback, so listeners only ever wake for committed events.
pub(crate) async fn insert_event(
    conn: &mut PgConnection,
    event: &NewEvent,
    default_max_retries: i32,
    channel: &str,
) -> Result<Uuid> {
    let id = Uuid::new_v4();

    sqlx::query(
        r#"
        INSERT INTO outbox_events (id, type, payload, status, retry_count, max_retries, next_run_at)
        VALUES ($1, $2, $3, 'PENDING', 0, $4, now())
        "#,
    )
    .bind(id)
    .bind(&event.event_type)
    .bind(&event.payload)
    .bind(event.max_retries.unwrap_or(default_max_retries))
    .execute(&mut *conn)
    .await?;

    sqlx::query("SELECT pg_notify($1, '')")
        .bind(channel)
        .execute(&mut *conn)
        .await?;

    debug!(event_id = %id, event_type = %event.event_type, "outbox event enqueued");
    Ok(id)
}
