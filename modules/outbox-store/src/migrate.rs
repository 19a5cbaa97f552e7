//! Reference schema for the outbox tables.
//!
//! Production schemas are usually provisioned by the application's own
//! migration tooling; this is the DDL those migrations should match, and the
//! fixture the integration tests run against. Every statement is idempotent.

use sqlx::PgPool;
use tracing::info;

use crate::error::Result;

pub const SCHEMA_SQL: &str = include_str!("../migrations/0001_outbox.sql");

/// Create `outbox_events` and `outbox_idempotency` if they don't exist.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::raw_sql(SCHEMA_SQL).execute(pool).await?;
    info!("outbox migrations completed");
    Ok(())
}
