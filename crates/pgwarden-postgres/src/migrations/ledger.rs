//! Persistent record of applied migrations

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::warn;

use pgwarden_core::{MigrationId, WardenError, WardenResult};

use super::definition::{LEDGER_TABLE, Migration, MigrationRecord};
use crate::error::{UNIQUE_VIOLATION, pg_error};
use crate::manager::PostgresPool;

/// Advisory lock key serialising migration runs across processes
/// (`'pgwarden'` read as bytes)
const MIGRATION_LOCK_KEY: i64 = 0x7067_7761_7264_656e;

/// Result of applying one migration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Another process recorded the id first
    AlreadyApplied,
}

/// Storage for migration ledger rows.
///
/// Implementations must make `apply` atomic: the `up` statements and the
/// ledger insert either both take effect or neither does.
#[async_trait]
pub trait MigrationLedger: Send + Sync {
    async fn ledger_exists(&self) -> WardenResult<bool>;

    /// Create the ledger table by running `bootstrap` and recording it.
    async fn create_ledger(&self, bootstrap: &Migration) -> WardenResult<()>;

    /// Applied rows, in ascending id order.
    async fn applied(&self) -> WardenResult<Vec<MigrationRecord>>;

    async fn apply(&self, migration: &Migration) -> WardenResult<ApplyOutcome>;

    /// Run `down_sql` and delete the ledger row, atomically.
    async fn revert(&self, migration: &Migration, down_sql: &str) -> WardenResult<()>;
}

/// Ledger stored in the `schema_migrations` table of the managed database
#[derive(Clone)]
pub struct PostgresLedger {
    pool: PostgresPool,
}

impl PostgresLedger {
    pub fn new(pool: PostgresPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MigrationLedger for PostgresLedger {
    async fn ledger_exists(&self) -> WardenResult<bool> {
        let conn = self.pool.acquire().await?;
        let row = conn
            .query_one("SELECT to_regclass($1::text) IS NOT NULL", &[&LEDGER_TABLE])
            .await
            .map_err(pg_error)?;
        row.try_get(0).map_err(pg_error)
    }

    async fn create_ledger(&self, bootstrap: &Migration) -> WardenResult<()> {
        let id = bootstrap.id.to_string();
        let name = bootstrap.name.clone();
        let up_sql = bootstrap.up_sql.clone();

        self.pool
            .transaction(|tx| {
                Box::pin(async move {
                    tx.execute("SELECT pg_advisory_xact_lock($1)", &[&MIGRATION_LOCK_KEY])
                        .await
                        .map_err(pg_error)?;
                    tx.batch_execute(&up_sql).await.map_err(pg_error)?;
                    tx.execute(
                        "INSERT INTO schema_migrations (id, name) VALUES ($1, $2) \
                         ON CONFLICT (id) DO NOTHING",
                        &[&id, &name],
                    )
                    .await
                    .map_err(pg_error)?;
                    Ok::<_, WardenError>(())
                })
            })
            .await
    }

    async fn applied(&self) -> WardenResult<Vec<MigrationRecord>> {
        let conn = self.pool.acquire().await?;
        let rows = conn
            .query(
                "SELECT id, name, executed_at FROM schema_migrations",
                &[],
            )
            .await
            .map_err(pg_error)?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let raw_id: String = row.try_get(0).map_err(pg_error)?;
            let id = match MigrationId::new(raw_id.clone()) {
                Ok(id) => id,
                Err(_) => {
                    warn!(migration_id = %raw_id, "Ignoring ledger row with a non-numeric id");
                    continue;
                }
            };
            records.push(MigrationRecord {
                id,
                name: row.try_get(1).map_err(pg_error)?,
                executed_at: row.try_get::<_, DateTime<Utc>>(2).map_err(pg_error)?,
            });
        }
        // Text ordering in SQL would put "10" before "9".
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }

    async fn apply(&self, migration: &Migration) -> WardenResult<ApplyOutcome> {
        let id = migration.id.to_string();
        let name = migration.name.clone();
        let up_sql = migration.up_sql.clone();

        let result = self
            .pool
            .transaction(|tx| {
                Box::pin(async move {
                    tx.execute("SELECT pg_advisory_xact_lock($1)", &[&MIGRATION_LOCK_KEY])
                        .await
                        .map_err(pg_error)?;
                    let recorded = tx
                        .query_opt("SELECT 1 FROM schema_migrations WHERE id = $1", &[&id])
                        .await
                        .map_err(pg_error)?;
                    if recorded.is_some() {
                        return Ok(ApplyOutcome::AlreadyApplied);
                    }

                    tx.batch_execute(&up_sql).await.map_err(pg_error)?;
                    tx.execute(
                        "INSERT INTO schema_migrations (id, name) VALUES ($1, $2)",
                        &[&id, &name],
                    )
                    .await
                    .map_err(pg_error)?;
                    Ok::<_, WardenError>(ApplyOutcome::Applied)
                })
            })
            .await;

        match result {
            Err(e) if e.sql_state() == Some(UNIQUE_VIOLATION) => Ok(ApplyOutcome::AlreadyApplied),
            other => other,
        }
    }

    async fn revert(&self, migration: &Migration, down_sql: &str) -> WardenResult<()> {
        let id = migration.id.to_string();
        let down_sql = down_sql.to_string();

        self.pool
            .transaction(|tx| {
                Box::pin(async move {
                    tx.execute("SELECT pg_advisory_xact_lock($1)", &[&MIGRATION_LOCK_KEY])
                        .await
                        .map_err(pg_error)?;
                    tx.batch_execute(&down_sql).await.map_err(pg_error)?;
                    tx.execute("DELETE FROM schema_migrations WHERE id = $1", &[&id])
                        .await
                        .map_err(pg_error)?;
                    Ok::<_, WardenError>(())
                })
            })
            .await
    }
}
