//! Ordered, exactly-once migration execution

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::{error, info, warn};

use pgwarden_core::{MigrationId, WardenError, WardenResult};

use super::definition::{
    Migration, MigrationRecord, MigrationReport, MigrationSet, MigrationStatusEntry,
};
use super::ledger::{ApplyOutcome, MigrationLedger};

/// Applies registered migrations in ascending id order, each at most once.
///
/// A run stops at the first failing migration: nothing after it is
/// attempted, and it is never retried automatically.
pub struct MigrationRunner {
    ledger: Arc<dyn MigrationLedger>,
    migrations: MigrationSet,
}

impl MigrationRunner {
    pub fn new(ledger: Arc<dyn MigrationLedger>, migrations: MigrationSet) -> Self {
        Self { ledger, migrations }
    }

    pub fn migrations(&self) -> &MigrationSet {
        &self.migrations
    }

    /// Apply every registered migration missing from the ledger.
    pub async fn run_pending(&self) -> WardenResult<MigrationReport> {
        let mut report = MigrationReport::default();

        if !self.ledger.ledger_exists().await? {
            let bootstrap = self.migrations.bootstrap();
            info!(
                migration_id = %bootstrap.id,
                name = %bootstrap.name,
                "Migration ledger missing; creating it"
            );
            self.ledger
                .create_ledger(bootstrap)
                .await
                .map_err(|e| failed(bootstrap, e))?;
            report.bootstrapped = true;
        }

        let applied = self.applied_by_id().await?;
        self.warn_unknown(&applied);

        for migration in self.migrations.iter() {
            if applied.contains_key(&migration.id) {
                report.skipped.push(migration.id.clone());
                continue;
            }

            let started = Instant::now();
            info!(migration_id = %migration.id, name = %migration.name, "Applying migration");
            match self.ledger.apply(migration).await {
                Ok(ApplyOutcome::Applied) => {
                    info!(
                        migration_id = %migration.id,
                        name = %migration.name,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Migration applied"
                    );
                    report.applied.push(migration.id.clone());
                }
                Ok(ApplyOutcome::AlreadyApplied) => {
                    info!(
                        migration_id = %migration.id,
                        "Migration was applied concurrently by another process"
                    );
                    report.skipped.push(migration.id.clone());
                }
                Err(e) => {
                    error!(
                        migration_id = %migration.id,
                        name = %migration.name,
                        error = %e,
                        "Migration failed; halting run"
                    );
                    return Err(failed(migration, e));
                }
            }
        }

        if report.applied.is_empty() {
            info!(total = self.migrations.len(), "Database schema is up to date");
        } else {
            info!(applied = report.applied.len(), "Pending migrations applied");
        }
        Ok(report)
    }

    /// Revert the most recently applied migration `id` using its `down` SQL.
    pub async fn rollback(&self, id: &MigrationId) -> WardenResult<()> {
        let migration = self
            .migrations
            .get(id)
            .ok_or_else(|| WardenError::UnknownMigration { id: id.to_string() })?;

        if migration.is_bootstrap() {
            return Err(unsupported(
                migration,
                "the ledger bootstrap migration cannot be rolled back",
            ));
        }
        let down_sql = migration
            .down_sql
            .as_deref()
            .ok_or_else(|| unsupported(migration, "no down migration defined"))?;

        if !self.ledger.ledger_exists().await? {
            return Err(WardenError::MigrationNotApplied { id: id.to_string() });
        }
        let applied = self.applied_by_id().await?;
        if !applied.contains_key(id) {
            return Err(WardenError::MigrationNotApplied { id: id.to_string() });
        }
        if let Some((latest, _)) = applied.last_key_value()
            && latest != id
        {
            return Err(unsupported(
                migration,
                &format!("migration {latest} was applied after it; roll that back first"),
            ));
        }

        warn!(migration_id = %migration.id, name = %migration.name, "Rolling back migration");
        self.ledger.revert(migration, down_sql).await?;
        info!(migration_id = %migration.id, "Migration rolled back");
        Ok(())
    }

    /// Applied/pending state of every registered migration, plus ledger rows
    /// that no registered migration accounts for.
    pub async fn status(&self) -> WardenResult<Vec<MigrationStatusEntry>> {
        let applied = if self.ledger.ledger_exists().await? {
            self.applied_by_id().await?
        } else {
            BTreeMap::new()
        };

        let mut entries: Vec<MigrationStatusEntry> = self
            .migrations
            .iter()
            .map(|migration| {
                let record = applied.get(&migration.id);
                MigrationStatusEntry {
                    id: migration.id.clone(),
                    name: migration.name.clone(),
                    executed: record.is_some(),
                    executed_at: record.map(|r| r.executed_at),
                    unknown: false,
                }
            })
            .collect();

        entries.extend(
            applied
                .values()
                .filter(|record| self.migrations.get(&record.id).is_none())
                .map(|record| MigrationStatusEntry {
                    id: record.id.clone(),
                    name: record.name.clone(),
                    executed: true,
                    executed_at: Some(record.executed_at),
                    unknown: true,
                }),
        );
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(entries)
    }

    async fn applied_by_id(&self) -> WardenResult<BTreeMap<MigrationId, MigrationRecord>> {
        Ok(self
            .ledger
            .applied()
            .await?
            .into_iter()
            .map(|record| (record.id.clone(), record))
            .collect())
    }

    fn warn_unknown(&self, applied: &BTreeMap<MigrationId, MigrationRecord>) {
        for record in applied.values() {
            if self.migrations.get(&record.id).is_none() {
                warn!(
                    migration_id = %record.id,
                    name = %record.name,
                    "Ledger contains a migration that is not registered"
                );
            }
        }
    }
}

fn failed(migration: &Migration, error: WardenError) -> WardenError {
    WardenError::MigrationFailed {
        id: migration.id.to_string(),
        name: migration.name.clone(),
        reason: error.to_string(),
    }
}

fn unsupported(migration: &Migration, reason: &str) -> WardenError {
    WardenError::RollbackUnsupported {
        id: migration.id.to_string(),
        reason: reason.to_string(),
    }
}
