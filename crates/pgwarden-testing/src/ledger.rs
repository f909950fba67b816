//! In-memory migration ledger

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;

use pgwarden_core::{MigrationId, WardenError, WardenResult};
use pgwarden_postgres::migrations::{ApplyOutcome, Migration, MigrationLedger, MigrationRecord};

use crate::lock;

/// [`MigrationLedger`] holding rows in memory and logging every SQL batch it
/// "executes". `apply` is atomic: a failing migration leaves neither its SQL
/// nor a row behind.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    exists: AtomicBool,
    rows: Mutex<BTreeMap<MigrationId, MigrationRecord>>,
    executed: Mutex<Vec<String>>,
    failures: Mutex<HashMap<MigrationId, String>>,
    races: Mutex<HashSet<MigrationId>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `apply` of `id` fail with a syntax error carrying `message`
    pub fn fail_on(&self, id: &str, message: impl Into<String>) -> &Self {
        if let Ok(id) = MigrationId::new(id) {
            lock(&self.failures).insert(id, message.into());
        }
        self
    }

    /// Clear scripted failures
    pub fn clear_failures(&self) {
        lock(&self.failures).clear();
    }

    /// Have another "process" record `id` just before this ledger applies it
    pub fn race_on(&self, id: &str) -> &Self {
        if let Ok(id) = MigrationId::new(id) {
            lock(&self.races).insert(id);
        }
        self
    }

    /// Insert a row as if some other deployment had applied `id`
    pub fn record_external(&self, id: &str, name: &str) {
        let Ok(id) = MigrationId::new(id) else {
            return;
        };
        self.exists.store(true, Ordering::SeqCst);
        lock(&self.rows).insert(
            id.clone(),
            MigrationRecord {
                id,
                name: name.to_string(),
                executed_at: Utc::now(),
            },
        );
    }

    /// SQL batches executed so far, in order
    pub fn executed(&self) -> Vec<String> {
        lock(&self.executed).clone()
    }

    pub fn ddl_count(&self) -> usize {
        lock(&self.executed).len()
    }

    pub fn applied_ids(&self) -> Vec<String> {
        lock(&self.rows).keys().map(|id| id.to_string()).collect()
    }

    fn record(&self, migration: &Migration) {
        lock(&self.rows).insert(
            migration.id.clone(),
            MigrationRecord {
                id: migration.id.clone(),
                name: migration.name.clone(),
                executed_at: Utc::now(),
            },
        );
    }
}

#[async_trait]
impl MigrationLedger for InMemoryLedger {
    async fn ledger_exists(&self) -> WardenResult<bool> {
        Ok(self.exists.load(Ordering::SeqCst))
    }

    async fn create_ledger(&self, bootstrap: &Migration) -> WardenResult<()> {
        lock(&self.executed).push(bootstrap.up_sql.clone());
        self.exists.store(true, Ordering::SeqCst);
        self.record(bootstrap);
        Ok(())
    }

    async fn applied(&self) -> WardenResult<Vec<MigrationRecord>> {
        if !self.exists.load(Ordering::SeqCst) {
            return Err(WardenError::Query {
                code: Some("42P01".to_string()),
                message: "relation \"schema_migrations\" does not exist".to_string(),
            });
        }
        Ok(lock(&self.rows).values().cloned().collect())
    }

    async fn apply(&self, migration: &Migration) -> WardenResult<ApplyOutcome> {
        if lock(&self.races).remove(&migration.id) {
            self.record(migration);
        }
        if lock(&self.rows).contains_key(&migration.id) {
            return Ok(ApplyOutcome::AlreadyApplied);
        }
        if let Some(message) = lock(&self.failures).get(&migration.id).cloned() {
            return Err(WardenError::Query {
                code: Some("42601".to_string()),
                message,
            });
        }

        lock(&self.executed).push(migration.up_sql.clone());
        self.record(migration);
        Ok(ApplyOutcome::Applied)
    }

    async fn revert(&self, migration: &Migration, down_sql: &str) -> WardenResult<()> {
        lock(&self.executed).push(down_sql.to_string());
        lock(&self.rows).remove(&migration.id);
        Ok(())
    }
}
