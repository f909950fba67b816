//! Migration definitions and the ordered registry

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use pgwarden_core::{MigrationId, WardenError, WardenResult};

/// Ledger table name
pub const LEDGER_TABLE: &str = "schema_migrations";

/// Id of the migration that creates the ledger itself
pub const BOOTSTRAP_MIGRATION_ID: &str = "001";
const BOOTSTRAP_NUMBER: u64 = 1;

const BOOTSTRAP_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    executed_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
"#;

/// A versioned schema change
#[derive(Debug, Clone)]
pub struct Migration {
    pub id: MigrationId,
    pub name: String,
    pub up_sql: String,
    /// Present only for migrations that support operator rollback
    pub down_sql: Option<String>,
}

impl Migration {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        up_sql: impl Into<String>,
    ) -> WardenResult<Self> {
        let migration = Self {
            id: MigrationId::new(id)?,
            name: name.into(),
            up_sql: up_sql.into(),
            down_sql: None,
        };
        if migration.name.trim().is_empty() {
            return Err(WardenError::InvalidMigration(format!(
                "migration {} has an empty name",
                migration.id
            )));
        }
        if migration.up_sql.trim().is_empty() {
            return Err(WardenError::InvalidMigration(format!(
                "migration {} has no up SQL",
                migration.id
            )));
        }
        Ok(migration)
    }

    pub fn with_down(mut self, down_sql: impl Into<String>) -> Self {
        self.down_sql = Some(down_sql.into());
        self
    }

    /// The migration that creates the ledger table
    pub fn bootstrap() -> Self {
        Self {
            id: MigrationId::from_number(BOOTSTRAP_NUMBER, BOOTSTRAP_MIGRATION_ID.len()),
            name: "create_schema_migrations".to_string(),
            up_sql: BOOTSTRAP_SQL.to_string(),
            down_sql: None,
        }
    }

    pub fn is_bootstrap(&self) -> bool {
        self.id.as_str() == BOOTSTRAP_MIGRATION_ID
    }
}

/// Ordered set of registered migrations. Always begins with the ledger
/// bootstrap migration; further ids must be strictly ascending.
#[derive(Debug, Clone)]
pub struct MigrationSet {
    migrations: Vec<Migration>,
}

impl Default for MigrationSet {
    fn default() -> Self {
        Self::new()
    }
}

impl MigrationSet {
    pub fn new() -> Self {
        Self {
            migrations: vec![Migration::bootstrap()],
        }
    }

    /// Append a migration. Its id must be greater than every registered id.
    pub fn register(&mut self, migration: Migration) -> WardenResult<&mut Self> {
        if let Some(last) = self.migrations.last()
            && migration.id <= last.id
        {
            return Err(WardenError::InvalidMigration(format!(
                "migration {} ({}) must have an id greater than {} ({})",
                migration.id, migration.name, last.id, last.name
            )));
        }
        self.migrations.push(migration);
        Ok(self)
    }

    /// Builder-style [`register`](Self::register)
    pub fn with(mut self, migration: Migration) -> WardenResult<Self> {
        self.register(migration)?;
        Ok(self)
    }

    /// Load `<id>_<name>.up.sql` / `<id>_<name>.down.sql` pairs from `dir`.
    ///
    /// Files that do not follow the naming scheme are ignored. A `.down.sql`
    /// without a matching `.up.sql` is an error.
    pub fn from_dir(dir: impl AsRef<Path>) -> WardenResult<Self> {
        let dir = dir.as_ref();
        let entries = fs::read_dir(dir).map_err(|e| {
            WardenError::InvalidMigration(format!(
                "cannot read migrations directory {}: {e}",
                dir.display()
            ))
        })?;

        #[derive(Default)]
        struct Pending {
            name: String,
            up: Option<String>,
            down: Option<String>,
        }
        let mut found: BTreeMap<MigrationId, Pending> = BTreeMap::new();

        for entry in entries {
            let path = entry
                .map_err(|e| WardenError::InvalidMigration(format!("cannot list migrations: {e}")))?
                .path();
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some((id, name, direction)) = parse_file_name(file_name) else {
                debug!(file = %path.display(), "Ignoring file in migrations directory");
                continue;
            };

            let sql = fs::read_to_string(&path).map_err(|e| {
                WardenError::InvalidMigration(format!("cannot read {}: {e}", path.display()))
            })?;
            let slot = found.entry(id.clone()).or_default();
            if !slot.name.is_empty() && slot.name != name {
                return Err(WardenError::InvalidMigration(format!(
                    "migration {id} has conflicting names '{}' and '{name}'",
                    slot.name
                )));
            }
            slot.name = name.to_string();
            let target = match direction {
                Direction::Up => &mut slot.up,
                Direction::Down => &mut slot.down,
            };
            if target.replace(sql).is_some() {
                return Err(WardenError::InvalidMigration(format!(
                    "migration {id} is defined more than once"
                )));
            }
        }

        let mut set = Self::new();
        for (id, pending) in found {
            let up = pending.up.ok_or_else(|| {
                WardenError::InvalidMigration(format!(
                    "migration {id} has a down file but no up file"
                ))
            })?;
            let mut migration = Migration::new(id.to_string(), pending.name, up)?;
            migration.down_sql = pending.down;
            set.register(migration)?;
        }
        Ok(set)
    }

    pub fn get(&self, id: &MigrationId) -> Option<&Migration> {
        self.migrations.iter().find(|m| &m.id == id)
    }

    pub fn bootstrap(&self) -> &Migration {
        &self.migrations[0]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Migration> {
        self.migrations.iter()
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }

    pub fn latest(&self) -> Option<&Migration> {
        self.migrations.last()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Up,
    Down,
}

fn parse_file_name(file_name: &str) -> Option<(MigrationId, &str, Direction)> {
    let (stem, direction) = if let Some(stem) = file_name.strip_suffix(".up.sql") {
        (stem, Direction::Up)
    } else if let Some(stem) = file_name.strip_suffix(".down.sql") {
        (stem, Direction::Down)
    } else {
        return None;
    };
    let (id, name) = stem.split_once('_')?;
    if name.is_empty() {
        return None;
    }
    Some((MigrationId::new(id).ok()?, name, direction))
}

/// Row of the ledger table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationRecord {
    pub id: MigrationId,
    pub name: String,
    pub executed_at: DateTime<Utc>,
}

/// Applied/pending state of one migration, as reported by `status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationStatusEntry {
    pub id: MigrationId,
    pub name: String,
    pub executed: bool,
    pub executed_at: Option<DateTime<Utc>>,
    /// The ledger has a row for this id but no migration is registered
    pub unknown: bool,
}

/// Outcome of a `run_pending` call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    /// Migrations this run applied, in order
    pub applied: Vec<MigrationId>,
    /// Migrations that were already in the ledger
    pub skipped: Vec<MigrationId>,
    /// Whether this run created the ledger table
    pub bootstrapped: bool,
}

impl MigrationReport {
    pub fn is_noop(&self) -> bool {
        self.applied.is_empty() && !self.bootstrapped
    }
}
