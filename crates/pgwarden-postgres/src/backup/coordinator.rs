//! Logical backups through `pg_dump` and `psql`

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use pgwarden_core::{
    BackupName, BackupSettings, PeriodicTask, WardenConfig, WardenError, WardenResult,
};

use super::store::{BackupMetadata, BackupRecord, BackupStore};
use super::tool::{ExternalTool, ProcessTool};
use crate::config::PostgresConfig;

const MANUAL_PREFIX: &str = "backup";
const AUTOMATIC_PREFIX: &str = "auto";

/// Creates, lists, restores and deletes dumps of one database and runs the
/// retention-bounded automatic schedule.
///
/// Backups do not use the connection pool: the external tools open their
/// own sessions from the same connection parameters.
pub struct BackupCoordinator {
    target: PostgresConfig,
    settings: BackupSettings,
    store: BackupStore,
    tool: Arc<dyn ExternalTool>,
    // Serialises create and prune so retention never races a dump in progress
    gate: Mutex<()>,
}

impl BackupCoordinator {
    pub fn new(target: PostgresConfig, settings: BackupSettings, tool: Arc<dyn ExternalTool>) -> Self {
        let store = BackupStore::new(settings.directory.clone());
        Self {
            target,
            settings,
            store,
            tool,
            gate: Mutex::new(()),
        }
    }

    /// Coordinator for the configured database using the real executables
    pub fn from_config(config: &WardenConfig) -> WardenResult<Self> {
        let target = PostgresConfig::from_warden_config(config)?;
        Ok(Self::new(target, config.backup.clone(), Arc::new(ProcessTool)))
    }

    pub fn store(&self) -> &BackupStore {
        &self.store
    }

    pub fn settings(&self) -> &BackupSettings {
        &self.settings
    }

    /// Dump the database to `<dir>/<name>.sql` and record its sidecar.
    ///
    /// Without a name, `backup-<UTC timestamp>-<suffix>` is used. An
    /// existing name is refused rather than overwritten.
    pub async fn create_backup(&self, name: Option<BackupName>) -> WardenResult<BackupRecord> {
        let name = match name {
            Some(name) => name,
            None => generate_name(MANUAL_PREFIX, Utc::now())?,
        };
        let _gate = self.gate.lock().await;
        self.create_locked(name, false).await
    }

    async fn create_locked(&self, name: BackupName, automatic: bool) -> WardenResult<BackupRecord> {
        self.store.ensure_directory().await?;
        if self.store.exists(&name).await? {
            return Err(WardenError::BackupExists {
                name: name.to_string(),
            });
        }

        let data_path = self.store.data_path(&name);
        let started = Instant::now();
        // Snapshot time, taken before the dump starts.
        let timestamp = Utc::now();
        info!(backup = %name, automatic, "Creating backup");

        if let Err(e) = self.dump(&data_path).await {
            self.discard(&name).await;
            error!(backup = %name, error = %e, "Backup failed");
            return Err(e);
        }
        if !self.store.data_exists(&name).await? {
            self.discard(&name).await;
            return Err(WardenError::ExternalProcess {
                program: self.settings.pg_dump_program.clone(),
                exit_code: Some(0),
                stderr: format!("no dump was written to {}", data_path.display()),
            });
        }

        let result = async {
            let metadata = BackupMetadata {
                name: name.clone(),
                timestamp,
                database: self.target.database.clone(),
                size: self.store.data_size(&name).await?,
                automatic,
            };
            self.store.write_metadata(&metadata).await?;
            Ok::<_, WardenError>(metadata)
        }
        .await;

        match result {
            Ok(metadata) => {
                info!(
                    backup = %name,
                    size_bytes = metadata.size,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Backup created"
                );
                Ok(BackupRecord {
                    name: metadata.name,
                    timestamp: metadata.timestamp,
                    database: metadata.database,
                    size_bytes: metadata.size,
                    path: data_path,
                    automatic,
                })
            }
            Err(e) => {
                self.discard(&name).await;
                error!(backup = %name, error = %e, "Could not record backup metadata");
                Err(e)
            }
        }
    }

    async fn dump(&self, data_path: &Path) -> WardenResult<()> {
        let mut args = self.connection_args();
        args.extend(
            [
                "--format=plain",
                "--clean",
                "--if-exists",
                "--no-owner",
                "--no-privileges",
                "--file",
            ]
            .map(String::from),
        );
        args.push(data_path.to_string_lossy().into_owned());

        let program = &self.settings.pg_dump_program;
        self.tool
            .run(program, &args, &self.tool_env())
            .await?
            .check(program)?;
        Ok(())
    }

    async fn discard(&self, name: &BackupName) {
        if let Err(e) = self.store.remove(name).await {
            warn!(backup = %name, error = %e, "Could not remove partial backup");
        }
    }

    /// Replay `<name>.sql` into the database in a single transaction.
    ///
    /// No safety backup is taken first.
    pub async fn restore_backup(&self, name: &BackupName) -> WardenResult<()> {
        if !self.store.data_exists(name).await? {
            return Err(WardenError::BackupNotFound {
                name: name.to_string(),
            });
        }

        let mut args = self.connection_args();
        args.extend(
            [
                "--set",
                "ON_ERROR_STOP=1",
                "--single-transaction",
                "--quiet",
                "--file",
            ]
            .map(String::from),
        );
        args.push(self.store.data_path(name).to_string_lossy().into_owned());

        let started = Instant::now();
        warn!(backup = %name, database = %self.target.database, "Restoring backup");
        let program = &self.settings.psql_program;
        self.tool
            .run(program, &args, &self.tool_env())
            .await?
            .check(program)
            .inspect_err(|e| error!(backup = %name, error = %e, "Restore failed"))?;

        info!(
            backup = %name,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Backup restored"
        );
        Ok(())
    }

    /// Complete backups, newest first
    pub async fn list_backups(&self) -> WardenResult<Vec<BackupRecord>> {
        let mut records = self.store.list().await?;
        records.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then_with(|| b.name.cmp(&a.name))
        });
        Ok(records)
    }

    /// Remove both files of `name`. Either or both may already be absent,
    /// so deleting twice succeeds.
    pub async fn delete_backup(&self, name: &BackupName) -> WardenResult<()> {
        self.store.remove(name).await?;
        info!(backup = %name, "Backup deleted");
        Ok(())
    }

    /// One scheduled run: create an automatic backup, then prune old
    /// automatic backups beyond the retention limit.
    pub async fn run_automatic_backup(&self) -> WardenResult<BackupRecord> {
        let name = generate_name(AUTOMATIC_PREFIX, Utc::now())?;
        let _gate = self.gate.lock().await;
        let record = self.create_locked(name, true).await?;
        self.prune_locked().await?;
        Ok(record)
    }

    /// Delete automatic backups beyond the newest `retention`. Manual
    /// backups are never touched. Returns the names removed.
    pub async fn enforce_retention(&self) -> WardenResult<Vec<BackupName>> {
        let _gate = self.gate.lock().await;
        self.prune_locked().await
    }

    async fn prune_locked(&self) -> WardenResult<Vec<BackupName>> {
        let expired: Vec<BackupName> = self
            .list_backups()
            .await?
            .into_iter()
            .filter(|record| record.automatic)
            .skip(self.settings.retention)
            .map(|record| record.name)
            .collect();

        for name in &expired {
            self.store.remove(name).await?;
            info!(backup = %name, retention = self.settings.retention, "Pruned automatic backup");
        }
        Ok(expired)
    }

    /// Run [`run_automatic_backup`](Self::run_automatic_backup) every
    /// `interval`. Failures are logged and the schedule continues.
    pub fn start_automatic_backups(self: &Arc<Self>, interval: Duration) -> PeriodicTask {
        info!(
            interval_secs = interval.as_secs(),
            retention = self.settings.retention,
            "Starting automatic backups"
        );
        let coordinator = Arc::clone(self);
        PeriodicTask::spawn("automatic-backups", interval, move || {
            let coordinator = Arc::clone(&coordinator);
            async move {
                if let Err(e) = coordinator.run_automatic_backup().await {
                    error!(error = %e, "Automatic backup failed");
                }
            }
        })
    }

    fn connection_args(&self) -> Vec<String> {
        vec![
            "--host".to_string(),
            self.target.host.clone(),
            "--port".to_string(),
            self.target.port.to_string(),
            "--username".to_string(),
            self.target.user.clone(),
            "--dbname".to_string(),
            self.target.database.clone(),
        ]
    }

    fn tool_env(&self) -> Vec<(String, String)> {
        let mut env = vec![
            (
                "PGSSLMODE".to_string(),
                self.target.ssl_mode.as_libpq().to_string(),
            ),
            (
                "PGCONNECT_TIMEOUT".to_string(),
                self.target.connect_timeout.as_secs().max(1).to_string(),
            ),
        ];
        if let Some(password) = &self.target.password {
            env.push(("PGPASSWORD".to_string(), password.clone()));
        }
        env
    }
}

/// `<prefix>-<UTC timestamp>-<8 hex chars>`
fn generate_name(prefix: &str, at: DateTime<Utc>) -> WardenResult<BackupName> {
    let suffix = Uuid::new_v4().simple().to_string();
    BackupName::new(format!(
        "{prefix}-{}-{}",
        at.format("%Y%m%dT%H%M%S%3fZ"),
        &suffix[..8]
    ))
}
