//! Process lifecycle owner
//!
//! A [`Warden`] owns the pool and every component built on it. Startup
//! connects, applies pending migrations and repairs schema drift once;
//! background tasks are started explicitly and stopped by [`Warden::shutdown`]
//! before the pool drains.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{error, info, warn};

use pgwarden_core::{HealthReport, PeriodicTask, WardenConfig, WardenResult};

use crate::backup::BackupCoordinator;
use crate::manager::{PostgresManager, PostgresPool};
use crate::migrations::{MigrationReport, MigrationRunner, MigrationSet, PostgresLedger};
use crate::pool::{ConnectionManager, Pool};
use crate::schema::{
    self, PostgresCatalog, RepairReport, SchemaManifest, SchemaRepairer, ValidationResult,
};

/// What [`Warden::start`] did
#[derive(Debug, Clone, Default)]
pub struct StartupReport {
    pub migrations: MigrationReport,
    /// Present when a schema manifest is configured
    pub schema: Option<ValidationResult>,
    pub repair: Option<RepairReport>,
}

/// Warden over real PostgreSQL sessions
pub type PostgresWarden = Warden<PostgresManager>;

pub struct Warden<M: ConnectionManager> {
    config: WardenConfig,
    pool: Pool<M>,
    migrations: Arc<MigrationRunner>,
    schema: Option<Arc<SchemaRepairer>>,
    backups: Arc<BackupCoordinator>,
    tasks: Mutex<Vec<PeriodicTask>>,
    shut_down: AtomicBool,
}

impl Warden<PostgresManager> {
    /// Connect using migrations from `config.migrations_dir` (if it exists)
    /// and the configured schema manifest (if any).
    pub async fn connect(config: WardenConfig) -> WardenResult<Self> {
        let migrations = if config.migrations_dir.is_dir() {
            MigrationSet::from_dir(&config.migrations_dir)?
        } else {
            warn!(
                dir = %config.migrations_dir.display(),
                "Migrations directory not found; only the ledger bootstrap is registered"
            );
            MigrationSet::new()
        };
        Self::connect_with(config, migrations).await
    }

    /// Connect with an explicitly registered migration set
    pub async fn connect_with(config: WardenConfig, migrations: MigrationSet) -> WardenResult<Self> {
        let manifest = config
            .schema
            .manifest_path
            .as_ref()
            .map(SchemaManifest::from_file)
            .transpose()?;
        let backups = BackupCoordinator::from_config(&config)?;

        info!(
            database = %config.redacted_database_url(),
            profile = ?config.profile,
            migrations = migrations.len(),
            "Connecting pgwarden"
        );
        let pool = PostgresPool::from_config(&config).await?;

        let runner = MigrationRunner::new(Arc::new(PostgresLedger::new(pool.clone())), migrations);
        let repairer = manifest.map(|manifest| {
            SchemaRepairer::new(Arc::new(PostgresCatalog::new(pool.clone())), manifest)
        });
        Ok(Self::assemble(config, pool, runner, repairer, backups))
    }
}

impl<M: ConnectionManager> Warden<M> {
    /// Wire already-built components together
    pub fn assemble(
        config: WardenConfig,
        pool: Pool<M>,
        migrations: MigrationRunner,
        schema: Option<SchemaRepairer>,
        backups: BackupCoordinator,
    ) -> Self {
        Self {
            config,
            pool,
            migrations: Arc::new(migrations),
            schema: schema.map(Arc::new),
            backups: Arc::new(backups),
            tasks: Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Apply pending migrations, then validate and repair the schema once.
    ///
    /// A migration failure aborts startup.
    pub async fn start(&self) -> WardenResult<StartupReport> {
        let migrations = self.migrations.run_pending().await.inspect_err(|e| {
            error!(fatal = true, error = %e, "Startup aborted: migrations failed");
        })?;

        let mut report = StartupReport {
            migrations,
            ..Default::default()
        };
        if let Some(repairer) = &self.schema {
            let (result, repair) = schema::check_and_repair(repairer.as_ref()).await;
            report.schema = Some(result);
            report.repair = repair;
        }
        info!(
            applied = report.migrations.applied.len(),
            "pgwarden started"
        );
        Ok(report)
    }

    /// Start the schema monitor and automatic backups when their intervals
    /// are configured. Calling this again has no effect.
    pub fn start_background_tasks(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if !tasks.is_empty() || self.shut_down.load(Ordering::SeqCst) {
            return;
        }

        match (&self.schema, self.config.schema.check_interval) {
            (Some(repairer), Some(interval)) => {
                let maintenance: Arc<dyn schema::SchemaMaintenance> = repairer.clone();
                tasks.push(schema::start_monitoring(maintenance, interval));
            }
            (None, Some(_)) => {
                warn!("Schema check interval set without a manifest; monitor not started")
            }
            _ => {}
        }
        if let Some(interval) = self.config.backup.interval {
            tasks.push(self.backups.start_automatic_backups(interval));
        }
        info!(tasks = tasks.len(), "Background tasks started");
    }

    /// Stop background tasks, then drain and close the pool. Idempotent.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let tasks: Vec<PeriodicTask> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            let name = task.name().to_string();
            task.stop().await;
            info!(task = %name, "Background task stopped");
        }
        self.pool.shutdown().await;
    }

    pub async fn health_report(&self) -> HealthReport {
        self.pool.health_report().await
    }

    pub fn config(&self) -> &WardenConfig {
        &self.config
    }

    pub fn pool(&self) -> &Pool<M> {
        &self.pool
    }

    pub fn migrations(&self) -> &MigrationRunner {
        &self.migrations
    }

    pub fn schema(&self) -> Option<&SchemaRepairer> {
        self.schema.as_deref()
    }

    pub fn backups(&self) -> &Arc<BackupCoordinator> {
        &self.backups
    }

    pub fn background_task_count(&self) -> usize {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
