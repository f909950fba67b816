//! # pgwarden
//!
//! Database lifecycle manager for a single PostgreSQL instance. One process
//! owns one [`Pool`]; the [`MigrationRunner`], [`SchemaRepairer`] and
//! [`BackupCoordinator`] are wired to it by a [`Warden`].
//!
//! ## Quick Start
//!
//! ```no_run
//! use pgwarden::{PostgresWarden, WardenConfig};
//!
//! # async fn start() -> pgwarden::WardenResult<()> {
//! let config = WardenConfig::from_env()?;
//! let warden = PostgresWarden::connect(config).await?;
//!
//! // Apply pending migrations and repair schema drift once
//! let report = warden.start().await?;
//! println!("applied {} migration(s)", report.migrations.applied.len());
//!
//! // Schema monitor and automatic backups, when configured
//! warden.start_background_tasks();
//!
//! // ... serve traffic ...
//!
//! warden.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`pool`]: bounded connection pool, transactions, health
//! - [`migrations`]: ledger-tracked, ordered migrations
//! - [`schema`]: manifest, catalog, drift repair and monitor
//! - [`backup`]: `pg_dump` / `psql` backups and retention
//! - `testing` (feature `testing`): in-memory fakes of every seam

pub use pgwarden_postgres::{backup, migrations, pool, schema};

#[cfg(feature = "testing")]
pub use pgwarden_testing as testing;

pub use pgwarden_core::{
    BackupName, BackupSettings, ConfigError, HealthReport, HealthStatus, MigrationId,
    PeriodicTask, PoolSettings, PoolSize, PoolState, PoolStats, Profile, SchemaSettings, SslMode,
    WardenConfig, WardenConfigBuilder, WardenError, WardenResult,
};
pub use pgwarden_postgres::{
    BackupCoordinator, BackupRecord, ConnectionManager, ExternalTool, Migration,
    MigrationLedger, MigrationReport, MigrationRunner, MigrationSet, MigrationStatusEntry, Pool,
    PooledConnection, PostgresCatalog, PostgresConfig, PostgresLedger, PostgresManager,
    PostgresPool, PostgresWarden, ProcessTool, RepairReport, SchemaCatalog, SchemaManifest,
    SchemaRepairer, StartupReport, TableSpec, Transaction, ValidationResult, Warden,
};
