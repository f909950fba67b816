//! # pgwarden-postgres
//!
//! PostgreSQL lifecycle management built on `tokio-postgres`:
//!
//! - [`pool`]: bounded connection pool with health checks, transactions,
//!   automatic reconnection and graceful drain
//! - [`migrations`]: ordered, exactly-once migrations tracked in a ledger table
//! - [`schema`]: drift detection against a manifest and additive repair
//! - [`backup`]: `pg_dump` / `psql` backups with retention
//! - [`Warden`]: owns all of the above for one process
//!
//! Every database-facing component sits behind a trait
//! ([`ConnectionManager`], [`MigrationLedger`], [`SchemaCatalog`],
//! [`ExternalTool`]) so it can be exercised without a server.

pub mod backup;
pub mod config;
pub mod error;
pub mod manager;
pub mod migrations;
pub mod pool;
pub mod schema;
pub mod warden;

pub use backup::{BackupCoordinator, BackupRecord, ExternalTool, ProcessTool, ToolOutput};
pub use config::PostgresConfig;
pub use error::pg_error;
pub use manager::{PostgresManager, PostgresPool};
pub use migrations::{
    Migration, MigrationLedger, MigrationReport, MigrationRunner, MigrationSet,
    MigrationStatusEntry, PostgresLedger,
};
pub use pool::{ConnectionManager, Pool, PooledConnection, Transaction};
pub use schema::{
    PostgresCatalog, RepairReport, SchemaCatalog, SchemaManifest, SchemaRepairer, TableSpec,
    ValidationResult,
};
pub use warden::{PostgresWarden, StartupReport, Warden};
