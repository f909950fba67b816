//! # pgwarden-core
//!
//! Backend-agnostic building blocks shared by every pgwarden crate:
//!
//! - [`error`]: the [`WardenError`] taxonomy and [`ConfigError`]
//! - [`config`]: environment-driven [`WardenConfig`] with profile defaults
//! - [`database`]: validated pool sizing
//! - [`identifiers`]: [`MigrationId`] and [`BackupName`]
//! - [`health`]: pool state machine, statistics and health reports
//! - [`task`]: cancellable [`PeriodicTask`] used by every background loop

pub mod config;
pub mod database;
pub mod error;
pub mod health;
pub mod identifiers;
pub mod task;

pub use config::{
    BackupSettings, PoolSettings, Profile, SchemaSettings, SslMode, WardenConfig,
    WardenConfigBuilder,
};
pub use database::{PoolSize, PoolSizeError};
pub use error::{ConfigError, WardenError, WardenResult};
pub use health::{HealthReport, HealthStatus, PoolState, PoolStats};
pub use identifiers::{BackupName, MigrationId};
pub use task::PeriodicTask;
