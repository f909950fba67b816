//! Point-in-time logical backups
//!
//! [`BackupCoordinator`] drives `pg_dump` and `psql` through the
//! [`ExternalTool`] seam and keeps each backup as a `<name>.sql` +
//! `<name>.json` pair in a [`BackupStore`] directory.

mod coordinator;
mod store;
mod tool;

pub use coordinator::BackupCoordinator;
pub use store::{BackupMetadata, BackupRecord, BackupStore};
pub use tool::{ExternalTool, ProcessTool, ToolOutput};
