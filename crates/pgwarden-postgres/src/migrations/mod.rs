//! Versioned schema migrations
//!
//! Migrations are registered in a [`MigrationSet`], applied by a
//! [`MigrationRunner`], and recorded in a [`MigrationLedger`] (the
//! `schema_migrations` table for [`PostgresLedger`]).

mod definition;
mod ledger;
mod runner;

pub use definition::{
    BOOTSTRAP_MIGRATION_ID, LEDGER_TABLE, Migration, MigrationRecord, MigrationReport,
    MigrationSet, MigrationStatusEntry,
};
pub use ledger::{ApplyOutcome, MigrationLedger, PostgresLedger};
pub use runner::MigrationRunner;
