//! Schema drift detection and repair
//!
//! A [`SchemaManifest`] lists the tables and columns the application needs.
//! [`SchemaRepairer`] compares it with the live catalog and issues additive,
//! idempotent DDL; [`start_monitoring`] runs that check on a schedule.

mod catalog;
mod manifest;
mod monitor;
mod repairer;

pub use catalog::{DdlStatement, PostgresCatalog, SchemaCatalog, quote_ident};
pub use manifest::{ColumnSpec, SchemaManifest, TableSpec};
pub use monitor::{check_and_repair, start_monitoring};
pub use repairer::{
    DEFAULT_SCHEMA, RepairFailure, RepairReport, SchemaMaintenance, SchemaRepairer,
    ValidationResult,
};
