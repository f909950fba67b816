//! # pgwarden testing utilities
//!
//! In-memory implementations of every pgwarden seam, so pools, migration
//! runs, schema repair and backups can be exercised without PostgreSQL or
//! the `pg_dump` / `psql` executables.
//!
//! - [`FakeManager`]: sessions for [`Pool`](pgwarden_postgres::Pool), with
//!   outage and breakage switches
//! - [`InMemoryLedger`]: migration ledger that records executed SQL
//! - [`InMemoryCatalog`]: table/column catalog that applies repair DDL
//! - [`ScriptedTool`]: dump/restore against an in-memory key/value "database"

mod catalog;
mod ledger;
mod manager;
mod tool;

pub use catalog::InMemoryCatalog;
pub use ledger::InMemoryLedger;
pub use manager::{FakeConnection, FakeManager};
pub use tool::{Invocation, ScriptedTool};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock, recovering the data from a poisoned mutex
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
