//! Connection factory seam used by [`Pool`](super::Pool)

use async_trait::async_trait;
use pgwarden_core::WardenResult;

/// Opens, validates and inspects physical database sessions.
///
/// The pool owns sizing, checkout and lifecycle; a manager only knows how to
/// talk to one session. [`PostgresManager`](crate::PostgresManager) is the
/// production implementation, and tests plug in in-memory fakes.
#[async_trait]
pub trait ConnectionManager: Send + Sync + 'static {
    type Connection: Send + 'static;

    /// Open and fully initialise a new session.
    async fn connect(&self) -> WardenResult<Self::Connection>;

    /// Issue a trivial round trip on `conn`.
    async fn validate(&self, conn: &mut Self::Connection) -> WardenResult<()>;

    /// Cheap, synchronous check whether `conn` is known to be unusable.
    fn has_broken(&self, conn: &Self::Connection) -> bool;

    /// Run one or more statements without results (`BEGIN`, `COMMIT`, DDL).
    async fn execute_batch(&self, conn: &mut Self::Connection, sql: &str) -> WardenResult<()>;

    /// Server version string for health reports.
    async fn server_version(&self, _conn: &mut Self::Connection) -> Option<String> {
        None
    }
}
