//! RAII handle for a checked-out session

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tokio::sync::OwnedSemaphorePermit;

use pgwarden_core::{WardenError, WardenResult};

use super::manager::ConnectionManager;
use super::Shared;

/// Exclusive handle to one physical session.
///
/// Dropping the handle returns the session to the pool. Sessions that were
/// marked broken, that still have a transaction open, or that come back after
/// shutdown began are closed instead of recycled.
pub struct PooledConnection<M: ConnectionManager> {
    conn: Option<M::Connection>,
    shared: Arc<Shared<M>>,
    _permit: OwnedSemaphorePermit,
    pub(crate) in_transaction: bool,
    broken: bool,
}

impl<M: ConnectionManager> PooledConnection<M> {
    pub(crate) fn new(
        conn: M::Connection,
        shared: Arc<Shared<M>>,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        Self {
            conn: Some(conn),
            shared,
            _permit: permit,
            in_transaction: false,
            broken: false,
        }
    }

    /// Flag the session as unusable so it is closed on release.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    pub fn is_broken(&self) -> bool {
        self.broken
            || self
                .conn
                .as_ref()
                .is_some_and(|conn| self.shared.manager.has_broken(conn))
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    /// Run statements without results on this session. A connection-level
    /// failure marks the session broken.
    pub async fn execute_batch(&mut self, sql: &str) -> WardenResult<()> {
        let Some(conn) = self.conn.as_mut() else {
            return Err(WardenError::PoolClosed);
        };
        let result = self.shared.manager.execute_batch(conn, sql).await;
        if let Err(e) = &result
            && e.is_connection_error()
        {
            self.broken = true;
        }
        result
    }
}

impl<M: ConnectionManager> Deref for PooledConnection<M> {
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        // The session is only taken out in Drop.
        self.conn
            .as_ref()
            .expect("BUG: pooled connection used after release")
    }
}

impl<M: ConnectionManager> DerefMut for PooledConnection<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn
            .as_mut()
            .expect("BUG: pooled connection used after release")
    }
}

impl<M: ConnectionManager> Drop for PooledConnection<M> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let broken = self.broken || self.shared.manager.has_broken(&conn);
            self.shared.check_in(conn, broken, self.in_transaction);
        }
    }
}

impl<M: ConnectionManager> std::fmt::Debug for PooledConnection<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("in_transaction", &self.in_transaction)
            .field("broken", &self.broken)
            .finish_non_exhaustive()
    }
}
