//! Transactional handle over a pooled connection

use std::ops::{Deref, DerefMut};

use pgwarden_core::WardenResult;

use super::connection::PooledConnection;
use super::manager::ConnectionManager;

/// A pooled connection with an open transaction.
///
/// Finish it with [`commit`](Self::commit) or [`rollback`](Self::rollback).
/// Dropping it unfinished closes the underlying session instead of returning
/// a connection with a dangling transaction to the pool.
pub struct Transaction<M: ConnectionManager> {
    conn: PooledConnection<M>,
}

impl<M: ConnectionManager> Transaction<M> {
    pub(crate) async fn begin(mut conn: PooledConnection<M>) -> WardenResult<Self> {
        // Set before sending: a cancelled BEGIN may still have reached the server.
        conn.in_transaction = true;
        conn.execute_batch("BEGIN").await?;
        Ok(Self { conn })
    }

    /// Run statements without results inside the transaction.
    pub async fn execute_batch(&mut self, sql: &str) -> WardenResult<()> {
        self.conn.execute_batch(sql).await
    }

    pub async fn commit(mut self) -> WardenResult<()> {
        self.conn.execute_batch("COMMIT").await?;
        self.conn.in_transaction = false;
        Ok(())
    }

    pub async fn rollback(mut self) -> WardenResult<()> {
        self.conn.execute_batch("ROLLBACK").await?;
        self.conn.in_transaction = false;
        Ok(())
    }

    /// Flag the session as unusable so it is closed on release.
    pub fn mark_broken(&mut self) {
        self.conn.mark_broken();
    }
}

impl<M: ConnectionManager> Deref for Transaction<M> {
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl<M: ConnectionManager> DerefMut for Transaction<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn
    }
}
