//! Fake connection manager

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use pgwarden_core::{WardenError, WardenResult};
use pgwarden_postgres::ConnectionManager;

use crate::lock;

#[derive(Default)]
struct State {
    live: AtomicUsize,
    peak: AtomicUsize,
    connects: AtomicUsize,
    next_id: AtomicU64,
    down: AtomicBool,
    /// Connections opened before this generation count as broken
    broken_before: AtomicU64,
    failing_connects: AtomicUsize,
    connect_delay: Mutex<Option<Duration>>,
    execute_delays: Mutex<HashMap<String, Duration>>,
    statements: Mutex<Vec<String>>,
}

/// In-memory [`ConnectionManager`]. Clones share state, so a test can keep
/// a handle after moving one into a pool.
#[derive(Clone, Default)]
pub struct FakeManager {
    state: Arc<State>,
}

/// Session handed out by [`FakeManager`]
#[derive(Debug)]
pub struct FakeConnection {
    id: u64,
    state: Arc<State>,
}

impl FakeConnection {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for FakeConnection {
    fn drop(&mut self) {
        self.state.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("State")
            .field("live", &self.live.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl FakeManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `connect` fail (or succeed again)
    pub fn set_down(&self, down: bool) {
        self.state.down.store(down, Ordering::SeqCst);
    }

    /// Fail the next `count` connects, then recover
    pub fn fail_next_connects(&self, count: usize) {
        self.state.failing_connects.store(count, Ordering::SeqCst);
    }

    /// Sleep this long inside every `connect`
    pub fn set_connect_delay(&self, delay: Duration) {
        *lock(&self.state.connect_delay) = Some(delay);
    }

    /// Sleep this long after sending `sql`, as if the server were slow to
    /// answer. The statement is recorded before the wait.
    pub fn set_execute_delay(&self, sql: &str, delay: Duration) {
        lock(&self.state.execute_delays).insert(sql.to_string(), delay);
    }

    /// Mark every session opened so far as broken
    pub fn break_existing(&self) {
        let next = self.state.next_id.load(Ordering::SeqCst);
        self.state.broken_before.store(next, Ordering::SeqCst);
    }

    /// Sessions currently open
    pub fn live(&self) -> usize {
        self.state.live.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously open sessions
    pub fn peak(&self) -> usize {
        self.state.peak.load(Ordering::SeqCst)
    }

    /// `connect` calls so far, successful or not
    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Every batch executed, in order
    pub fn statements(&self) -> Vec<String> {
        lock(&self.state.statements).clone()
    }

    fn is_broken(&self, conn: &FakeConnection) -> bool {
        conn.id < self.state.broken_before.load(Ordering::SeqCst)
    }

    fn refuse(&self) -> bool {
        if self.state.down.load(Ordering::SeqCst) {
            return true;
        }
        self.state
            .failing_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ConnectionManager for FakeManager {
    type Connection = FakeConnection;

    async fn connect(&self) -> WardenResult<FakeConnection> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        let delay = *lock(&self.state.connect_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.refuse() {
            return Err(WardenError::ConnectionLost {
                reason: "connection refused".to_string(),
            });
        }

        let live = self.state.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.peak.fetch_max(live, Ordering::SeqCst);
        Ok(FakeConnection {
            id: self.state.next_id.fetch_add(1, Ordering::SeqCst),
            state: Arc::clone(&self.state),
        })
    }

    async fn validate(&self, conn: &mut FakeConnection) -> WardenResult<()> {
        if self.is_broken(conn) || self.state.down.load(Ordering::SeqCst) {
            return Err(WardenError::ConnectionLost {
                reason: "server closed the connection".to_string(),
            });
        }
        Ok(())
    }

    fn has_broken(&self, conn: &FakeConnection) -> bool {
        self.is_broken(conn)
    }

    async fn execute_batch(&self, conn: &mut FakeConnection, sql: &str) -> WardenResult<()> {
        if self.is_broken(conn) {
            return Err(WardenError::ConnectionLost {
                reason: "server closed the connection".to_string(),
            });
        }
        lock(&self.state.statements).push(sql.to_string());
        let delay = lock(&self.state.execute_delays).get(sql).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn server_version(&self, _conn: &mut FakeConnection) -> Option<String> {
        Some("16.0 (fake)".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tracks_live_and_peak() {
        let manager = FakeManager::new();
        let a = manager.connect().await.unwrap();
        let b = manager.connect().await.unwrap();
        assert_eq!((manager.live(), manager.peak()), (2, 2));
        drop(a);
        drop(b);
        assert_eq!((manager.live(), manager.peak()), (0, 2));
    }

    #[tokio::test]
    async fn break_existing_spares_new_sessions() {
        let manager = FakeManager::new();
        let mut old = manager.connect().await.unwrap();
        manager.break_existing();
        let mut new = manager.connect().await.unwrap();

        assert!(manager.has_broken(&old));
        assert!(manager.validate(&mut old).await.is_err());
        assert!(manager.validate(&mut new).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn execute_delay_applies_to_matching_statement_only() {
        let manager = FakeManager::new();
        manager.set_execute_delay("BEGIN", Duration::from_secs(5));
        let mut conn = manager.connect().await.unwrap();

        let quick = tokio::time::timeout(
            Duration::from_millis(10),
            manager.execute_batch(&mut conn, "SELECT 1"),
        )
        .await;
        assert!(quick.is_ok());

        let slow = tokio::time::timeout(
            Duration::from_millis(10),
            manager.execute_batch(&mut conn, "BEGIN"),
        )
        .await;
        assert!(slow.is_err());
        assert_eq!(manager.statements(), vec!["SELECT 1", "BEGIN"]);
    }

    #[tokio::test]
    async fn failing_connects_recover() {
        let manager = FakeManager::new();
        manager.fail_next_connects(2);
        assert!(manager.connect().await.is_err());
        assert!(manager.connect().await.is_err());
        assert!(manager.connect().await.is_ok());
        assert_eq!(manager.connects(), 3);
    }
}
