//! Bounded connection pool with a reconnecting state machine
//!
//! The pool is generic over a [`ConnectionManager`] so the sizing, checkout
//! and recovery logic can be exercised without a live server.
//!
//! - At most `max_connections` sessions exist at any time (idle, in use, or
//!   being opened). The counter is reserved before a session is opened.
//! - Checkout is bounded by a semaphore with one permit per session slot.
//!   Waiting honours the acquire timeout.
//! - A failed connect or a lost session moves the pool to
//!   [`PoolState::Degraded`] and starts a bounded reconnect loop. While
//!   degraded, `acquire` fails fast with `ConnectionTimeout`.
//! - A maintenance tick prunes idle sessions beyond `min_connections`, tops the
//!   idle set back up to `min_connections`, and restarts an exhausted
//!   reconnect loop.

mod connection;
mod manager;
mod transaction;

pub use connection::PooledConnection;
pub use manager::ConnectionManager;
pub use transaction::Transaction;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{Notify, Semaphore};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use pgwarden_core::{
    HealthReport, PeriodicTask, PoolSettings, PoolState, PoolStats, WardenError, WardenResult,
};

/// Upper bound on how long `health_check` waits for a connection
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll period while waiting for an idle session to be returned
const RELEASE_POLL: Duration = Duration::from_millis(50);

struct IdleConnection<C> {
    conn: C,
    idle_since: Instant,
}

/// State shared between the pool handle, checked-out connections and the
/// background tasks.
pub(crate) struct Shared<M: ConnectionManager> {
    pub(crate) manager: M,
    settings: PoolSettings,
    idle: Mutex<VecDeque<IdleConnection<M::Connection>>>,
    slots: Arc<Semaphore>,
    /// Live sessions, including ones currently being opened
    total: AtomicUsize,
    in_use: AtomicUsize,
    waiting: AtomicUsize,
    state: Mutex<PoolState>,
    reconnecting: AtomicBool,
    shutdown_started: AtomicBool,
    released: Notify,
    maintenance: Mutex<Option<PeriodicTask>>,
}

/// Connection pool handle. Cloning is cheap and shares the same pool.
pub struct Pool<M: ConnectionManager> {
    shared: Arc<Shared<M>>,
}

impl<M: ConnectionManager> Clone for Pool<M> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<M: ConnectionManager> std::fmt::Debug for Pool<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool").field("stats", &self.stats()).finish()
    }
}

impl<M: ConnectionManager> Pool<M> {
    /// Establish connectivity and return a ready pool.
    ///
    /// Opens `min_connections` sessions (at least one), validating each with
    /// a round trip. Failure to open the first session is returned; later
    /// failures are logged and left to the maintenance tick.
    pub async fn connect(manager: M, settings: PoolSettings) -> WardenResult<Self> {
        let max = settings.max_connections.get();
        let shared = Arc::new(Shared {
            manager,
            idle: Mutex::new(VecDeque::with_capacity(max)),
            slots: Arc::new(Semaphore::new(max)),
            total: AtomicUsize::new(0),
            in_use: AtomicUsize::new(0),
            waiting: AtomicUsize::new(0),
            state: Mutex::new(PoolState::Disconnected),
            reconnecting: AtomicBool::new(false),
            shutdown_started: AtomicBool::new(false),
            released: Notify::new(),
            maintenance: Mutex::new(None),
            settings,
        });

        shared.transition(PoolState::Connecting);
        let warm = shared.settings.min_connections.max(1);
        for index in 0..warm {
            if !shared.try_reserve() {
                break;
            }
            let opened: WardenResult<M::Connection> = async {
                let mut conn = shared.open_session().await?;
                shared.manager.validate(&mut conn).await?;
                Ok(conn)
            }
            .await;

            match opened {
                Ok(conn) => shared.push_idle(conn),
                Err(e) if index == 0 => {
                    shared.release_reservation();
                    shared.transition(PoolState::Disconnected);
                    error!(error = %e, "Failed to establish initial database connection");
                    return Err(e);
                }
                Err(e) => {
                    shared.release_reservation();
                    warn!(
                        error = %e,
                        opened = index,
                        target = warm,
                        "Could not open all initial connections; maintenance will retry"
                    );
                    break;
                }
            }
        }

        shared.transition(PoolState::Connected);
        let pool = Self { shared };
        pool.start_maintenance();

        let stats = pool.stats();
        info!(
            idle = stats.idle,
            min = stats.min,
            max = stats.max,
            "Connection pool ready"
        );
        Ok(pool)
    }

    fn start_maintenance(&self) {
        let weak = Arc::downgrade(&self.shared);
        let task = PeriodicTask::spawn(
            "pool-maintenance",
            self.shared.settings.maintenance_interval,
            move || {
                let weak = weak.clone();
                async move {
                    if let Some(shared) = weak.upgrade() {
                        shared.maintain().await;
                    }
                }
            },
        );
        *self.shared.lock_maintenance() = Some(task);
    }

    /// Acquire a connection, waiting at most the configured acquire timeout.
    pub async fn acquire(&self) -> WardenResult<PooledConnection<M>> {
        self.acquire_timeout(self.shared.settings.acquire_timeout)
            .await
    }

    /// Acquire a connection, waiting at most `timeout`.
    pub async fn acquire_timeout(&self, timeout: Duration) -> WardenResult<PooledConnection<M>> {
        let started = Instant::now();
        let shared = &self.shared;

        match shared.state() {
            PoolState::Connected => {}
            PoolState::ShuttingDown | PoolState::Closed => return Err(WardenError::PoolClosed),
            state => {
                debug!(%state, "Rejecting acquire while pool is not connected");
                return Err(WardenError::ConnectionTimeout { waited_ms: 0 });
            }
        }

        let permit = {
            let _waiting = WaitGuard::enter(&shared.waiting);
            match tokio::time::timeout(timeout, Arc::clone(&shared.slots).acquire_owned()).await {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return Err(WardenError::PoolClosed),
                Err(_) => {
                    let waited_ms = elapsed_ms(started);
                    warn!(waited_ms, "Timed out waiting for a pooled connection");
                    return Err(WardenError::ConnectionTimeout { waited_ms });
                }
            }
        };

        let deadline = started + timeout;
        loop {
            if shared.state().is_terminal() {
                return Err(WardenError::PoolClosed);
            }
            if let Some(conn) = shared.take_idle() {
                return Ok(shared.checkout(conn, permit));
            }
            if shared.try_reserve() {
                return match shared.open_session().await {
                    Ok(conn) => Ok(shared.checkout(conn, permit)),
                    Err(e) => {
                        shared.release_reservation();
                        warn!(error = %e, "Failed to open a new database connection");
                        shared.on_pool_error();
                        Err(WardenError::ConnectionTimeout {
                            waited_ms: elapsed_ms(started),
                        })
                    }
                };
            }

            // Every slot is held by a session that is idle-in-flight or being
            // opened by maintenance; wait for one to come back.
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(WardenError::ConnectionTimeout {
                    waited_ms: elapsed_ms(started),
                });
            }
            let _ = tokio::time::timeout(remaining.min(RELEASE_POLL), shared.released.notified())
                .await;
        }
    }

    /// Return a connection to the pool. Equivalent to dropping it.
    pub fn release(&self, conn: PooledConnection<M>) {
        drop(conn);
    }

    /// Acquire a connection and open a transaction on it.
    pub async fn begin(&self) -> WardenResult<Transaction<M>> {
        let conn = self.acquire().await?;
        Transaction::begin(conn).await
    }

    /// Run `f` inside a transaction.
    ///
    /// Commits when `f` succeeds, rolls back and returns the error when it
    /// fails. The connection is released on every path; if the returned
    /// future is dropped mid-transaction the session is closed.
    ///
    /// ```rust,ignore
    /// let count = pool
    ///     .transaction(|tx| {
    ///         Box::pin(async move {
    ///             tx.execute("INSERT INTO audit (event) VALUES ('x')", &[])
    ///                 .await
    ///                 .map_err(pg_error)
    ///         })
    ///     })
    ///     .await?;
    /// ```
    pub async fn transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: for<'t> FnOnce(&'t mut Transaction<M>) -> BoxFuture<'t, Result<T, E>>,
        E: From<WardenError>,
    {
        let mut tx = self.begin().await?;
        match f(&mut tx).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "Rollback failed; session will be discarded");
                }
                Err(err)
            }
        }
    }

    /// Acquire a short-lived connection and issue a trivial round trip.
    pub async fn health_check(&self) -> bool {
        let timeout = self
            .shared
            .settings
            .acquire_timeout
            .min(HEALTH_CHECK_TIMEOUT);
        let mut conn = match self.acquire_timeout(timeout).await {
            Ok(conn) => conn,
            Err(e) => {
                debug!(error = %e, "Health check could not acquire a connection");
                return false;
            }
        };
        match self.shared.manager.validate(&mut conn).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Health check round trip failed");
                if e.is_connection_error() {
                    conn.mark_broken();
                }
                false
            }
        }
    }

    /// Probe the database and summarise pool health.
    pub async fn health_report(&self) -> HealthReport {
        let started = std::time::Instant::now();
        let state = self.shared.state();
        let timeout = self
            .shared
            .settings
            .acquire_timeout
            .min(HEALTH_CHECK_TIMEOUT);

        let probe: WardenResult<Option<String>> = async {
            let mut conn = self.acquire_timeout(timeout).await?;
            if let Err(e) = self.shared.manager.validate(&mut conn).await {
                if e.is_connection_error() {
                    conn.mark_broken();
                }
                return Err(e);
            }
            Ok(self.shared.manager.server_version(&mut conn).await)
        }
        .await;

        let elapsed = started.elapsed();
        let stats = self.stats();
        let report = match probe {
            Ok(version) => {
                let report = if stats.is_at_capacity() {
                    HealthReport::degraded(elapsed, "all connections are in use")
                } else {
                    HealthReport::healthy(elapsed)
                };
                match version {
                    Some(version) => report.with_server_version(version),
                    None => report,
                }
            }
            Err(e) => match state {
                PoolState::Degraded => {
                    HealthReport::degraded(elapsed, format!("pool is reconnecting: {e}"))
                }
                _ => HealthReport::unhealthy(elapsed, e.to_string()),
            },
        };
        report.with_pool_stats(stats)
    }

    /// Current pool statistics, recomputed on every call.
    pub fn stats(&self) -> PoolStats {
        let shared = &self.shared;
        let idle = shared.lock_idle().len();
        PoolStats {
            total: shared.total.load(Ordering::SeqCst),
            idle,
            in_use: shared.in_use.load(Ordering::SeqCst),
            waiting: shared.waiting.load(Ordering::SeqCst),
            max: shared.settings.max_connections.get(),
            min: shared.settings.min_connections,
            state: shared.state(),
        }
    }

    pub fn state(&self) -> PoolState {
        self.shared.state()
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.shared.settings
    }

    pub fn manager(&self) -> &M {
        &self.shared.manager
    }

    /// Stop accepting acquisitions, drain in-flight connections (bounded by
    /// the drain timeout), close all sessions and stop maintenance.
    ///
    /// Idempotent: later calls return immediately.
    pub async fn shutdown(&self) {
        let shared = &self.shared;
        if shared.shutdown_started.swap(true, Ordering::SeqCst) {
            debug!("Pool shutdown already in progress or complete");
            return;
        }

        info!(in_use = shared.in_use.load(Ordering::SeqCst), "Shutting down connection pool");
        shared.transition(PoolState::ShuttingDown);
        shared.slots.close();

        let maintenance = shared.lock_maintenance().take();
        if let Some(task) = maintenance {
            task.stop().await;
        }

        let drain_timeout = shared.settings.drain_timeout;
        let drained = tokio::time::timeout(drain_timeout, async {
            while shared.in_use.load(Ordering::SeqCst) > 0 {
                let _ = tokio::time::timeout(RELEASE_POLL, shared.released.notified()).await;
            }
        })
        .await
        .is_ok();
        if !drained {
            warn!(
                in_use = shared.in_use.load(Ordering::SeqCst),
                drain_timeout_ms = drain_timeout.as_millis() as u64,
                "Drain timeout elapsed; remaining connections close when released"
            );
        }

        let closed: Vec<IdleConnection<M::Connection>> = shared.lock_idle().drain(..).collect();
        let count = closed.len();
        shared.total.fetch_sub(count, Ordering::SeqCst);
        drop(closed);

        shared.transition(PoolState::Closed);
        info!(closed = count, "Connection pool closed");
    }
}

impl<M: ConnectionManager> Shared<M> {
    fn lock_idle(&self) -> MutexGuard<'_, VecDeque<IdleConnection<M::Connection>>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_maintenance(&self) -> MutexGuard<'_, Option<PeriodicTask>> {
        self.maintenance
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn state(&self) -> PoolState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move to `next` if the state machine allows it.
    fn transition(&self, next: PoolState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let current = *state;
        if current == next || !current.can_transition_to(next) {
            return false;
        }
        *state = next;
        drop(state);
        info!(from = %current, to = %next, "Pool state changed");
        true
    }

    /// Claim room for one more live session.
    fn try_reserve(&self) -> bool {
        let max = self.settings.max_connections.get();
        self.total
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |total| {
                (total < max).then_some(total + 1)
            })
            .is_ok()
    }

    fn release_reservation(&self) {
        self.total.fetch_sub(1, Ordering::SeqCst);
    }

    async fn open_session(&self) -> WardenResult<M::Connection> {
        let timeout = self.settings.connect_timeout;
        match tokio::time::timeout(timeout, self.manager.connect()).await {
            Ok(result) => result,
            Err(_) => Err(WardenError::ConnectionLost {
                reason: format!("connect timed out after {}ms", timeout.as_millis()),
            }),
        }
    }

    fn push_idle(&self, conn: M::Connection) {
        self.lock_idle().push_back(IdleConnection {
            conn,
            idle_since: Instant::now(),
        });
        self.released.notify_waiters();
    }

    /// Pop the most recently used idle session, closing broken ones.
    fn take_idle(&self) -> Option<M::Connection> {
        let mut broken = Vec::new();
        let found = {
            let mut idle = self.lock_idle();
            loop {
                match idle.pop_back() {
                    Some(entry) if self.manager.has_broken(&entry.conn) => broken.push(entry.conn),
                    Some(entry) => break Some(entry.conn),
                    None => break None,
                }
            }
        };
        if !broken.is_empty() {
            debug!(count = broken.len(), "Discarding broken idle connections");
            self.total.fetch_sub(broken.len(), Ordering::SeqCst);
        }
        found
    }

    fn checkout(
        self: &Arc<Self>,
        conn: M::Connection,
        permit: tokio::sync::OwnedSemaphorePermit,
    ) -> PooledConnection<M> {
        self.in_use.fetch_add(1, Ordering::SeqCst);
        PooledConnection::new(conn, Arc::clone(self), permit)
    }

    /// Return path from [`PooledConnection`]'s `Drop`.
    pub(crate) fn check_in(self: &Arc<Self>, conn: M::Connection, broken: bool, in_transaction: bool) {
        self.in_use.fetch_sub(1, Ordering::SeqCst);
        let shutting_down = self.shutdown_started.load(Ordering::SeqCst);

        if broken || in_transaction || shutting_down {
            drop(conn);
            self.total.fetch_sub(1, Ordering::SeqCst);
            if in_transaction && !broken {
                warn!("Connection released with an open transaction; closing session");
            }
            if broken && !shutting_down {
                warn!("Discarding broken connection");
                self.on_pool_error();
            }
        } else {
            self.lock_idle().push_back(IdleConnection {
                conn,
                idle_since: Instant::now(),
            });
        }
        self.released.notify_waiters();
    }

    /// A pool-level failure: degrade and start reconnecting.
    fn on_pool_error(self: &Arc<Self>) {
        if self.transition(PoolState::Degraded) {
            let stale: Vec<M::Connection> = {
                let mut idle = self.lock_idle();
                let (keep, stale): (VecDeque<_>, VecDeque<_>) = idle
                    .drain(..)
                    .partition(|entry| !self.manager.has_broken(&entry.conn));
                *idle = keep;
                stale.into_iter().map(|entry| entry.conn).collect()
            };
            if !stale.is_empty() {
                self.total.fetch_sub(stale.len(), Ordering::SeqCst);
            }
        }
        if self.state() == PoolState::Degraded {
            self.spawn_reconnect();
        }
    }

    fn spawn_reconnect(self: &Arc<Self>) {
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        // Connections can be dropped outside a runtime; maintenance picks
        // the loop up again on its next tick.
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            self.reconnecting.store(false, Ordering::SeqCst);
            return;
        };
        let shared = Arc::clone(self);
        runtime.spawn(async move {
            shared.reconnect_loop().await;
            shared.reconnecting.store(false, Ordering::SeqCst);
        });
    }

    /// Bounded reconnect: attempt `n` waits `base_delay * n`.
    async fn reconnect_loop(&self) {
        let max_attempts = self.settings.reconnect_max_attempts;
        let base_delay = self.settings.reconnect_base_delay;

        for attempt in 1..=max_attempts {
            let delay = base_delay * attempt;
            warn!(
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                "Database connection degraded; scheduling reconnect"
            );
            tokio::time::sleep(delay).await;

            if self.state() != PoolState::Degraded {
                return;
            }
            if !self.try_reserve() {
                debug!(attempt, "Pool at capacity; skipping reconnect probe");
                continue;
            }

            let probe: WardenResult<M::Connection> = async {
                let mut conn = self.open_session().await?;
                self.manager.validate(&mut conn).await?;
                Ok(conn)
            }
            .await;

            match probe {
                Ok(conn) => {
                    self.push_idle(conn);
                    if self.transition(PoolState::Connected) {
                        info!(attempt, "Database connection restored");
                    }
                    return;
                }
                Err(e) => {
                    self.release_reservation();
                    warn!(attempt, max_attempts, error = %e, "Reconnect attempt failed");
                }
            }
        }

        error!(
            fatal = true,
            attempts = max_attempts,
            "Database reconnection attempts exhausted; pool remains degraded"
        );
    }

    /// One maintenance tick.
    async fn maintain(self: &Arc<Self>) {
        match self.state() {
            PoolState::Connected => {}
            PoolState::Degraded => {
                if !self.reconnecting.load(Ordering::SeqCst) {
                    info!("Restarting reconnect loop for degraded pool");
                    self.spawn_reconnect();
                }
                return;
            }
            _ => return,
        }

        self.prune_idle();
        self.top_up().await;
    }

    /// Close idle sessions past the idle timeout while above the minimum.
    fn prune_idle(&self) {
        let min = self.settings.min_connections;
        let idle_timeout = self.settings.idle_timeout;

        let expired: Vec<M::Connection> = {
            let mut idle = self.lock_idle();
            let mut expired = Vec::new();
            while let Some(front) = idle.front() {
                let live = self.total.load(Ordering::SeqCst);
                let stale = front.idle_since.elapsed() >= idle_timeout;
                if live <= min || !stale {
                    break;
                }
                if let Some(entry) = idle.pop_front() {
                    self.total.fetch_sub(1, Ordering::SeqCst);
                    expired.push(entry.conn);
                }
            }
            expired
        };

        if !expired.is_empty() {
            debug!(pruned = expired.len(), "Pruned idle connections");
        }
    }

    /// Open sessions until `min_connections` are live.
    async fn top_up(self: &Arc<Self>) {
        let min = self.settings.min_connections;
        while self.total.load(Ordering::SeqCst) < min && self.state() == PoolState::Connected {
            if !self.try_reserve() {
                break;
            }
            match self.open_session().await {
                Ok(conn) => self.push_idle(conn),
                Err(e) => {
                    self.release_reservation();
                    warn!(error = %e, "Failed to top up idle connections");
                    self.on_pool_error();
                    break;
                }
            }
        }
    }
}

struct WaitGuard<'a>(&'a AtomicUsize);

impl<'a> WaitGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}
