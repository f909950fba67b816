//! Pool state, statistics and health reports
//!
//! # Example
//!
//! ```rust
//! use pgwarden_core::health::{HealthReport, HealthStatus, PoolState, PoolStats};
//! use std::time::Duration;
//!
//! let stats = PoolStats {
//!     total: 4,
//!     idle: 1,
//!     in_use: 3,
//!     waiting: 0,
//!     max: 10,
//!     min: 2,
//!     state: PoolState::Connected,
//! };
//! let report = HealthReport::healthy(Duration::from_millis(3)).with_pool_stats(stats);
//! assert_eq!(report.status, HealthStatus::Healthy);
//! ```

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Health status levels for the managed database
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Database is fully operational
    Healthy,
    /// Reachable, but the pool is reconnecting or saturated
    Degraded,
    /// Database is not operational
    Unhealthy,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }

    /// Check if the database is operational (healthy or degraded)
    pub fn is_operational(&self) -> bool {
        !matches!(self, HealthStatus::Unhealthy)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Lifecycle state of the connection pool
///
/// ```text
/// Disconnected -> Connecting -> Connected <-> Degraded
///                                   |            |
///                                   +-> ShuttingDown -> Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolState {
    Disconnected,
    Connecting,
    Connected,
    /// A pool-level failure was observed; a bounded reconnect loop is running.
    Degraded,
    ShuttingDown,
    Closed,
}

impl PoolState {
    /// Whether `acquire` may hand out connections in this state.
    pub fn accepts_acquire(self) -> bool {
        matches!(self, PoolState::Connected)
    }

    /// Whether shutdown has begun.
    pub fn is_terminal(self) -> bool {
        matches!(self, PoolState::ShuttingDown | PoolState::Closed)
    }

    /// Legal transitions of the state machine.
    pub fn can_transition_to(self, next: PoolState) -> bool {
        use PoolState::*;
        match (self, next) {
            (Disconnected, Connecting) => true,
            (Connecting, Connected | Disconnected) => true,
            (Connected, Degraded) | (Degraded, Connected) => true,
            (Closed, _) => false,
            (ShuttingDown, Closed) => true,
            (ShuttingDown, _) => false,
            (_, ShuttingDown) => true,
            _ => false,
        }
    }
}

impl fmt::Display for PoolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PoolState::Disconnected => "disconnected",
            PoolState::Connecting => "connecting",
            PoolState::Connected => "connected",
            PoolState::Degraded => "degraded",
            PoolState::ShuttingDown => "shutting_down",
            PoolState::Closed => "closed",
        };
        f.write_str(label)
    }
}

/// Point-in-time pool statistics. Recomputed on every call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Live sessions, idle plus in use (plus any being opened)
    pub total: usize,
    pub idle: usize,
    pub in_use: usize,
    /// Callers currently blocked in `acquire`
    pub waiting: usize,
    pub max: usize,
    pub min: usize,
    pub state: PoolState,
}

impl PoolStats {
    /// Share of the maximum that is checked out (0.0-1.0)
    pub fn utilization(&self) -> f64 {
        if self.max == 0 {
            0.0
        } else {
            self.in_use as f64 / self.max as f64
        }
    }

    pub fn is_at_capacity(&self) -> bool {
        self.in_use >= self.max
    }
}

/// Result of a health probe against the database
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub checked_at: DateTime<Utc>,
    #[serde(with = "duration_ms")]
    pub check_duration: Duration,
    pub message: Option<String>,
    pub pool: Option<PoolStats>,
    pub server_version: Option<String>,
}

impl HealthReport {
    fn new(status: HealthStatus, check_duration: Duration) -> Self {
        Self {
            status,
            checked_at: Utc::now(),
            check_duration,
            message: None,
            pool: None,
            server_version: None,
        }
    }

    pub fn healthy(check_duration: Duration) -> Self {
        Self::new(HealthStatus::Healthy, check_duration)
    }

    pub fn degraded(check_duration: Duration, message: impl Into<String>) -> Self {
        Self::new(HealthStatus::Degraded, check_duration).with_message(message)
    }

    pub fn unhealthy(check_duration: Duration, message: impl Into<String>) -> Self {
        Self::new(HealthStatus::Unhealthy, check_duration).with_message(message)
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_pool_stats(mut self, stats: PoolStats) -> Self {
        self.pool = Some(stats);
        self
    }

    pub fn with_server_version(mut self, version: impl Into<String>) -> Self {
        self.server_version = Some(version.into());
        self
    }
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_machine_transitions() {
        use PoolState::*;
        assert!(Disconnected.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Degraded));
        assert!(Degraded.can_transition_to(Connected));
        assert!(Degraded.can_transition_to(ShuttingDown));
        assert!(ShuttingDown.can_transition_to(Closed));

        assert!(!Closed.can_transition_to(Connected));
        assert!(!ShuttingDown.can_transition_to(Connected));
        assert!(!Disconnected.can_transition_to(Connected));
    }

    #[test]
    fn only_connected_accepts_acquire() {
        assert!(PoolState::Connected.accepts_acquire());
        assert!(!PoolState::Degraded.accepts_acquire());
        assert!(!PoolState::ShuttingDown.accepts_acquire());
    }

    #[test]
    fn utilization_uses_max() {
        let stats = PoolStats {
            total: 5,
            idle: 0,
            in_use: 5,
            waiting: 2,
            max: 10,
            min: 2,
            state: PoolState::Connected,
        };
        assert!((stats.utilization() - 0.5).abs() < f64::EPSILON);
        assert!(!stats.is_at_capacity());
    }

    #[test]
    fn report_serializes_duration_as_millis() {
        let report = HealthReport::degraded(Duration::from_millis(42), "reconnecting");
        let json = serde_json::to_value(&report).expect("serialize");
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["check_duration"], 42);
        assert_eq!(json["message"], "reconnecting");
    }
}
