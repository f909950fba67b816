//! Validated pool sizing types
//!
//! Pool bounds are parsed once, at configuration time, so the pool itself
//! never has to re-check them.
//!
//! ```rust
//! use pgwarden_core::database::PoolSize;
//!
//! let size = PoolSize::new(20).expect("20 is valid");
//! assert_eq!(size.get(), 20);
//! assert!(PoolSize::new(0).is_none());
//! assert!(PoolSize::new(101).is_none());
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum connection count constrained to the range 1-100
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "usize", into = "usize")]
pub struct PoolSize(u8);

impl PoolSize {
    /// Minimum allowed pool size
    pub const MIN: u8 = 1;
    /// Maximum allowed pool size
    pub const MAX: u8 = 100;

    /// Create a pool size (1-100)
    ///
    /// Returns `None` if the size is 0 or greater than 100.
    pub const fn new(size: u8) -> Option<Self> {
        if size < Self::MIN || size > Self::MAX {
            None
        } else {
            Some(Self(size))
        }
    }

    /// Create a pool size from usize
    ///
    /// ```rust
    /// use pgwarden_core::database::PoolSize;
    ///
    /// assert!(PoolSize::from_usize(20).is_some());
    /// assert!(PoolSize::from_usize(1000).is_none());
    /// ```
    pub fn from_usize(size: usize) -> Option<Self> {
        if size > Self::MAX as usize || size < Self::MIN as usize {
            None
        } else {
            Some(Self(size as u8))
        }
    }

    /// Get the pool size as a usize
    pub const fn get(self) -> usize {
        self.0 as usize
    }

    /// Production default (20 connections)
    pub const fn production() -> Self {
        Self(20)
    }

    /// Development default (10 connections)
    pub const fn development() -> Self {
        Self(10)
    }

    /// Test default (5 connections)
    pub const fn test() -> Self {
        Self(5)
    }
}

impl Default for PoolSize {
    fn default() -> Self {
        Self::development()
    }
}

impl fmt::Display for PoolSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<usize> for PoolSize {
    type Error = PoolSizeError;

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        Self::from_usize(value).ok_or(PoolSizeError::OutOfRange {
            value,
            min: Self::MIN,
            max: Self::MAX,
        })
    }
}

impl From<PoolSize> for usize {
    fn from(size: PoolSize) -> Self {
        size.get()
    }
}

/// Error returned when a pool size is outside the accepted range
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolSizeError {
    #[error("pool size {value} is out of range ({min}-{max})")]
    OutOfRange { value: usize, min: u8, max: u8 },
}
