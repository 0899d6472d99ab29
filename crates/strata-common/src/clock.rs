//! Wall-clock sources for lease timestamps and expiry checks

use chrono::{DateTime, Utc};

/// Source of the current time used for lease timestamps
pub trait Clock: Send + Sync {
    /// Current UTC time
    fn now(&self) -> DateTime<Utc>;
}

/// The system wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Wall time anchored at construction and advanced by tokio's monotonic clock.
///
/// Unaffected by wall-clock jumps during a long-running command, and follows
/// paused tokio time in tests.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    anchor: DateTime<Utc>,
    origin: tokio::time::Instant,
}

impl MonotonicClock {
    /// Anchor a new clock at the current wall time
    pub fn new() -> Self {
        Self::anchored_at(Utc::now())
    }

    /// Anchor a new clock at the given wall time
    pub fn anchored_at(anchor: DateTime<Utc>) -> Self {
        Self {
            anchor,
            origin: tokio::time::Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = self.origin.elapsed();
        self.anchor + chrono::Duration::from_std(elapsed).unwrap_or(chrono::Duration::zero())
    }
}
