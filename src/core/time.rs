//! Wall-clock utilities.
//!
//! Create and modify times on variables are informational wall-clock
//! nanoseconds; they never order writes. Ordering comes from log indexes and
//! lock expiry runs on the Tokio timer, so the only wall-clock reader in the
//! crate is the [`Clock`] used to stamp metadata.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Source of wall-clock timestamps in Unix nanoseconds.
pub trait Clock: Send + Sync {
    /// Current time as nanoseconds since the Unix epoch.
    fn now_unix_nanos(&self) -> i64;
}

/// Clock backed by the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix_nanos(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
            .unwrap_or_default()
    }
}

/// Manually driven clock for tests and replay.
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicI64,
}

impl ManualClock {
    /// Create a clock frozen at the given instant.
    pub fn new(nanos: i64) -> Self {
        Self {
            nanos: AtomicI64::new(nanos),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let delta = i64::try_from(by.as_nanos()).unwrap_or(i64::MAX);
        self.nanos.fetch_add(delta, Ordering::AcqRel);
    }

    /// Set the clock to an absolute value.
    pub fn set(&self, nanos: i64) {
        self.nanos.store(nanos, Ordering::Release);
    }
}

impl Clock for ManualClock {
    fn now_unix_nanos(&self) -> i64 {
        self.nanos.load(Ordering::Acquire)
    }
}

/// Convert a millisecond setting into a [`Duration`].
pub const fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms)
}

/// Fallback horizon for deadlines that would overflow the timer.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Tokio deadline `after` from now, clamped to [`FAR_FUTURE`].
pub fn deadline_after(after: Duration) -> tokio::time::Instant {
    let now = tokio::time::Instant::now();
    now.checked_add(after.min(FAR_FUTURE))
        .unwrap_or_else(|| now + Duration::from_secs(86_400))
}
