//! Monotonic time as seen by the driving event loop.
//!
//! No component in this workspace reads a clock on its own. The event loop
//! samples whatever clock it has (a real `Instant` in the daemon, a plain
//! counter in tests) and passes a `MonotonicTime` into every `tick`/`poll`.
//! That keeps every deadline in the stack reproducible.

use std::fmt;
use std::time::Duration;

/// Milliseconds since an arbitrary, per-process epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MonotonicTime(u64);

impl MonotonicTime {
    pub const ZERO: MonotonicTime = MonotonicTime(0);

    pub const fn from_millis(ms: u64) -> Self {
        Self(ms)
    }

    pub const fn as_millis(self) -> u64 {
        self.0
    }

    /// `self + d`, clamped at the far future instead of wrapping.
    pub fn saturating_add(self, d: Duration) -> Self {
        let ms = u64::try_from(d.as_millis()).unwrap_or(u64::MAX);
        Self(self.0.saturating_add(ms))
    }

    /// Time elapsed since `earlier`, zero if `earlier` is in the future.
    pub fn saturating_duration_since(self, earlier: MonotonicTime) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }

    /// True once `self` is strictly past `deadline`.
    pub fn is_past(self, deadline: MonotonicTime) -> bool {
        self > deadline
    }
}

impl fmt::Display for MonotonicTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}
