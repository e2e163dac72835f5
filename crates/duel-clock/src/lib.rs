//! Injectable time source.
//!
//! The match runtime never reads wall-clock time directly; it goes through a
//! [`ClockSource`] so tests can drive ticks deterministically without
//! sleeping, the same seam the teacher's scheduler would need if its fixed
//! `tokio::time::interval` were made swappable.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// A source of monotonic tick-aligned time.
pub trait ClockSource: Send + Sync {
    /// Milliseconds elapsed since an arbitrary, implementation-defined epoch.
    fn now_millis(&self) -> u64;
}

/// Wall-clock source backed by [`Instant`].
pub struct SystemClock {
    origin: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemClock {
    /// Creates a clock whose epoch is the moment of construction.
    #[must_use]
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }

    /// Current Unix time in milliseconds, for stamping settlement payloads.
    ///
    /// `UNIX_EPOCH` is always in the past, so this never panics in practice;
    /// callers needing a hard guarantee should treat a `0` return as clock skew.
    #[must_use]
    pub fn unix_millis() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }
}

impl ClockSource for SystemClock {
    fn now_millis(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

/// Manually advanced clock, for deterministic tests.
#[derive(Default)]
pub struct ManualClock {
    millis: AtomicU64,
}

impl ManualClock {
    /// Creates a clock starting at `0`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Advances the clock by `delta_millis`.
    pub fn advance(&self, delta_millis: u64) {
        self.millis.fetch_add(delta_millis, Ordering::SeqCst);
    }

    /// Sets the clock to an absolute value.
    pub fn set(&self, millis: u64) {
        self.millis.store(millis, Ordering::SeqCst);
    }
}

impl ClockSource for ManualClock {
    fn now_millis(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }
}
