//! Clock abstractions used by every time-based decision in the crate.
//!
//! All admission math runs on milliseconds since the Unix epoch so that
//! `reset_at` values can be handed straight to callers as header values.
//! Implementations must never report a time earlier than one they already
//! reported; algorithms additionally clamp elapsed time to zero so a clock
//! that misbehaves can never grant free capacity.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Clock abstraction so timing can be faked in tests.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Milliseconds since the Unix epoch; non-decreasing across calls.
    fn now_millis(&self) -> u64;
}

/// Epoch-aligned monotonic clock.
///
/// Captures the wall clock once at construction and advances it with
/// `Instant`, so wall-clock jumps (NTP steps, manual changes) after startup do
/// not move admission time backwards.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    start: Instant,
    epoch_at_start: u64,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        let epoch_at_start = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0);
        Self { start: Instant::now(), epoch_at_start }
    }
}

impl Clock for MonotonicClock {
    fn now_millis(&self) -> u64 {
        let elapsed = u64::try_from(self.start.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.epoch_at_start.saturating_add(elapsed)
    }
}

/// Manually driven clock for deterministic tests and simulations.
///
/// Clones share the same underlying instant.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    /// Create a clock frozen at `start_millis`.
    pub fn new(start_millis: u64) -> Self {
        Self { now: Arc::new(AtomicU64::new(start_millis)) }
    }

    /// Move the clock forward by `millis`.
    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }

    /// Jump to an absolute instant. May move backwards.
    pub fn set(&self, millis: u64) {
        self.now.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}
