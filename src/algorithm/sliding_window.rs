use crate::decision::{Decision, DenyReason};
use crate::error::AlgorithmError;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

/// Exact rolling-window limiter: at most `limit` admissions in any span of
/// `window`, measured from each admitted request's timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlidingWindowLog {
    limit: u64,
    window: Duration,
    window_ms: u64,
}

/// One admitted request: when, and how many units it took.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Epoch millis of the admission.
    pub at_ms: u64,
    /// Units admitted at that instant.
    pub units: u64,
}

/// Admissions inside the current window, oldest first.
///
/// Requests admitted in the same millisecond share one entry, so the log
/// grows with request count, never with request cost.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogState {
    /// Admitted requests, oldest first.
    pub entries: VecDeque<LogEntry>,
    /// Sum of `units` over `entries`.
    pub units: u64,
}

impl LogState {
    /// Entries currently recorded.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing has been admitted inside the window.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Units admitted inside the window.
    pub fn units(&self) -> u64 {
        self.units
    }

    /// Most recent admission.
    pub fn last_admitted_ms(&self) -> Option<u64> {
        self.entries.back().map(|e| e.at_ms)
    }

    fn push(&mut self, at_ms: u64, units: u64) {
        match self.entries.back_mut() {
            Some(last) if last.at_ms == at_ms => last.units += units,
            _ => self.entries.push_back(LogEntry { at_ms, units }),
        }
        self.units += units;
    }
}

impl SlidingWindowLog {
    /// Create a log admitting `limit` units per `window`.
    pub fn new(limit: u64, window: Duration) -> Result<Self, AlgorithmError> {
        if limit == 0 {
            return Err(AlgorithmError::InvalidLimit { provided: limit });
        }
        let window_ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX);
        if window_ms == 0 {
            return Err(AlgorithmError::InvalidWindow(window));
        }
        Ok(Self { limit, window, window_ms })
    }

    /// Admissions allowed per window.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Rolling window length.
    pub fn window(&self) -> Duration {
        self.window
    }

    fn prune(&self, state: &mut LogState, now_ms: u64) {
        while let Some(front) = state.entries.front() {
            if now_ms.saturating_sub(front.at_ms) < self.window_ms {
                break;
            }
            state.units = state.units.saturating_sub(front.units);
            state.entries.pop_front();
        }
    }

    /// Drop expired entries, then admit `cost` units if the window has room.
    pub fn try_consume(&self, state: &mut LogState, cost: u32, now_ms: u64) -> Decision {
        self.prune(state, now_ms);

        let used = state.units();
        let cost = u64::from(cost);
        let reset_at = |state: &LogState| {
            state.entries.front().map_or(now_ms, |e| e.at_ms.saturating_add(self.window_ms))
        };

        if cost > self.limit {
            tracing::debug!(cost, limit = self.limit, "sliding window: cost exceeds limit");
            return Decision::deny(
                DenyReason::RateLimited,
                self.limit,
                self.limit.saturating_sub(used),
                reset_at(state),
                self.window,
            );
        }

        if used + cost <= self.limit {
            // Keep the log ordered even if the clock stepped backwards.
            let stamp = state.last_admitted_ms().map_or(now_ms, |last| last.max(now_ms));
            state.push(stamp, cost);
            return Decision::allow(self.limit, self.limit - used - cost, reset_at(state));
        }

        // The request fits once enough of the oldest units have aged out.
        let must_expire = used + cost - self.limit;
        let mut freed = 0;
        let retry_after = state
            .entries
            .iter()
            .find(|e| {
                freed += e.units;
                freed >= must_expire
            })
            .map(|e| e.at_ms.saturating_add(self.window_ms).saturating_sub(now_ms))
            .unwrap_or(self.window_ms);
        Decision::deny(
            DenyReason::RateLimited,
            self.limit,
            self.limit.saturating_sub(used),
            reset_at(state),
            Duration::from_millis(retry_after),
        )
    }
}
