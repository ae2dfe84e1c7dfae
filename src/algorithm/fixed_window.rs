use crate::decision::{Decision, DenyReason};
use crate::error::AlgorithmError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One counter per window; the counter resets when the window rolls over.
///
/// Allows up to twice the limit across a window boundary. Use
/// [`SlidingWindowLog`](super::SlidingWindowLog) when that matters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedWindow {
    limit: u64,
    window: Duration,
    window_ms: u64,
}

/// Per-key counter and the start of its window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowState {
    /// Units admitted in the current window.
    pub count: u64,
    /// Epoch millis at which the current window opened.
    pub window_start_ms: u64,
}

impl WindowState {
    /// Empty window starting at `now_ms`.
    pub fn new(now_ms: u64) -> Self {
        Self { count: 0, window_start_ms: now_ms }
    }
}

impl FixedWindow {
    /// Create a counter admitting `limit` units per `window`.
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

    /// Window length.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Roll the window if it has ended, then count `cost` units if they fit.
    pub fn try_consume(&self, state: &mut WindowState, cost: u32, now_ms: u64) -> Decision {
        if now_ms.saturating_sub(state.window_start_ms) >= self.window_ms {
            state.count = 0;
            state.window_start_ms = now_ms;
        }

        let cost = u64::from(cost);
        let reset_at = state.window_start_ms.saturating_add(self.window_ms);

        if cost <= self.limit && state.count + cost <= self.limit {
            state.count += cost;
            return Decision::allow(self.limit, self.limit - state.count, reset_at);
        }

        // With a regressed clock `reset_at - now` could exceed one window.
        let wait = reset_at.saturating_sub(now_ms).min(self.window_ms);
        Decision::deny(
            DenyReason::RateLimited,
            self.limit,
            self.limit.saturating_sub(state.count),
            reset_at,
            Duration::from_millis(wait),
        )
    }
}
