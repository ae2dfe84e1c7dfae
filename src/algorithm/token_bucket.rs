use crate::decision::{Decision, DenyReason};
use crate::error::AlgorithmError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

// Absorbs float drift so a bucket refilled for exactly 1/R seconds holds a full token.
const EPSILON: f64 = 1e-9;

/// A Token Bucket limiter.
///
/// Holds up to `burst` tokens (defaults to `capacity`), refilled lazily at
/// `refill_per_sec`. New keys start with `capacity` tokens.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenBucket {
    capacity: u64,
    refill_per_sec: f64,
    burst: u64,
}

/// Per-key bucket state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketState {
    /// Tokens currently available (fractional).
    pub tokens: f64,
    /// Epoch millis of the last refill computation.
    pub last_refill_ms: u64,
}

impl TokenBucket {
    /// Create a bucket with `burst == capacity`.
    pub fn new(capacity: u64, refill_per_sec: f64) -> Result<Self, AlgorithmError> {
        Self::with_burst(capacity, refill_per_sec, capacity)
    }

    /// Create a bucket that may bank up to `burst` tokens while idle.
    pub fn with_burst(
        capacity: u64,
        refill_per_sec: f64,
        burst: u64,
    ) -> Result<Self, AlgorithmError> {
        if capacity == 0 {
            return Err(AlgorithmError::InvalidLimit { provided: capacity });
        }
        if !refill_per_sec.is_finite() || refill_per_sec <= 0.0 {
            return Err(AlgorithmError::InvalidRate { provided: refill_per_sec });
        }
        if burst < capacity {
            return Err(AlgorithmError::InvalidBurst { burst, capacity });
        }
        Ok(Self { capacity, refill_per_sec, burst })
    }

    /// Tokens a new key starts with, and the largest cost ever admitted.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Tokens added per second.
    pub fn refill_per_sec(&self) -> f64 {
        self.refill_per_sec
    }

    /// Maximum tokens the bucket can bank.
    pub fn burst(&self) -> u64 {
        self.burst
    }

    /// Time to refill an empty bucket to `burst`.
    pub fn idle_horizon(&self) -> Duration {
        Duration::from_secs_f64(self.burst as f64 / self.refill_per_sec)
    }

    pub(crate) fn initial_state(&self, now_ms: u64) -> BucketState {
        BucketState { tokens: self.capacity as f64, last_refill_ms: now_ms }
    }

    fn millis_until(&self, missing_tokens: f64) -> u64 {
        if missing_tokens <= 0.0 {
            return 0;
        }
        (missing_tokens / self.refill_per_sec * 1000.0).ceil() as u64
    }

    fn refill(&self, state: &mut BucketState, now_ms: u64) {
        // Clamped at zero: a clock that steps backwards never mints tokens.
        let elapsed_ms = now_ms.saturating_sub(state.last_refill_ms);
        let added = elapsed_ms as f64 / 1000.0 * self.refill_per_sec;
        state.tokens = (state.tokens + added).min(self.burst as f64);
        state.last_refill_ms = state.last_refill_ms.max(now_ms);
    }

    /// Refill, then take `cost` tokens if available.
    pub fn try_consume(&self, state: &mut BucketState, cost: u32, now_ms: u64) -> Decision {
        self.refill(state, now_ms);

        let cost_f = f64::from(cost);
        let remaining = (state.tokens + EPSILON).floor().min(self.capacity as f64) as u64;

        if u64::from(cost) > self.capacity {
            // Never satisfiable; nothing is consumed.
            let full = self.millis_until(self.capacity as f64 - state.tokens);
            tracing::debug!(cost, capacity = self.capacity, "token bucket: cost exceeds capacity");
            return Decision::deny(
                DenyReason::RateLimited,
                self.capacity,
                remaining,
                now_ms.saturating_add(full),
                Duration::from_millis(self.millis_until(self.capacity as f64)),
            );
        }

        if state.tokens + EPSILON >= cost_f {
            state.tokens = (state.tokens - cost_f).max(0.0);
            let remaining = (state.tokens + EPSILON).floor().min(self.capacity as f64) as u64;
            let reset_at = now_ms.saturating_add(self.millis_until(self.capacity as f64 - state.tokens));
            Decision::allow(self.capacity, remaining, reset_at)
        } else {
            let missing = cost_f - state.tokens;
            let wait = Duration::from_secs_f64(missing / self.refill_per_sec);
            let reset_at = now_ms.saturating_add(self.millis_until(self.capacity as f64 - state.tokens));
            Decision::deny(DenyReason::RateLimited, self.capacity, remaining, reset_at, wait)
        }
    }
}
