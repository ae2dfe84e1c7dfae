//! Rate limiting algorithms.
//!
//! Each algorithm is a pure decision function over a piece of [`CounterState`]:
//! given the state, a cost and the current time it mutates the state and
//! returns a [`Decision`]. Nothing here touches storage or locks; the
//! [`CounterStore`](crate::store::CounterStore) makes each call atomic per key.
//!
//! - [`TokenBucket`]: smooth long-run rate with bursts, lazy refill.
//! - [`SlidingWindowLog`]: exact rolling-window enforcement, O(limit) memory.
//! - [`FixedWindow`]: O(1) counter per window, accepts the boundary-doubling artifact.
//!
//! The algorithm is picked per policy when the policy set is loaded; the
//! [`Algorithm`] enum dispatches without any per-request branching in the service.

use crate::decision::Decision;
use crate::store::CounterState;
use std::fmt;
use std::time::Duration;

pub mod fixed_window;
pub mod sliding_window;
pub mod token_bucket;

pub use fixed_window::{FixedWindow, WindowState};
pub use sliding_window::{LogEntry, LogState, SlidingWindowLog};
pub use token_bucket::{BucketState, TokenBucket};

/// Discriminant of [`Algorithm`], for logs and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlgorithmKind {
    /// Token bucket.
    TokenBucket,
    /// Sliding window log.
    SlidingWindowLog,
    /// Fixed window counter.
    FixedWindow,
}

impl AlgorithmKind {
    /// Stable lowercase label.
    pub fn as_str(self) -> &'static str {
        match self {
            AlgorithmKind::TokenBucket => "token_bucket",
            AlgorithmKind::SlidingWindowLog => "sliding_window_log",
            AlgorithmKind::FixedWindow => "fixed_window",
        }
    }
}

impl fmt::Display for AlgorithmKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A configured algorithm instance.
#[derive(Debug, Clone, PartialEq)]
pub enum Algorithm {
    /// Token bucket.
    TokenBucket(TokenBucket),
    /// Sliding window log.
    SlidingWindowLog(SlidingWindowLog),
    /// Fixed window counter.
    FixedWindow(FixedWindow),
}

impl Algorithm {
    /// Which algorithm this is.
    pub fn kind(&self) -> AlgorithmKind {
        match self {
            Algorithm::TokenBucket(_) => AlgorithmKind::TokenBucket,
            Algorithm::SlidingWindowLog(_) => AlgorithmKind::SlidingWindowLog,
            Algorithm::FixedWindow(_) => AlgorithmKind::FixedWindow,
        }
    }

    /// Budget size reported as `X-RateLimit-Limit`.
    pub fn limit(&self) -> u64 {
        match self {
            Algorithm::TokenBucket(a) => a.capacity(),
            Algorithm::SlidingWindowLog(a) => a.limit(),
            Algorithm::FixedWindow(a) => a.limit(),
        }
    }

    /// How long a key must sit idle before its state is indistinguishable
    /// from a fresh one. Drives TTL eviction.
    pub fn idle_horizon(&self) -> Duration {
        match self {
            Algorithm::TokenBucket(a) => a.idle_horizon(),
            Algorithm::SlidingWindowLog(a) => a.window(),
            Algorithm::FixedWindow(a) => a.window(),
        }
    }

    /// Whether state can be shared exactly through a compare-and-swap store.
    /// The sliding log is kept per instance.
    pub fn is_distributable(&self) -> bool {
        !matches!(self, Algorithm::SlidingWindowLog(_))
    }

    /// Fresh state for a key first seen at `now_ms`.
    pub fn initial_state(&self, now_ms: u64) -> CounterState {
        match self {
            Algorithm::TokenBucket(a) => CounterState::TokenBucket(a.initial_state(now_ms)),
            Algorithm::SlidingWindowLog(_) => CounterState::SlidingLog(LogState::default()),
            Algorithm::FixedWindow(_) => CounterState::FixedWindow(WindowState::new(now_ms)),
        }
    }

    /// Whether `state` belongs to this algorithm.
    pub fn owns(&self, state: &CounterState) -> bool {
        matches!(
            (self, state),
            (Algorithm::TokenBucket(_), CounterState::TokenBucket(_))
                | (Algorithm::SlidingWindowLog(_), CounterState::SlidingLog(_))
                | (Algorithm::FixedWindow(_), CounterState::FixedWindow(_))
        )
    }

    /// Decide and mutate `state` in one step.
    ///
    /// State left behind by a different algorithm (the policy was reloaded
    /// with a new kind) is discarded and re-initialized first.
    pub fn try_consume(&self, state: &mut CounterState, cost: u32, now_ms: u64) -> Decision {
        if !self.owns(state) {
            *state = self.initial_state(now_ms);
        }
        match (self, state) {
            (Algorithm::TokenBucket(a), CounterState::TokenBucket(s)) => {
                a.try_consume(s, cost, now_ms)
            }
            (Algorithm::SlidingWindowLog(a), CounterState::SlidingLog(s)) => {
                a.try_consume(s, cost, now_ms)
            }
            (Algorithm::FixedWindow(a), CounterState::FixedWindow(s)) => {
                a.try_consume(s, cost, now_ms)
            }
            _ => unreachable!("counter state re-initialized to match its algorithm"),
        }
    }
}

impl From<TokenBucket> for Algorithm {
    fn from(a: TokenBucket) -> Self {
        Algorithm::TokenBucket(a)
    }
}

impl From<SlidingWindowLog> for Algorithm {
    fn from(a: SlidingWindowLog) -> Self {
        Algorithm::SlidingWindowLog(a)
    }
}

impl From<FixedWindow> for Algorithm {
    fn from(a: FixedWindow) -> Self {
        Algorithm::FixedWindow(a)
    }
}
