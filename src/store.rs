//! Counter storage.
//!
//! - [`CounterStore`]: the seam the admission service talks to. One call
//!   reads, decides and writes a single key atomically.
//! - [`LocalStore`]: in-process map with per-key locks and TTL eviction.
//! - [`SharedStore`]: compare-and-swap interface to an external key-value
//!   store shared by several instances.
//! - [`WriteThroughStore`]: a [`LocalStore`] cache in front of a
//!   [`SharedStore`], falling back to the cache when the shared store is slow.

use crate::algorithm::{BucketState, LogState, WindowState};
use crate::decision::Decision;
use crate::error::StoreError;
use crate::key::PolicyKey;
use crate::policy::Policy;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod local;
pub mod shared;

pub use local::LocalStore;
pub use shared::{InMemorySharedStore, SharedStore, Versioned, WriteThroughStore};

/// Per-key algorithm state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CounterState {
    /// Token bucket tokens and last refill.
    TokenBucket(BucketState),
    /// Sliding window admission log.
    SlidingLog(LogState),
    /// Fixed window count and start.
    FixedWindow(WindowState),
}

/// Storage for counter state.
///
/// Implementations must make `try_consume` atomic per key: two concurrent
/// calls for the same key observe a serial order, calls for different keys
/// never wait on each other.
#[async_trait]
pub trait CounterStore: Send + Sync + std::fmt::Debug {
    /// Apply `policy`'s algorithm to the state stored under `key`.
    async fn try_consume(
        &self,
        key: &PolicyKey,
        policy: &Policy,
        cost: u32,
        now_ms: u64,
    ) -> Result<Decision, StoreError>;

    /// Drop entries idle past their TTL. Returns how many were removed.
    async fn evict_expired(&self, now_ms: u64) -> usize;
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_state_json_is_tagged() {
        let state = CounterState::FixedWindow(WindowState { count: 2, window_start_ms: 1_000 });
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["kind"], "fixed_window");
        assert_eq!(json["count"], 2);
        let back: CounterState = serde_json::from_value(json).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn poisoned_lock_is_recovered() {
        let m = std::sync::Arc::new(Mutex::new(1));
        let m2 = m.clone();
        let _ = std::thread::spawn(move || {
            let _g = m2.lock().unwrap();
            panic!("poison");
        })
        .join();
        assert!(m.is_poisoned());
        assert_eq!(*lock(&m), 1);
    }
}
