use super::{lock, CounterState, CounterStore};
use crate::decision::Decision;
use crate::error::StoreError;
use crate::key::PolicyKey;
use crate::policy::Policy;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug)]
struct Entry {
    state: CounterState,
    expires_at_ms: u64,
    // Set under the entry lock when the sweeper unlinks it; holders retry.
    evicted: bool,
}

/// In-process counter store.
///
/// Keys live in a sharded map; each entry has its own mutex, held only for
/// the duration of one algorithm step. The shard lock is released before the
/// entry lock is taken, so contention scales with hot keys, not key count.
#[derive(Debug, Default)]
pub struct LocalStore {
    entries: DashMap<PolicyKey, Arc<Mutex<Entry>>>,
    mutations: AtomicU64,
}

impl LocalStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no key is tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total algorithm steps applied since creation.
    pub fn mutations(&self) -> u64 {
        self.mutations.load(Ordering::Relaxed)
    }

    /// Copy of the state stored under `key`.
    pub fn get(&self, key: &PolicyKey) -> Option<CounterState> {
        let entry = self.entries.get(key).map(|e| e.value().clone())?;
        let guard = lock(&entry);
        (!guard.evicted).then(|| guard.state.clone())
    }

    fn entry(&self, key: &PolicyKey, policy: &Policy, now_ms: u64) -> Arc<Mutex<Entry>> {
        if let Some(existing) = self.entries.get(key) {
            return existing.value().clone();
        }
        self.entries
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(Mutex::new(Entry {
                    state: policy.algorithm.initial_state(now_ms),
                    expires_at_ms: now_ms,
                    evicted: false,
                }))
            })
            .value()
            .clone()
    }

    /// Run `f` on the state for `key` under its lock, refreshing the TTL.
    pub(crate) fn with_state<R>(
        &self,
        key: &PolicyKey,
        policy: &Policy,
        now_ms: u64,
        f: impl FnOnce(&mut CounterState) -> R,
    ) -> R {
        loop {
            let entry = self.entry(key, policy, now_ms);
            let mut guard = lock(&entry);
            if guard.evicted {
                continue;
            }
            guard.expires_at_ms = now_ms.saturating_add(ttl_millis(policy.idle_ttl()));
            self.mutations.fetch_add(1, Ordering::Relaxed);
            return f(&mut guard.state);
        }
    }

    /// Apply the policy's algorithm to `key` synchronously.
    pub fn consume(&self, key: &PolicyKey, policy: &Policy, cost: u32, now_ms: u64) -> Decision {
        self.with_state(key, policy, now_ms, |state| {
            policy.algorithm.try_consume(state, cost, now_ms)
        })
    }

    /// Overwrite the state for `key` with a value committed elsewhere.
    pub fn replace(&self, key: &PolicyKey, policy: &Policy, state: CounterState, now_ms: u64) {
        self.with_state(key, policy, now_ms, |slot| *slot = state);
    }

    /// Remove every entry whose TTL has passed.
    pub fn evict(&self, now_ms: u64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| {
            let mut guard = lock(entry);
            if guard.expires_at_ms <= now_ms {
                guard.evicted = true;
                false
            } else {
                true
            }
        });
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            tracing::debug!(removed, remaining = self.entries.len(), "evicted idle counters");
        }
        removed
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX)
}

#[async_trait]
impl CounterStore for LocalStore {
    async fn try_consume(
        &self,
        key: &PolicyKey,
        policy: &Policy,
        cost: u32,
        now_ms: u64,
    ) -> Result<Decision, StoreError> {
        Ok(self.consume(key, policy, cost, now_ms))
    }

    async fn evict_expired(&self, now_ms: u64) -> usize {
        self.evict(now_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::{FixedWindow, TokenBucket};
    use crate::key::Scope;
    use std::time::Duration;

    fn bucket_policy() -> Policy {
        Policy::new("ip", Scope::Ip, TokenBucket::new(3, 1.0).unwrap())
    }

    #[test]
    fn keys_are_independent() {
        let store = LocalStore::new();
        let policy = bucket_policy();
        let a = PolicyKey::new("ip", Scope::Ip, "1.1.1.1");
        let b = PolicyKey::new("ip", Scope::Ip, "2.2.2.2");
        for _ in 0..3 {
            assert!(store.consume(&a, &policy, 1, 0).allowed);
        }
        assert!(!store.consume(&a, &policy, 1, 0).allowed);
        assert!(store.consume(&b, &policy, 1, 0).allowed);
        assert_eq!(store.len(), 2);
        assert_eq!(store.mutations(), 5);
    }

    #[test]
    fn idle_keys_are_evicted_after_ttl() {
        let store = LocalStore::new();
        // Idle horizon 3s, default safety factor 2 => 6s TTL.
        let policy = bucket_policy();
        let key = PolicyKey::new("ip", Scope::Ip, "1.1.1.1");
        store.consume(&key, &policy, 1, 0);

        assert_eq!(store.evict(5_999), 0);
        assert_eq!(store.evict(6_000), 1);
        assert!(store.is_empty());
        assert!(store.get(&key).is_none());

        // A fresh entry starts full again.
        let d = store.consume(&key, &policy, 1, 6_000);
        assert_eq!(d.remaining, 2);
    }

    #[test]
    fn access_refreshes_ttl() {
        let store = LocalStore::new();
        let policy =
            Policy::new("w", Scope::Global, FixedWindow::new(10, Duration::from_secs(1)).unwrap());
        let key = PolicyKey::new("w", Scope::Global, "*");
        store.consume(&key, &policy, 1, 0);
        store.consume(&key, &policy, 1, 1_500);
        assert_eq!(store.evict(2_000), 0);
        assert_eq!(store.evict(3_500), 1);
    }

    #[test]
    fn replace_overwrites_state() {
        let store = LocalStore::new();
        let policy = bucket_policy();
        let key = PolicyKey::new("ip", Scope::Ip, "1.1.1.1");
        let drained = policy.algorithm.initial_state(0);
        let drained = match drained {
            CounterState::TokenBucket(mut s) => {
                s.tokens = 0.0;
                CounterState::TokenBucket(s)
            }
            other => other,
        };
        store.replace(&key, &policy, drained, 0);
        assert!(!store.consume(&key, &policy, 1, 0).allowed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_consumers_never_over_admit() {
        let store = Arc::new(LocalStore::new());
        let policy = Arc::new(Policy::new(
            "hot",
            Scope::Global,
            TokenBucket::new(50, 0.001).unwrap(),
        ));
        let key = PolicyKey::new("hot", Scope::Global, "*");
        let barrier = Arc::new(tokio::sync::Barrier::new(200));

        let handles = (0..200).map(|_| {
            let store = store.clone();
            let policy = policy.clone();
            let key = key.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                barrier.wait().await;
                store.try_consume(&key, &policy, 1, 0).await.unwrap().allowed
            })
        });
        let allowed = futures::future::join_all(handles)
            .await
            .into_iter()
            .filter(|r| *r.as_ref().unwrap())
            .count();
        assert_eq!(allowed, 50);
    }
}
