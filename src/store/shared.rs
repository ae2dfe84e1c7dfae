use super::{lock, CounterState, CounterStore, LocalStore};
use crate::decision::Decision;
use crate::error::StoreError;
use crate::key::PolicyKey;
use crate::policy::Policy;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// Default latency budget for one shared-store round trip sequence.
pub const DEFAULT_SHARED_TIMEOUT: Duration = Duration::from_millis(5);
/// Default number of compare-and-swap attempts before falling back.
pub const DEFAULT_CAS_ATTEMPTS: usize = 3;

/// A stored value and the version it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned {
    /// Counter state.
    pub state: CounterState,
    /// Opaque, monotonically increasing version used for compare-and-swap.
    pub version: u64,
}

/// External key-value store shared by several service instances.
///
/// Only two primitives are needed: a versioned read and a conditional write.
#[async_trait]
pub trait SharedStore: Send + Sync + std::fmt::Debug {
    /// Fetch the current value for `key`.
    async fn load(&self, key: &str) -> Result<Option<Versioned>, StoreError>;

    /// Write `state` if the stored version still equals `expected`
    /// (`None` = key must not exist). Returns `Ok(false)` when another
    /// writer got there first.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        state: &CounterState,
        ttl: Duration,
    ) -> Result<bool, StoreError>;
}

#[derive(Debug)]
struct Slot {
    value: Versioned,
    expires_at: Instant,
}

/// In-memory [`SharedStore`], for tests and single-process setups.
#[derive(Debug, Default, Clone)]
pub struct InMemorySharedStore {
    data: Arc<Mutex<HashMap<String, Slot>>>,
}

impl InMemorySharedStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SharedStore for InMemorySharedStore {
    async fn load(&self, key: &str) -> Result<Option<Versioned>, StoreError> {
        let mut guard = lock(&self.data);
        let now = Instant::now();
        match guard.get(key) {
            Some(slot) if slot.expires_at <= now => {
                guard.remove(key);
                Ok(None)
            }
            Some(slot) => Ok(Some(slot.value.clone())),
            None => Ok(None),
        }
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        state: &CounterState,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut guard = lock(&self.data);
        let now = Instant::now();
        let current = guard.get(key).filter(|slot| slot.expires_at > now).map(|s| s.value.version);
        if current != expected {
            return Ok(false); // Race detected
        }
        let version = current.map_or(1, |v| v + 1);
        guard.insert(
            key.to_string(),
            Slot {
                value: Versioned { state: state.clone(), version },
                expires_at: now.checked_add(ttl).unwrap_or_else(far_future),
            },
        );
        Ok(true)
    }
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86_400 * 365)
}

/// Local cache in front of a [`SharedStore`].
///
/// Token bucket and fixed window state is read, decided and written back
/// with an optimistic compare-and-swap loop; the committed value is mirrored
/// into the local cache. When the shared store misses its latency budget or
/// keeps losing races the decision is made on the cached value instead
/// (instances may briefly over-admit; they never wait). Sliding window logs
/// are kept per instance.
#[derive(Debug)]
pub struct WriteThroughStore<S> {
    shared: S,
    local: LocalStore,
    timeout: Duration,
    max_attempts: usize,
}

impl<S: SharedStore> WriteThroughStore<S> {
    /// Wrap `shared` with default timeout and retry budget.
    pub fn new(shared: S) -> Self {
        Self {
            shared,
            local: LocalStore::new(),
            timeout: DEFAULT_SHARED_TIMEOUT,
            max_attempts: DEFAULT_CAS_ATTEMPTS,
        }
    }

    /// Latency budget for the whole shared read-decide-write sequence.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Compare-and-swap attempts before falling back to the cache (min 1).
    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// The local cache.
    pub fn local(&self) -> &LocalStore {
        &self.local
    }

    /// The shared backend.
    pub fn shared(&self) -> &S {
        &self.shared
    }

    async fn consume_shared(
        &self,
        key: &PolicyKey,
        storage_key: &str,
        policy: &Policy,
        cost: u32,
        now_ms: u64,
    ) -> Result<Decision, StoreError> {
        for _ in 0..self.max_attempts {
            let (mut state, expected) = match self.shared.load(storage_key).await? {
                Some(v) => (v.state, Some(v.version)),
                None => (policy.algorithm.initial_state(now_ms), None),
            };
            let decision = policy.algorithm.try_consume(&mut state, cost, now_ms);
            if decision.is_denied() {
                // Nothing was consumed; skip the write.
                self.local.replace(key, policy, state, now_ms);
                return Ok(decision);
            }
            if self
                .shared
                .compare_and_swap(storage_key, expected, &state, policy.idle_ttl())
                .await?
            {
                self.local.replace(key, policy, state, now_ms);
                return Ok(decision);
            }
            tracing::trace!(key = %storage_key, "shared store cas lost race; retrying");
        }
        Err(StoreError::Contention { attempts: self.max_attempts })
    }
}

#[async_trait]
impl<S: SharedStore> CounterStore for WriteThroughStore<S> {
    async fn try_consume(
        &self,
        key: &PolicyKey,
        policy: &Policy,
        cost: u32,
        now_ms: u64,
    ) -> Result<Decision, StoreError> {
        if !policy.algorithm.is_distributable() {
            return Ok(self.local.consume(key, policy, cost, now_ms));
        }

        let storage_key = key.storage_key();
        let outcome = tokio::time::timeout(
            self.timeout,
            self.consume_shared(key, &storage_key, policy, cost, now_ms),
        )
        .await
        .unwrap_or(Err(StoreError::Timeout { elapsed: self.timeout }));

        match outcome {
            Ok(decision) => Ok(decision),
            Err(err @ (StoreError::Timeout { .. } | StoreError::Contention { .. })) => {
                tracing::warn!(key = %storage_key, error = %err, "shared store degraded; using local cache");
                Ok(self.local.consume(key, policy, cost, now_ms))
            }
            Err(err) => Err(err),
        }
    }

    async fn evict_expired(&self, now_ms: u64) -> usize {
        // Shared entries expire through the TTL passed on write.
        self.local.evict(now_ms)
    }
}
