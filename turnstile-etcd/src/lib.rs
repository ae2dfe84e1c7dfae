//! etcd shared counter store for `turnstile` (companion crate).
//! Bring your own `etcd_client::Client`; counter state is stored as JSON under a
//! prefix, versioned by the key's `mod_revision`, and expired through leases.
//! Leases are shared: each is granted for twice the counter TTL and attached
//! to every write in the first TTL of its life, so a write keeps its key alive
//! for at least one TTL and a lost compare-and-swap costs no lease.
//!
//! Wrap the store in [`turnstile::WriteThroughStore`] so a slow or contended
//! etcd falls back to instance-local counters.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use turnstile::store::CounterState;
use turnstile::StoreError;

/// Normalize and validate a key prefix: trims whitespace and trailing slashes.
///
/// # Errors
/// Returns `Err` if the prefix is empty or contains control characters.
pub fn normalize_prefix(prefix: impl Into<String>) -> Result<String, String> {
    let p = prefix.into().trim().trim_end_matches('/').to_string();
    if p.is_empty() {
        return Err("prefix cannot be empty".to_string());
    }
    if p.chars().any(|c| c.is_control()) {
        return Err("prefix cannot contain control characters".to_string());
    }
    Ok(p)
}

/// Serialize counter state for storage.
pub fn encode_state(state: &CounterState) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(state).map_err(|e| StoreError::Codec(e.to_string()))
}

/// Parse stored counter state.
pub fn decode_state(bytes: &[u8]) -> Result<CounterState, StoreError> {
    serde_json::from_slice(bytes).map_err(|e| StoreError::Codec(e.to_string()))
}

/// Lease length for a counter TTL; etcd leases are whole seconds, at least one.
pub fn lease_secs(ttl: Duration) -> i64 {
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    i64::try_from(secs.max(1)).unwrap_or(i64::MAX)
}

/// Leases shared across writes, one per whole-second TTL.
#[derive(Debug, Default)]
pub struct LeaseCache {
    leases: Mutex<HashMap<i64, (i64, Instant)>>,
}

impl LeaseCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Length to request when granting a shared lease for `ttl_secs`.
    pub fn grant_secs(ttl_secs: i64) -> i64 {
        ttl_secs.saturating_mul(2)
    }

    /// Lease id a write with `ttl_secs` can attach at `now`, if one is still
    /// young enough to keep the key alive for a full TTL.
    pub fn reusable(&self, ttl_secs: i64, now: Instant) -> Option<i64> {
        let mut leases = self.lock();
        let &(id, granted_at) = leases.get(&ttl_secs)?;
        let ttl = Duration::from_secs(u64::try_from(ttl_secs).unwrap_or(0));
        if now.saturating_duration_since(granted_at) < ttl {
            Some(id)
        } else {
            leases.remove(&ttl_secs);
            None
        }
    }

    /// Record a lease granted at `granted_at` for writes with `ttl_secs`.
    pub fn remember(&self, ttl_secs: i64, id: i64, granted_at: Instant) {
        self.lock().insert(ttl_secs, (id, granted_at));
    }

    /// Drop `id` if it is still the cached lease for `ttl_secs`.
    pub fn forget(&self, ttl_secs: i64, id: i64) {
        let mut leases = self.lock();
        if leases.get(&ttl_secs).is_some_and(|&(cached, _)| cached == id) {
            leases.remove(&ttl_secs);
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<i64, (i64, Instant)>> {
        self.leases.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(feature = "etcd-client")]
pub use store::EtcdStore;

#[cfg(feature = "etcd-client")]
mod store {
    use super::{decode_state, encode_state, lease_secs, normalize_prefix, LeaseCache};
    use async_trait::async_trait;
    use etcd_client::{Compare, CompareOp, PutOptions, Txn, TxnOp};
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use turnstile::store::{CounterState, SharedStore, Versioned};
    use turnstile::StoreError;

    /// [`SharedStore`] over etcd.
    #[derive(Clone)]
    pub struct EtcdStore {
        prefix: String,
        client: etcd_client::Client,
        leases: Arc<LeaseCache>,
    }

    impl std::fmt::Debug for EtcdStore {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("EtcdStore")
                .field("prefix", &self.prefix)
                .field("client", &"<etcd_client::Client>")
                .finish()
        }
    }

    impl EtcdStore {
        /// Create a store using an existing etcd client; keys will be `prefix/<counter key>`.
        ///
        /// # Errors
        /// Returns `Err` if the prefix is empty or contains control characters.
        pub fn new(prefix: impl Into<String>, client: etcd_client::Client) -> Result<Self, String> {
            Ok(Self { prefix: normalize_prefix(prefix)?, client, leases: Arc::default() })
        }

        fn full_key(&self, key: &str) -> String {
            format!("{}/{}", self.prefix, key)
        }

        async fn lease_for(&self, ttl: Duration) -> Result<i64, StoreError> {
            let ttl_secs = lease_secs(ttl);
            if let Some(id) = self.leases.reusable(ttl_secs, Instant::now()) {
                return Ok(id);
            }
            let granted_at = Instant::now();
            let lease = self
                .client
                .clone()
                .lease_grant(LeaseCache::grant_secs(ttl_secs), None)
                .await
                .map_err(unavailable)?;
            tracing::debug!(target: "turnstile::etcd", lease = lease.id(), ttl_secs, "granted shared lease");
            self.leases.remember(ttl_secs, lease.id(), granted_at);
            Ok(lease.id())
        }
    }

    fn unavailable(e: etcd_client::Error) -> StoreError {
        StoreError::unavailable(e.to_string())
    }

    #[async_trait]
    impl SharedStore for EtcdStore {
        async fn load(&self, key: &str) -> Result<Option<Versioned>, StoreError> {
            let mut client = self.client.clone();
            let resp = client.get(self.full_key(key), None).await.map_err(unavailable)?;
            let Some(kv) = resp.kvs().first() else {
                return Ok(None);
            };
            let state = decode_state(kv.value())?;
            let version = u64::try_from(kv.mod_revision())
                .map_err(|_| StoreError::Codec("negative mod_revision".into()))?;
            Ok(Some(Versioned { state, version }))
        }

        async fn compare_and_swap(
            &self,
            key: &str,
            expected: Option<u64>,
            state: &CounterState,
            ttl: Duration,
        ) -> Result<bool, StoreError> {
            let mut client = self.client.clone();
            let full_key = self.full_key(key);
            let value = encode_state(state)?;

            let guard = match expected {
                None => Compare::create_revision(full_key.as_str(), CompareOp::Equal, 0),
                Some(version) => Compare::mod_revision(
                    full_key.as_str(),
                    CompareOp::Equal,
                    i64::try_from(version).unwrap_or(i64::MAX),
                ),
            };
            let lease = self.lease_for(ttl).await?;
            let put =
                TxnOp::put(full_key.as_str(), value, Some(PutOptions::new().with_lease(lease)));
            let resp = match client.txn(Txn::new().when(vec![guard]).and_then(vec![put])).await {
                Ok(resp) => resp,
                Err(e) => {
                    // The lease may have been revoked or expired early.
                    self.leases.forget(lease_secs(ttl), lease);
                    return Err(unavailable(e));
                }
            };

            if !resp.succeeded() {
                tracing::trace!(target: "turnstile::etcd", key = %full_key, "compare-and-swap lost race");
            }
            Ok(resp.succeeded())
        }
    }
}
