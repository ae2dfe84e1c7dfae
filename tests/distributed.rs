mod common;

use async_trait::async_trait;
use common::test_helpers::{fixed, from_ip, T0};
use std::sync::Arc;
use std::time::Duration;
use turnstile::store::{CounterState, Versioned};
use turnstile::{
    AdmissionService, BreakerConfig, DenyReason, EndpointPattern, InMemorySharedStore,
    ManualClock, PolicySet, Scope, SharedStore, StoreError, WriteThroughStore,
};

fn instance<S: SharedStore + 'static>(shared: S, clock: &ManualClock, set: PolicySet) -> AdmissionService {
    AdmissionService::builder(set)
        .store(Arc::new(WriteThroughStore::new(shared)))
        .clock(clock.clone())
        .build()
}

fn five_per_minute() -> PolicySet {
    PolicySet::builder(fixed("global", Scope::Global, 5, 60))
        .breaker(BreakerConfig::disabled())
        .build()
        .unwrap()
}

#[tokio::test]
async fn instances_share_one_logical_limit() {
    let shared = InMemorySharedStore::new();
    let clock = ManualClock::new(T0);
    let a = instance(shared.clone(), &clock, five_per_minute());
    let b = instance(shared.clone(), &clock, five_per_minute());
    let caller = from_ip("203.0.113.4");

    let mut admitted = 0;
    for i in 0..10 {
        let svc = if i % 2 == 0 { &a } else { &b };
        if svc.evaluate(&caller, "/").await.allowed {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 5);
}

/// Shared store that answers far slower than the latency budget.
#[derive(Debug, Clone)]
struct Sluggish {
    inner: InMemorySharedStore,
    delay: Duration,
}

#[async_trait]
impl SharedStore for Sluggish {
    async fn load(&self, key: &str) -> Result<Option<Versioned>, StoreError> {
        tokio::time::sleep(self.delay).await;
        self.inner.load(key).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        state: &CounterState,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.inner.compare_and_swap(key, expected, state, ttl).await
    }
}

#[tokio::test(start_paused = true)]
async fn slow_shared_store_falls_back_to_local_cache() {
    let shared = Sluggish { inner: InMemorySharedStore::new(), delay: Duration::from_millis(200) };
    let clock = ManualClock::new(T0);
    let store = Arc::new(WriteThroughStore::new(shared).with_timeout(Duration::from_millis(5)));
    let svc = AdmissionService::builder(five_per_minute()).store(store.clone()).clock(clock).build();
    let caller = from_ip("203.0.113.4");

    let started = tokio::time::Instant::now();
    let mut admitted = 0;
    for _ in 0..7 {
        if svc.evaluate(&caller, "/").await.allowed {
            admitted += 1;
        }
    }
    let elapsed = started.elapsed();

    // Each call spent at most the budget; the local cache still enforced the limit.
    assert!(elapsed <= Duration::from_millis(7 * 6), "took {elapsed:?}");
    assert_eq!(admitted, 5);
    assert_eq!(store.local().len(), 1);
}

/// Shared store that refuses every connection.
#[derive(Debug, Clone, Copy)]
struct Refused;

#[async_trait]
impl SharedStore for Refused {
    async fn load(&self, _key: &str) -> Result<Option<Versioned>, StoreError> {
        Err(StoreError::unavailable("connection refused"))
    }

    async fn compare_and_swap(
        &self,
        _key: &str,
        _expected: Option<u64>,
        _state: &CounterState,
        _ttl: Duration,
    ) -> Result<bool, StoreError> {
        Err(StoreError::unavailable("connection refused"))
    }
}

#[tokio::test]
async fn unreachable_shared_store_uses_each_policys_failure_mode() {
    let set = PolicySet::builder(fixed("global", Scope::Global, 100, 60))
        .endpoint(
            EndpointPattern::parse("/login").unwrap(),
            fixed("endpoint:/login", Scope::Endpoint, 5, 60).sensitive(),
        )
        .build()
        .unwrap();
    let clock = ManualClock::new(T0);
    let svc = instance(Refused, &clock, set);
    let caller = from_ip("203.0.113.4");

    let general = svc.evaluate(&caller, "/items").await;
    assert!(general.allowed);

    let login = svc.evaluate(&caller, "/login").await;
    assert_eq!(login.reason, Some(DenyReason::StoreUnavailable));
    assert_eq!(login.status_code(), 503);
    assert_eq!(login.retry_after_secs(), 1);
}
