mod common;

use common::test_helpers::{fixed, from_ip, open_global, CountingStore, Harness, T0};
use std::sync::Arc;
use std::time::Duration;
use turnstile::breaker::Transition;
use turnstile::telemetry::CircuitEvent;
use turnstile::{
    AdmissionEvent, AdmissionService, BreakerConfig, CircuitStatus, DenyReason, IdentityKey,
    ManualClock, PolicySet, Scope,
};

fn breaker(threshold: u32, cooldown_secs: u64) -> BreakerConfig {
    BreakerConfig::new(threshold, Duration::from_secs(60), Duration::from_secs(cooldown_secs)).unwrap()
}

fn transitions(feed: &mut tokio::sync::broadcast::Receiver<AdmissionEvent>) -> Vec<Transition> {
    std::iter::from_fn(|| feed.try_recv().ok())
        .filter_map(|e| match e {
            AdmissionEvent::Circuit(CircuitEvent { transition, .. }) => Some(transition),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn open_circuit_rejects_without_touching_counters() {
    let set = PolicySet::builder(fixed("global", Scope::Global, 1, 60))
        .breaker(breaker(3, 30))
        .build()
        .unwrap();
    let h = Harness::new(set);
    let mut feed = h.service.reporter().subscribe();
    let caller = from_ip("203.0.113.4").with_user("mallory");

    assert!(h.hit(&caller, "/").await.allowed);
    for _ in 0..3 {
        assert_eq!(h.hit(&caller, "/").await.reason, Some(DenyReason::RateLimited));
    }
    assert_eq!(transitions(&mut feed), vec![Transition::Opened { violations: 3 }]);

    let before = h.store.mutations();
    h.advance(1_000);
    let d = h.hit(&caller, "/").await;
    assert_eq!(d.reason, Some(DenyReason::CircuitOpen));
    assert_eq!(d.retry_after, Duration::from_secs(29));
    assert_eq!(d.deny_body().unwrap().error, DenyReason::CircuitOpen);
    assert_eq!(h.store.mutations(), before);

    // The circuit tracks the user, not the address.
    let other_user = from_ip("203.0.113.4").with_user("alice");
    assert_ne!(h.hit(&other_user, "/").await.reason, Some(DenyReason::CircuitOpen));
}

#[tokio::test(start_paused = true)]
async fn half_open_admits_exactly_one_probe() {
    let set = PolicySet::builder(fixed("global", Scope::Global, 1, 10))
        .breaker(breaker(2, 30))
        .build()
        .unwrap();
    let store = Arc::new(CountingStore::with_delay(Duration::from_millis(50)));
    let clock = ManualClock::new(T0);
    let svc = AdmissionService::builder(set).store(store.clone()).clock(clock.clone()).build();
    let caller = from_ip("203.0.113.4");
    let subject = IdentityKey::new(Scope::Ip, "203.0.113.4");

    svc.evaluate(&caller, "/").await;
    svc.evaluate(&caller, "/").await;
    svc.evaluate(&caller, "/").await;
    assert_eq!(svc.circuit(&subject).unwrap().status, CircuitStatus::Open);

    clock.advance(30_000);
    let calls_before = store.calls();
    let (probe, second) = tokio::join!(svc.evaluate(&caller, "/"), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        svc.evaluate(&caller, "/").await
    });

    assert!(probe.allowed);
    assert_eq!(second.reason, Some(DenyReason::CircuitOpen));
    assert_eq!(store.calls() - calls_before, 1);

    let snapshot = svc.circuit(&subject).unwrap();
    assert_eq!(snapshot.status, CircuitStatus::Closed);
    assert_eq!(snapshot.violation_count, 0);
}

#[tokio::test]
async fn denied_probe_reopens_with_fresh_cooldown() {
    let set = PolicySet::builder(fixed("global", Scope::Global, 1, 3_600))
        .breaker(breaker(2, 30))
        .build()
        .unwrap();
    let h = Harness::new(set);
    let mut feed = h.service.reporter().subscribe();
    let caller = from_ip("203.0.113.4");

    for _ in 0..3 {
        h.hit(&caller, "/").await;
    }
    h.advance(30_000);
    // The hour-long window has not rolled, so the probe is denied.
    let probe = h.hit(&caller, "/").await;
    assert_eq!(probe.reason, Some(DenyReason::RateLimited));

    let d = h.hit(&caller, "/").await;
    assert_eq!(d.reason, Some(DenyReason::CircuitOpen));
    assert_eq!(d.retry_after, Duration::from_secs(30));
    assert_eq!(
        transitions(&mut feed),
        vec![Transition::Opened { violations: 2 }, Transition::HalfOpened, Transition::Reopened]
    );
}

#[tokio::test]
async fn violations_outside_the_window_do_not_open() {
    let set = PolicySet::builder(fixed("global", Scope::Global, 1, 1))
        .breaker(breaker(3, 30))
        .build()
        .unwrap();
    let h = Harness::new(set);
    let caller = from_ip("203.0.113.4");

    // Two violations per minute never reach three inside one 60s window.
    for _ in 0..5 {
        h.hit(&caller, "/").await;
        h.hit(&caller, "/").await;
        h.hit(&caller, "/").await;
        h.advance(61_000);
    }
    let snapshot = h.service.circuit(&IdentityKey::new(Scope::Ip, "203.0.113.4")).unwrap();
    assert_eq!(snapshot.status, CircuitStatus::Closed);
    assert_eq!(snapshot.violation_count, 0);

    let report = h.service.sweep().await;
    assert_eq!(report.circuits, 1);
    assert!(h.service.breakers().is_empty());
}

#[tokio::test]
async fn sweep_bounds_circuits_under_address_churn() {
    let set = PolicySet::builder(open_global())
        .ip(fixed("ip", Scope::Ip, 1, 60))
        .breaker(breaker(2, 10))
        .build()
        .unwrap();
    let h = Harness::new(set);

    // Each address exhausts its budget and trips its own circuit.
    for i in 0..500u32 {
        let caller = from_ip(&format!("10.0.{}.{}", i / 256, i % 256));
        for _ in 0..3 {
            h.hit(&caller, "/").await;
        }
    }
    // One address with a single violation stays closed.
    let quiet = from_ip("192.0.2.1");
    h.hit(&quiet, "/").await;
    h.hit(&quiet, "/").await;
    assert_eq!(h.service.breakers().len(), 501);

    h.advance(24 * 60 * 60 * 1_000);
    let attacker = from_ip("198.51.100.9");
    for _ in 0..3 {
        h.hit(&attacker, "/").await;
    }

    let report = h.service.sweep().await;
    assert_eq!(report.circuits, 501);
    assert_eq!(h.service.breakers().len(), 1);
    let live = h.service.circuit(&IdentityKey::new(Scope::Ip, "198.51.100.9")).unwrap();
    assert_eq!(live.status, CircuitStatus::Open);
    assert_eq!(h.hit(&attacker, "/").await.reason, Some(DenyReason::CircuitOpen));

    // A swept address starts over with normal evaluation.
    let returning = from_ip("10.0.0.0");
    assert!(h.hit(&returning, "/").await.allowed);
}
