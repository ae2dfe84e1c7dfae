//! Compile-time prelude coverage test.
use std::convert::Infallible;
use std::time::Duration;
use tower::{service_fn, ServiceBuilder, ServiceExt};
use turnstile::prelude::*;

#[tokio::test]
async fn prelude_reexports_core_types() {
    let global = Policy::new("global", Scope::Global, FixedWindow::new(10, Duration::from_secs(1)).unwrap())
        .with_failure_mode(FailureMode::FailOpen);
    let policies = PolicySet::builder(global)
        .breaker(BreakerConfig::disabled())
        .alerts(AlertConfig::default())
        .build()
        .expect("valid policy set");
    let admission = AdmissionService::builder(policies)
        .store(std::sync::Arc::new(LocalStore::new()))
        .clock(ManualClock::new(0))
        .build();

    let extract = |_req: &()| AdmissionRequest::new(RequestIdentity::from_ip("203.0.113.4"), "/");
    let svc = ServiceBuilder::new()
        .layer(AdmissionLayer::new(admission.clone(), extract))
        .service(service_fn(|_req: ()| async { Ok::<_, Infallible>(()) }));
    svc.oneshot(()).await.expect("service call failed");

    let decision: Decision = admission.evaluate(&RequestIdentity::from_ip("203.0.113.4"), "/").await;
    assert_eq!(decision.remaining, 8);
}
