//! Prometheus metrics sink for `turnstile`.
//! Bring your own `prometheus::Registry`; counters are registered and incremented.

use prometheus::{IntCounterVec, Registry};
use std::convert::Infallible;
use std::future::{ready, Ready};
use std::sync::Arc;
use std::task::{Context, Poll};
use turnstile::breaker::Transition;
use turnstile::telemetry::{AdmissionEvent, TelemetrySink};
use turnstile::FailureMode;

#[derive(Clone, Debug)]
pub struct PrometheusSink {
    registry: Arc<Registry>,
    counter: IntCounterVec,
}

impl PrometheusSink {
    /// Create a sink and register counters into the provided registry.
    ///
    /// # Errors
    /// Returns an error if the metric cannot be registered (e.g. name conflict).
    pub fn new<R: Into<Arc<Registry>>>(registry: R) -> Result<Self, prometheus::Error> {
        let registry = registry.into();
        let counter = IntCounterVec::new(
            prometheus::Opts::new("turnstile_events_total", "Admission events"),
            &["kind", "reason"],
        )?;
        registry.register(Box::new(counter.clone()))?;
        Ok(Self { registry, counter })
    }

    /// Expose the registry for HTTP scraping.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

fn reason_label(event: &AdmissionEvent) -> &'static str {
    match event {
        AdmissionEvent::Violation(v) => v.reason().map_or("none", |r| r.as_str()),
        AdmissionEvent::Circuit(c) => match c.transition {
            Transition::Opened { .. } => "opened",
            Transition::HalfOpened => "half_open",
            Transition::Closed => "closed",
            Transition::Reopened => "reopened",
        },
        AdmissionEvent::RangeBlocked { .. } => "distinct_ips",
        AdmissionEvent::Alert(a) => a.scope.as_str(),
        AdmissionEvent::Degraded(d) => match d.failure_mode {
            FailureMode::FailOpen => "fail_open",
            FailureMode::FailClosed => "fail_closed",
        },
    }
}

impl tower_service::Service<AdmissionEvent> for PrometheusSink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready<Result<(), Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: AdmissionEvent) -> Self::Future {
        self.counter.with_label_values(&[event.kind(), reason_label(&event)]).inc();
        ready(Ok(()))
    }
}

impl TelemetrySink for PrometheusSink {
    type SinkError = Infallible;
}
