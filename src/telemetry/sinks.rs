use super::events::AdmissionEvent;
use crate::store::lock;
use std::collections::VecDeque;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tower::Service;

/// A telemetry sink that consumes admission events.
pub trait TelemetrySink:
    tower::Service<AdmissionEvent, Response = (), Error = Self::SinkError> + Clone + Send + 'static
{
    /// The error type for this sink.
    type SinkError: std::error::Error + Send + 'static;
}

type SinkFuture<E> = Pin<Box<dyn Future<Output = Result<(), E>> + Send>>;

/// Writes admission events to `tracing`, at a level matching how much an
/// operator should care.
///
/// Violations are routine and go to `debug`. Breaker transitions and range
/// blocks are `info`. Alerts and degraded-mode store failures are `warn`.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<AdmissionEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: AdmissionEvent) -> Self::Future {
        match &event {
            AdmissionEvent::Violation(v) => tracing::debug!(
                key = %v.key,
                endpoint = %v.endpoint,
                reason = v.reason().map_or("none", |r| r.as_str()),
                "admission violation"
            ),
            AdmissionEvent::Circuit(c) => {
                tracing::info!(subject = %c.subject, transition = %c.transition, "abuse circuit")
            }
            AdmissionEvent::RangeBlocked { range, distinct_ips, .. } => {
                tracing::info!(range = %range, distinct_ips, "ip range blocked")
            }
            AdmissionEvent::Alert(a) => tracing::warn!(
                scope = a.scope.as_str(),
                target = %a.target,
                violations = a.violations,
                "violation alert"
            ),
            AdmissionEvent::Degraded(d) => tracing::warn!(
                policy = %d.policy,
                error = %d.error,
                critical = d.critical,
                "counter store degraded"
            ),
        }
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for LogSink {
    type SinkError = Infallible;
}

/// A telemetry sink that keeps the most recent events in memory.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<VecDeque<AdmissionEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    /// Sink holding up to 10 000 events.
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    /// Sink holding up to `capacity` events (min 1); the oldest is evicted first.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(VecDeque::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Copy of the stored events, oldest first.
    pub fn events(&self) -> Vec<AdmissionEvent> {
        lock(&self.events).iter().cloned().collect()
    }

    pub fn clear(&self) {
        lock(&self.events).clear();
    }

    pub fn len(&self) -> usize {
        lock(&self.events).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.events).is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Events dropped to make room.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<AdmissionEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: AdmissionEvent) -> Self::Future {
        let mut guard = lock(&self.events);
        if guard.len() >= self.capacity {
            guard.pop_front();
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.push_back(event);
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for MemorySink {
    type SinkError = Infallible;
}
