//! JSONL sink for `turnstile`. Writes one admission event per line.
//! Always writes; bring your own path.

use serde_json::{json, Value};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use turnstile::telemetry::{AdmissionEvent, TelemetrySink};
use turnstile::FailureMode;

#[derive(Clone, Debug)]
pub struct JsonlSink {
    path: String,
}

impl JsonlSink {
    pub fn new<S: Into<String>>(path: S) -> Self {
        Self { path: path.into() }
    }
}

impl tower_service::Service<AdmissionEvent> for JsonlSink {
    type Response = ();
    type Error = io::Error;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: AdmissionEvent) -> Self::Future {
        let path = self.path.clone();
        let line = event_to_json(&event).to_string() + "\n";
        Box::pin(async move {
            use tokio::io::AsyncWriteExt;
            let mut file =
                tokio::fs::OpenOptions::new().create(true).append(true).open(path).await?;
            file.write_all(line.as_bytes()).await?;
            file.flush().await?;
            Ok(())
        })
    }
}

impl TelemetrySink for JsonlSink {
    type SinkError = io::Error;
}

/// One JSON object per event, tagged with `kind`.
pub fn event_to_json(event: &AdmissionEvent) -> Value {
    match event {
        AdmissionEvent::Violation(v) => json!({
            "kind": "violation",
            "key": v.key,
            "endpoint": v.endpoint,
            "timestamp_ms": v.timestamp_ms,
            "reason": v.reason().map(|r| r.as_str()),
            "policy": v.decision.policy,
            "limit": v.decision.limit,
            "retry_after_secs": v.decision.retry_after_secs(),
        }),
        AdmissionEvent::Circuit(c) => json!({
            "kind": "circuit",
            "subject": c.subject.to_string(),
            "transition": c.transition.to_string(),
            "at_ms": c.at_ms,
        }),
        AdmissionEvent::RangeBlocked { range, distinct_ips, cooldown } => json!({
            "kind": "range_blocked",
            "range": range.to_string(),
            "distinct_ips": distinct_ips,
            "cooldown_ms": cooldown.as_millis() as u64,
        }),
        AdmissionEvent::Alert(a) => json!({
            "kind": "alert",
            "scope": a.scope.as_str(),
            "target": a.target,
            "violations": a.violations,
            "window_ms": a.window.as_millis() as u64,
            "at_ms": a.at_ms,
        }),
        AdmissionEvent::Degraded(d) => json!({
            "kind": "degraded",
            "policy": d.policy,
            "error": d.error,
            "failure_mode": match d.failure_mode {
                FailureMode::FailOpen => "fail_open",
                FailureMode::FailClosed => "fail_closed",
            },
            "critical": d.critical,
        }),
    }
}
