//! Admission telemetry.
//!
//! Every noteworthy thing the admission path does becomes an
//! [`AdmissionEvent`]. Events are produced by the
//! [`ViolationReporter`](crate::reporter::ViolationReporter) feed and consumed
//! by [`TelemetrySink`] implementations, which can log, keep, or forward them
//! to external systems.
//!
//! # Event Types
//!
//! - **Violation**: a denied request with its decision snapshot
//! - **Circuit**: abuse breaker transitions (opened, half-open, closed, reopened)
//! - **RangeBlocked**: a whole IP range blocked after a distinct-address spike
//! - **Alert**: a per-key or per-endpoint violation rate crossed its threshold
//! - **Degraded**: counter store failure resolved by a failure mode
//!
//! # Telemetry Sinks
//!
//! The `TelemetrySink` trait defines how events are consumed. It's implemented
//! as a `tower::Service<AdmissionEvent>` for composability.

pub mod events;
pub mod sinks;

pub use events::{
    AdmissionEvent, Alert, AlertScope, CircuitEvent, DegradedEvent, ViolationRecord,
};
pub use sinks::{LogSink, MemorySink, TelemetrySink};
