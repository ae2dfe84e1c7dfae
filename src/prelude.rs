//! Convenient re-exports for common Turnstile types.
pub use crate::{
    algorithm::{Algorithm, FixedWindow, SlidingWindowLog, TokenBucket},
    breaker::{BreakerConfig, CircuitStatus},
    clock::{Clock, ManualClock, MonotonicClock},
    config::{AdmissionConfig, PolicyHandle},
    decision::{Decision, DenyReason},
    error::{AdmissionError, ConfigError, StoreError},
    exemption::{Cidr, Exemptions},
    key::{RequestIdentity, Scope},
    middleware::{AdmissionLayer, AdmissionRequest, IdentityExtractor},
    policy::{EndpointPattern, FailureMode, Partition, Policy, PolicySet},
    range_guard::RangeGuardConfig,
    reporter::AlertConfig,
    service::AdmissionService,
    store::{CounterStore, LocalStore, SharedStore, WriteThroughStore},
    telemetry::{AdmissionEvent, LogSink, MemorySink, TelemetrySink},
};
