#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Turnstile
//!
//! Request admission control for async Rust services: layered rate limits,
//! abuse circuit breaking and a violation feed for observability.
//!
//! ## Features
//!
//! - **Three algorithms**: token bucket, sliding window log, fixed window
//! - **Layered policies**: global, per endpoint, per API key, per user, per IP,
//!   aggregated most-restrictive-wins
//! - **Abuse breaker** per identity with single-probe half-open recovery, plus
//!   IP-range spike blocking
//! - **Per-key locking** over a sharded map, TTL eviction of idle keys
//! - **Write-through shared store** for multi-instance deployments with a
//!   latency budget and local fallback
//! - **Violation feed** with time-bucketed counts and threshold alerts
//! - **Live reload** of the whole policy set from JSON
//! - **Tower middleware** for hosts built on tower
//!
//! ## Quick Start
//!
//! ```rust
//! use turnstile::{AdmissionService, Policy, PolicySet, RequestIdentity, Scope, TokenBucket};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let global = Policy::new("global", Scope::Global, TokenBucket::new(100, 50.0)?);
//!     let service = AdmissionService::new(PolicySet::builder(global).build()?);
//!
//!     let caller = RequestIdentity::from_ip("203.0.113.4").with_user("u123");
//!     let decision = service.evaluate(&caller, "/api/items").await;
//!     assert!(decision.allowed);
//!     for (name, value) in decision.headers() {
//!         println!("{name}: {value}");
//!     }
//!     Ok(())
//! }
//! ```

pub mod algorithm;
pub mod breaker;
pub mod clock;
pub mod config;
pub mod decision;
pub mod error;
pub mod exemption;
pub mod key;
pub mod middleware;
pub mod policy;
pub mod prelude;
pub mod range_guard;
pub mod reporter;
pub mod resolver;
pub mod service;
pub mod store;
pub mod telemetry;

// Re-exports
pub use algorithm::{Algorithm, AlgorithmKind, FixedWindow, SlidingWindowLog, TokenBucket};
pub use breaker::{AbuseGuard, BreakerConfig, BreakerConfigError, CircuitSnapshot, CircuitStatus};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{AdmissionConfig, LimitConfig, PolicyHandle};
pub use decision::{Decision, DenyBody, DenyReason};
pub use error::{AdmissionError, AlgorithmError, ConfigError, StoreError};
pub use exemption::{Cidr, Exemptions};
pub use key::{IdentityKey, PolicyKey, RequestIdentity, Scope};
pub use middleware::{AdmissionLayer, AdmissionMiddleware, AdmissionRequest, IdentityExtractor};
pub use policy::{EndpointPattern, FailureMode, Partition, Policy, PolicySet};
pub use range_guard::RangeGuardConfig;
pub use reporter::{AlertConfig, ViolationReporter};
pub use resolver::PolicyResolver;
pub use service::{AdmissionService, AdmissionServiceBuilder, SweepReport};
pub use store::{CounterStore, InMemorySharedStore, LocalStore, SharedStore, WriteThroughStore};
pub use telemetry::{AdmissionEvent, TelemetrySink, ViolationRecord};
