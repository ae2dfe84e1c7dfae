//! The admission control service.
//!
//! [`AdmissionService::evaluate`] runs one request through, in order:
//!
//! 1. exemptions (trusted identities skip everything),
//! 2. the IP-range guard, when configured,
//! 3. the abuse breaker for the request's finest-grained identity,
//! 4. every applicable policy, global → endpoint → api key → user → ip,
//!
//! and aggregates the per-policy decisions most-restrictive-wins. Every
//! evaluated policy consumes from its own counter even when another policy
//! denies; consumption is not transactional across policies.
//!
//! Store failures never escape: each is resolved by the policy's
//! [`FailureMode`] and published as a degraded event.

use crate::breaker::{AbuseGuard, CircuitSnapshot, Gate, Transition};
use crate::clock::{Clock, MonotonicClock};
use crate::config::PolicyHandle;
use crate::decision::{Decision, DenyReason};
use crate::error::StoreError;
use crate::key::{IdentityKey, RequestIdentity};
use crate::policy::{FailureMode, Policy, PolicySet};
use crate::range_guard::{RangeGuard, RangeVerdict};
use crate::reporter::{ViolationReporter, DEFAULT_FEED_CAPACITY};
use crate::resolver::{PolicyResolver, Resolution, ResolvedRequest, Target};
use crate::store::{CounterStore, LocalStore};
use crate::telemetry::{AdmissionEvent, CircuitEvent, DegradedEvent, ViolationRecord};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Retry hint returned when a fail-closed policy cannot reach its store.
pub const STORE_UNAVAILABLE_RETRY: Duration = Duration::from_secs(1);

/// Policy id reported on range-guard denies.
pub const RANGE_GUARD_POLICY: &str = "range_guard";

/// Policy id reported on breaker denies.
pub const BREAKER_POLICY: &str = "abuse_breaker";

#[derive(Debug)]
struct Inner {
    policies: PolicyHandle,
    store: Arc<dyn CounterStore>,
    breakers: AbuseGuard,
    ranges: RangeGuard,
    reporter: ViolationReporter,
    clock: Arc<dyn Clock>,
}

/// What one [`AdmissionService::sweep`] pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Idle counter entries.
    pub counters: usize,
    /// Closed, clean breaker entries.
    pub circuits: usize,
    /// Quiet range trackers.
    pub ranges: usize,
    /// Expired reporter buckets and rate trackers.
    pub reporter: usize,
}

/// Request admission control. Cheap to clone; clones share all state.
#[derive(Debug, Clone)]
pub struct AdmissionService {
    inner: Arc<Inner>,
}

/// Builder for [`AdmissionService`].
#[derive(Debug)]
pub struct AdmissionServiceBuilder {
    policies: PolicySet,
    store: Option<Arc<dyn CounterStore>>,
    clock: Option<Arc<dyn Clock>>,
    feed_capacity: usize,
}

impl AdmissionServiceBuilder {
    /// Counter store; defaults to a fresh [`LocalStore`].
    pub fn store<S: CounterStore + 'static>(mut self, store: Arc<S>) -> Self {
        self.store = Some(store);
        self
    }

    /// Time source; defaults to [`MonotonicClock`].
    pub fn clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Some(Arc::new(clock));
        self
    }

    /// Capacity of the violation feed and recent-record buffer.
    pub fn feed_capacity(mut self, capacity: usize) -> Self {
        self.feed_capacity = capacity;
        self
    }

    /// Build the service.
    pub fn build(self) -> AdmissionService {
        let reporter = ViolationReporter::new(self.feed_capacity, self.policies.alerts().clone());
        AdmissionService {
            inner: Arc::new(Inner {
                policies: PolicyHandle::new(self.policies),
                store: self.store.unwrap_or_else(|| Arc::new(LocalStore::new())),
                breakers: AbuseGuard::new(),
                ranges: RangeGuard::new(),
                reporter,
                clock: self.clock.unwrap_or_else(|| Arc::new(MonotonicClock::default())),
            }),
        }
    }
}

impl AdmissionService {
    /// Start building a service around `policies`.
    pub fn builder(policies: PolicySet) -> AdmissionServiceBuilder {
        AdmissionServiceBuilder {
            policies,
            store: None,
            clock: None,
            feed_capacity: DEFAULT_FEED_CAPACITY,
        }
    }

    /// Service with a local store and the monotonic clock.
    pub fn new(policies: PolicySet) -> Self {
        Self::builder(policies).build()
    }

    /// Decide whether a request of cost 1 may proceed now.
    pub async fn evaluate(&self, identity: &RequestIdentity, endpoint: &str) -> Decision {
        self.evaluate_with_cost(identity, endpoint, 1).await
    }

    /// Decide whether a request consuming `cost` units may proceed now.
    pub async fn evaluate_with_cost(
        &self,
        identity: &RequestIdentity,
        endpoint: &str,
        cost: u32,
    ) -> Decision {
        let inner = &self.inner;
        let policies = inner.policies.get();
        let now_ms = inner.clock.now_millis();

        let request = match PolicyResolver::new(&policies).resolve(identity, endpoint) {
            Resolution::Exempt => return Decision::exempt(now_ms),
            Resolution::Evaluate(request) => request,
        };
        let headline_limit = policies.global().algorithm.limit();

        if let (Some(config), Some(ip)) = (policies.range_guard(), request.ip) {
            if let RangeVerdict::Blocked { range, retry_after, tripped_by } =
                inner.ranges.observe(ip, config, now_ms)
            {
                if let Some(distinct_ips) = tripped_by {
                    inner.reporter.publish(AdmissionEvent::RangeBlocked {
                        range,
                        distinct_ips,
                        cooldown: config.cooldown(),
                    });
                }
                let decision = circuit_deny(headline_limit, retry_after, now_ms, RANGE_GUARD_POLICY);
                self.report(range.to_string(), &request, &decision, now_ms);
                return decision;
            }
        }

        let probe = match inner.breakers.check(&request.subject, policies.breaker(), now_ms) {
            Gate::Pass => None,
            Gate::Reject { retry_after } => {
                tracing::debug!(subject = %request.subject, retry_after_ms = retry_after.as_millis() as u64, "abuse circuit open; rejecting");
                let decision = circuit_deny(headline_limit, retry_after, now_ms, BREAKER_POLICY);
                self.report(request.subject.to_string(), &request, &decision, now_ms);
                return decision;
            }
            Gate::Probe(permit) => {
                self.circuit_event(permit.subject().clone(), Transition::HalfOpened, now_ms);
                Some(permit)
            }
        };

        let mut first_deny: Option<(Decision, &Target)> = None;
        let mut tightest: Option<Decision> = None;
        for target in &request.targets {
            let decision = match inner.store.try_consume(&target.key, &target.policy, cost, now_ms).await {
                Ok(d) => d.with_policy(target.policy.id.clone()),
                Err(err) => self.degraded(&target.policy, &err, now_ms),
            };
            tracing::trace!(
                policy = %target.policy.id,
                key = %target.key,
                allowed = decision.allowed,
                remaining = decision.remaining,
                "policy evaluated"
            );
            if decision.is_denied() {
                if first_deny.is_none() {
                    first_deny = Some((decision, target));
                }
            } else if tightest.as_ref().map_or(true, |t| decision.remaining < t.remaining) {
                tightest = Some(decision);
            }
        }

        let (decision, denied_key) = match first_deny {
            Some((decision, target)) => (decision, Some(target.key.storage_key())),
            None => (tightest.unwrap_or_else(|| Decision::allow(0, 0, now_ms)), None),
        };

        if let Some(permit) = probe {
            let subject = permit.subject().clone();
            let transition = permit.complete(decision.allowed, now_ms);
            self.circuit_event(subject, transition, now_ms);
        } else if decision.reason == Some(DenyReason::RateLimited) {
            if let Some(transition) =
                inner.breakers.record_violation(&request.subject, policies.breaker(), now_ms)
            {
                self.circuit_event(request.subject.clone(), transition, now_ms);
            }
        }

        if let Some(key) = denied_key {
            self.report(key, &request, &decision, now_ms);
        }
        decision
    }

    fn degraded(&self, policy: &Policy, err: &StoreError, now_ms: u64) -> Decision {
        self.inner.reporter.publish(AdmissionEvent::Degraded(DegradedEvent {
            policy: policy.id.clone(),
            error: err.to_string(),
            failure_mode: policy.failure_mode,
            critical: policy.critical,
        }));
        let limit = policy.algorithm.limit();
        match policy.failure_mode {
            FailureMode::FailOpen => {
                tracing::warn!(policy = %policy.id, error = %err, "counter store unavailable; failing open");
                Decision::allow(limit, limit, now_ms).with_policy(policy.id.clone())
            }
            FailureMode::FailClosed => {
                if policy.critical {
                    tracing::error!(
                        policy = %policy.id,
                        error = %err,
                        "counter store unavailable on critical policy; failing closed"
                    );
                } else {
                    tracing::warn!(policy = %policy.id, error = %err, "counter store unavailable; failing closed");
                }
                let retry_ms = STORE_UNAVAILABLE_RETRY.as_millis() as u64;
                Decision::deny(
                    DenyReason::StoreUnavailable,
                    limit,
                    0,
                    now_ms.saturating_add(retry_ms),
                    STORE_UNAVAILABLE_RETRY,
                )
                .with_policy(policy.id.clone())
            }
        }
    }

    fn circuit_event(&self, subject: IdentityKey, transition: Transition, at_ms: u64) {
        self.inner
            .reporter
            .publish(AdmissionEvent::Circuit(CircuitEvent { subject, transition, at_ms }));
    }

    fn report(&self, key: String, request: &ResolvedRequest, decision: &Decision, now_ms: u64) {
        self.inner.reporter.record(ViolationRecord {
            key: Arc::from(key),
            endpoint: request.endpoint.clone(),
            timestamp_ms: now_ms,
            decision: decision.clone(),
        });
    }

    /// Replace the policy set. Evaluations already running keep the old one;
    /// counter and circuit state is kept.
    pub fn reload(&self, policies: PolicySet) {
        self.inner.reporter.reconfigure(policies.alerts().clone());
        let endpoints = policies.endpoints().len();
        self.inner.policies.set(policies);
        tracing::info!(endpoints, "policy set reloaded");
    }

    /// Snapshot of the live policy set.
    pub fn policies(&self) -> Arc<PolicySet> {
        self.inner.policies.get()
    }

    /// The counter store.
    pub fn store(&self) -> &Arc<dyn CounterStore> {
        &self.inner.store
    }

    /// Per-identity breakers.
    pub fn breakers(&self) -> &AbuseGuard {
        &self.inner.breakers
    }

    /// IP-range guard state.
    pub fn ranges(&self) -> &RangeGuard {
        &self.inner.ranges
    }

    /// Violation reporter and event feed.
    pub fn reporter(&self) -> &ViolationReporter {
        &self.inner.reporter
    }

    /// Circuit state for `subject`; `None` when it has no history.
    pub fn circuit(&self, subject: &IdentityKey) -> Option<CircuitSnapshot> {
        let now_ms = self.inner.clock.now_millis();
        self.inner.breakers.snapshot(subject, self.inner.policies.get().breaker(), now_ms)
    }

    /// Evict idle state everywhere.
    pub async fn sweep(&self) -> SweepReport {
        let inner = &self.inner;
        let policies = inner.policies.get();
        let now_ms = inner.clock.now_millis();
        let report = SweepReport {
            counters: inner.store.evict_expired(now_ms).await,
            circuits: inner.breakers.sweep(policies.breaker(), now_ms),
            ranges: policies.range_guard().map_or(0, |cfg| inner.ranges.sweep(cfg, now_ms)),
            reporter: inner.reporter.sweep(now_ms),
        };
        tracing::debug!(?report, "maintenance sweep");
        report
    }

    /// Run [`sweep`](Self::sweep) every `interval` on one background task.
    ///
    /// The task holds only a weak reference and exits once every clone of
    /// the service is dropped.
    pub fn spawn_maintenance(&self, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                AdmissionService { inner }.sweep().await;
            }
        })
    }
}

fn circuit_deny(limit: u64, retry_after: Duration, now_ms: u64, policy: &'static str) -> Decision {
    let retry_ms = u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX);
    Decision::deny(DenyReason::CircuitOpen, limit, 0, now_ms.saturating_add(retry_ms), retry_after)
        .with_policy(policy)
}
