use crate::breaker::Transition;
use crate::decision::{Decision, DenyReason};
use crate::exemption::Cidr;
use crate::key::IdentityKey;
use crate::policy::FailureMode;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Events emitted while admitting requests.
///
/// Everything the admission path wants an observer to know about flows
/// through this enum: denied requests, breaker transitions, range blocks,
/// threshold alerts and degraded-mode store failures.
#[derive(Debug, Clone, PartialEq)]
pub enum AdmissionEvent {
    /// A request was denied.
    Violation(ViolationRecord),
    /// An identity's abuse circuit changed state.
    Circuit(CircuitEvent),
    /// An IP range was blocked after a distinct-address spike.
    RangeBlocked {
        /// Blocked range.
        range: Cidr,
        /// Distinct addresses that tripped the block.
        distinct_ips: usize,
        /// Block length.
        cooldown: Duration,
    },
    /// A violation rate crossed its alert threshold.
    Alert(Alert),
    /// Counter state could not be reached; the policy's failure mode decided.
    Degraded(DegradedEvent),
}

impl AdmissionEvent {
    /// Stable label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            AdmissionEvent::Violation(_) => "violation",
            AdmissionEvent::Circuit(_) => "circuit",
            AdmissionEvent::RangeBlocked { .. } => "range_blocked",
            AdmissionEvent::Alert(_) => "alert",
            AdmissionEvent::Degraded(_) => "degraded",
        }
    }
}

/// One denied request. Append-only; consumers must not expect updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViolationRecord {
    /// Key responsible for the deny: the counter key of the denying policy,
    /// the breaker subject, or the blocked range.
    pub key: Arc<str>,
    /// Endpoint path requested.
    pub endpoint: Arc<str>,
    /// Epoch millis of the decision.
    pub timestamp_ms: u64,
    /// The decision as returned to the caller.
    pub decision: Decision,
}

impl ViolationRecord {
    /// Deny reason carried by the decision.
    pub fn reason(&self) -> Option<DenyReason> {
        self.decision.reason
    }
}

/// A breaker transition for one identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitEvent {
    /// Identity whose circuit moved.
    pub subject: IdentityKey,
    /// What happened.
    pub transition: Transition,
    /// Epoch millis of the transition.
    pub at_ms: u64,
}

/// What an alert is grouped on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertScope {
    /// A single violation key.
    Key,
    /// An endpoint path.
    Endpoint,
}

impl AlertScope {
    /// Stable label.
    pub fn as_str(self) -> &'static str {
        match self {
            AlertScope::Key => "key",
            AlertScope::Endpoint => "endpoint",
        }
    }
}

/// A violation-rate threshold crossing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    /// Grouping.
    pub scope: AlertScope,
    /// Key or endpoint that crossed the threshold.
    pub target: Arc<str>,
    /// Violations counted in the window.
    pub violations: u64,
    /// Window the count covers.
    pub window: Duration,
    /// Epoch millis the threshold was crossed.
    pub at_ms: u64,
}

/// A store failure resolved by a failure mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DegradedEvent {
    /// Policy whose counter could not be reached.
    pub policy: Arc<str>,
    /// Rendered store error.
    pub error: String,
    /// How the request was resolved.
    pub failure_mode: FailureMode,
    /// Whether the policy is flagged critical.
    pub critical: bool,
}

impl fmt::Display for AdmissionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdmissionEvent::Violation(v) => write!(f, "Violation::{}", v),
            AdmissionEvent::Circuit(c) => write!(f, "Circuit::{}", c),
            AdmissionEvent::RangeBlocked { range, distinct_ips, cooldown } => write!(
                f,
                "RangeBlocked(range={}, distinct_ips={}, cooldown={:?})",
                range, distinct_ips, cooldown
            ),
            AdmissionEvent::Alert(a) => write!(f, "Alert::{}", a),
            AdmissionEvent::Degraded(d) => write!(f, "Degraded::{}", d),
        }
    }
}

impl fmt::Display for ViolationRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = self.decision.reason.map_or("allowed", DenyReason::as_str);
        write!(
            f,
            "{}(key={}, endpoint={}, retry_after={:?})",
            reason, self.key, self.endpoint, self.decision.retry_after
        )
    }
}

impl fmt::Display for CircuitEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.transition, self.subject)
    }
}

impl fmt::Display for Alert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}(target={}, violations={}, window={:?})",
            self.scope.as_str(),
            self.target,
            self.violations,
            self.window
        )
    }
}

impl fmt::Display for DegradedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = match self.failure_mode {
            FailureMode::FailOpen => "fail_open",
            FailureMode::FailClosed => "fail_closed",
        };
        write!(f, "{}(policy={}, error={})", mode, self.policy, self.error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::Scope;

    fn violation() -> ViolationRecord {
        ViolationRecord {
            key: Arc::from("login/endpoint//login"),
            endpoint: Arc::from("/login"),
            timestamp_ms: 1_000,
            decision: Decision::deny(DenyReason::RateLimited, 5, 0, 60_000, Duration::from_secs(3)),
        }
    }

    #[test]
    fn display_formats() {
        let v = AdmissionEvent::Violation(violation());
        assert_eq!(
            v.to_string(),
            "Violation::rate_limited(key=login/endpoint//login, endpoint=/login, retry_after=3s)"
        );

        let c = AdmissionEvent::Circuit(CircuitEvent {
            subject: IdentityKey::new(Scope::User, "u1"),
            transition: Transition::Opened { violations: 4 },
            at_ms: 0,
        });
        assert_eq!(c.to_string(), "Circuit::opened after 4 violations(user:u1)");
        assert_eq!(c.kind(), "circuit");

        let d = AdmissionEvent::Degraded(DegradedEvent {
            policy: Arc::from("global"),
            error: "timeout".into(),
            failure_mode: FailureMode::FailOpen,
            critical: false,
        });
        assert_eq!(d.to_string(), "Degraded::fail_open(policy=global, error=timeout)");
    }

    #[test]
    fn violation_record_serializes_decision() {
        let json = serde_json::to_value(violation()).unwrap();
        assert_eq!(json["endpoint"], "/login");
        assert_eq!(json["decision"]["reason"], "rate_limited");
        assert_eq!(violation().reason(), Some(DenyReason::RateLimited));
    }
}
