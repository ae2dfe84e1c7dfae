//! Per-identity abuse circuit breaker.
//!
//! Rate limiting decides whether one request is within budget; the breaker
//! decides whether an identity has been hostile long enough to reject it
//! outright. Each rate-limit deny is a violation. `violation_threshold`
//! violations inside `observation_window` open the circuit, which rejects
//! everything for `cooldown`. After the cooldown exactly one probe request is
//! let through to normal evaluation: if it is admitted the circuit closes,
//! otherwise it reopens with a fresh cooldown.
//!
//! Identities that never violate never get an entry, so the map holds only
//! offenders.

use crate::key::IdentityKey;
use crate::store::lock;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Retry hint given to requests that arrive while a probe is in flight.
const PROBE_IN_FLIGHT_RETRY: Duration = Duration::from_secs(1);

/// Errors produced when validating breaker configuration.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BreakerConfigError {
    /// Violation threshold must be > 0.
    #[error("violation_threshold must be > 0 (got {provided})")]
    InvalidThreshold {
        /// Value provided by caller.
        provided: u32,
    },
    /// Observation window must be > 0.
    #[error("observation_window must be > 0 (got {0:?})")]
    InvalidWindow(Duration),
    /// Cooldown must be > 0.
    #[error("cooldown must be > 0 (got {0:?})")]
    InvalidCooldown(Duration),
}

/// Validated breaker thresholds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerConfig {
    violation_threshold: u32,
    observation_window: Duration,
    cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            violation_threshold: 10,
            observation_window: Duration::from_secs(60),
            cooldown: Duration::from_secs(300),
        }
    }
}

impl BreakerConfig {
    /// Create a config with validation.
    pub fn new(
        violation_threshold: u32,
        observation_window: Duration,
        cooldown: Duration,
    ) -> Result<Self, BreakerConfigError> {
        if violation_threshold == 0 {
            return Err(BreakerConfigError::InvalidThreshold { provided: 0 });
        }
        if observation_window.is_zero() {
            return Err(BreakerConfigError::InvalidWindow(observation_window));
        }
        if cooldown.is_zero() {
            return Err(BreakerConfigError::InvalidCooldown(cooldown));
        }
        Ok(Self { violation_threshold, observation_window, cooldown })
    }

    /// A breaker that never opens.
    pub fn disabled() -> Self {
        Self {
            violation_threshold: u32::MAX,
            observation_window: Duration::from_secs(1),
            cooldown: Duration::from_secs(1),
        }
    }

    /// Violations within the window that open the circuit.
    pub fn violation_threshold(&self) -> u32 {
        self.violation_threshold
    }

    /// Rolling window violations are counted in.
    pub fn observation_window(&self) -> Duration {
        self.observation_window
    }

    /// How long an open circuit rejects before probing.
    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    fn window_ms(&self) -> u64 {
        u64::try_from(self.observation_window.as_millis()).unwrap_or(u64::MAX)
    }

    fn cooldown_ms(&self) -> u64 {
        u64::try_from(self.cooldown.as_millis()).unwrap_or(u64::MAX)
    }
}

/// Breaker status for one identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStatus {
    /// Requests go through normal evaluation.
    Closed,
    /// Requests are rejected without evaluation.
    Open,
    /// One probe request is being evaluated.
    HalfOpen,
}

/// A change of [`CircuitStatus`], reported to telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Closed → open after `violations` in the window.
    Opened {
        /// Violations counted when the circuit opened.
        violations: usize,
    },
    /// Open → half-open; a probe was admitted.
    HalfOpened,
    /// Half-open → closed; the probe was admitted by every policy.
    Closed,
    /// Half-open → open; the probe was denied.
    Reopened,
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transition::Opened { violations } => write!(f, "opened after {violations} violations"),
            Transition::HalfOpened => f.write_str("half-open"),
            Transition::Closed => f.write_str("closed"),
            Transition::Reopened => f.write_str("reopened"),
        }
    }
}

/// Read-only view of one identity's circuit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitSnapshot {
    /// Current status.
    pub status: CircuitStatus,
    /// When the circuit last opened.
    pub opened_at_ms: Option<u64>,
    /// Violations inside the observation window at the time of the snapshot.
    pub violation_count: usize,
    /// Most recent violation.
    pub last_violation_ms: Option<u64>,
}

#[derive(Debug)]
struct CircuitEntry {
    status: CircuitStatus,
    opened_at_ms: u64,
    violations: VecDeque<u64>,
    probe_in_flight: bool,
    evicted: bool,
}

impl CircuitEntry {
    fn new() -> Self {
        Self {
            status: CircuitStatus::Closed,
            opened_at_ms: 0,
            violations: VecDeque::new(),
            probe_in_flight: false,
            evicted: false,
        }
    }

    fn prune(&mut self, window_ms: u64, now_ms: u64) {
        while let Some(&t) = self.violations.front() {
            if now_ms.saturating_sub(t) >= window_ms {
                self.violations.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Outcome of [`AbuseGuard::check`].
#[derive(Debug)]
pub enum Gate {
    /// Circuit closed; evaluate normally.
    Pass,
    /// This request is the half-open probe. Resolve it with
    /// [`ProbePermit::complete`]; dropping it unresolved frees the slot.
    Probe(ProbePermit),
    /// Circuit open (or a probe is already in flight).
    Reject {
        /// How long until the identity may try again.
        retry_after: Duration,
    },
}

/// The single half-open probe slot for one identity.
#[derive(Debug)]
pub struct ProbePermit {
    subject: IdentityKey,
    entry: Arc<Mutex<CircuitEntry>>,
    resolved: bool,
}

impl ProbePermit {
    /// Identity being probed.
    pub fn subject(&self) -> &IdentityKey {
        &self.subject
    }

    /// Close the circuit if the probe was admitted, otherwise reopen it.
    pub fn complete(mut self, admitted: bool, now_ms: u64) -> Transition {
        self.resolved = true;
        let mut entry = lock(&self.entry);
        entry.probe_in_flight = false;
        if admitted {
            entry.status = CircuitStatus::Closed;
            entry.violations.clear();
            entry.opened_at_ms = 0;
            tracing::info!(subject = %self.subject, "abuse circuit → closed");
            Transition::Closed
        } else {
            entry.status = CircuitStatus::Open;
            entry.opened_at_ms = now_ms;
            tracing::warn!(subject = %self.subject, "abuse circuit: probe denied → open");
            Transition::Reopened
        }
    }
}

impl Drop for ProbePermit {
    fn drop(&mut self) {
        if !self.resolved {
            lock(&self.entry).probe_in_flight = false;
        }
    }
}

/// Per-identity circuit breakers.
#[derive(Debug, Default)]
pub struct AbuseGuard {
    circuits: DashMap<IdentityKey, Arc<Mutex<CircuitEntry>>>,
}

impl AbuseGuard {
    /// Empty guard.
    pub fn new() -> Self {
        Self::default()
    }

    /// Identities currently tracked.
    pub fn len(&self) -> usize {
        self.circuits.len()
    }

    /// True when no identity is tracked.
    pub fn is_empty(&self) -> bool {
        self.circuits.is_empty()
    }

    /// Decide whether `subject` may be evaluated at all.
    pub fn check(&self, subject: &IdentityKey, config: &BreakerConfig, now_ms: u64) -> Gate {
        let Some(entry) = self.circuits.get(subject).map(|e| e.value().clone()) else {
            return Gate::Pass;
        };
        let mut guard = lock(&entry);
        if guard.evicted {
            return Gate::Pass;
        }
        let status = guard.status;
        match status {
            CircuitStatus::Closed => Gate::Pass,
            CircuitStatus::Open => {
                let elapsed = now_ms.saturating_sub(guard.opened_at_ms);
                let cooldown = config.cooldown_ms();
                if elapsed < cooldown {
                    return Gate::Reject { retry_after: Duration::from_millis(cooldown - elapsed) };
                }
                guard.status = CircuitStatus::HalfOpen;
                guard.probe_in_flight = true;
                tracing::info!(subject = %subject, "abuse circuit → half-open");
                drop(guard);
                Gate::Probe(ProbePermit { subject: subject.clone(), entry, resolved: false })
            }
            CircuitStatus::HalfOpen if guard.probe_in_flight => {
                Gate::Reject { retry_after: PROBE_IN_FLIGHT_RETRY.min(config.cooldown) }
            }
            CircuitStatus::HalfOpen => {
                // Previous probe was abandoned; this request takes the slot.
                guard.probe_in_flight = true;
                tracing::debug!(subject = %subject, "abuse circuit: re-issuing half-open probe");
                drop(guard);
                Gate::Probe(ProbePermit { subject: subject.clone(), entry, resolved: false })
            }
        }
    }

    /// Count a violation for `subject`; returns the transition if it opened the circuit.
    pub fn record_violation(
        &self,
        subject: &IdentityKey,
        config: &BreakerConfig,
        now_ms: u64,
    ) -> Option<Transition> {
        loop {
            let entry = self
                .circuits
                .entry(subject.clone())
                .or_insert_with(|| Arc::new(Mutex::new(CircuitEntry::new())))
                .value()
                .clone();
            let mut guard = lock(&entry);
            if guard.evicted {
                continue;
            }
            if guard.status != CircuitStatus::Closed {
                return None;
            }
            guard.prune(config.window_ms(), now_ms);
            guard.violations.push_back(now_ms);
            let violations = guard.violations.len();
            if violations < config.violation_threshold as usize {
                return None;
            }
            guard.status = CircuitStatus::Open;
            guard.opened_at_ms = now_ms;
            tracing::info!(
                subject = %subject,
                violations,
                threshold = config.violation_threshold,
                cooldown_ms = config.cooldown_ms(),
                "abuse circuit → open"
            );
            return Some(Transition::Opened { violations });
        }
    }

    /// Current view of `subject`'s circuit; `None` means closed and clean.
    pub fn snapshot(
        &self,
        subject: &IdentityKey,
        config: &BreakerConfig,
        now_ms: u64,
    ) -> Option<CircuitSnapshot> {
        let entry = self.circuits.get(subject).map(|e| e.value().clone())?;
        let mut guard = lock(&entry);
        guard.prune(config.window_ms(), now_ms);
        Some(CircuitSnapshot {
            status: guard.status,
            opened_at_ms: (guard.status != CircuitStatus::Closed).then_some(guard.opened_at_ms),
            violation_count: guard.violations.len(),
            last_violation_ms: guard.violations.back().copied(),
        })
    }

    /// Forget circuits that no longer hold anything worth remembering.
    ///
    /// A closed circuit goes once its violations have aged out. An open or
    /// half-open circuit goes once a full cooldown plus observation window
    /// has passed since it opened with no probe in flight; an identity that
    /// stays away that long starts over closed. Circuits still cooling down,
    /// and live probes, are kept.
    pub fn sweep(&self, config: &BreakerConfig, now_ms: u64) -> usize {
        let horizon = config.cooldown_ms().saturating_add(config.window_ms());
        let before = self.circuits.len();
        self.circuits.retain(|_, entry| {
            let mut guard = lock(entry);
            guard.prune(config.window_ms(), now_ms);
            let expired = match guard.status {
                CircuitStatus::Closed => guard.violations.is_empty(),
                CircuitStatus::Open | CircuitStatus::HalfOpen => {
                    !guard.probe_in_flight
                        && now_ms.saturating_sub(guard.opened_at_ms) >= horizon
                }
            };
            if expired {
                guard.evicted = true;
            }
            !expired
        });
        before.saturating_sub(self.circuits.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::Scope;

    fn config() -> BreakerConfig {
        BreakerConfig::new(3, Duration::from_secs(10), Duration::from_secs(30)).unwrap()
    }

    fn subject() -> IdentityKey {
        IdentityKey::new(Scope::User, "mallory")
    }

    fn open(guard: &AbuseGuard, cfg: &BreakerConfig, at: u64) {
        for _ in 0..cfg.violation_threshold() {
            guard.record_violation(&subject(), cfg, at);
        }
    }

    #[test]
    fn rejects_invalid_config() {
        assert!(matches!(
            BreakerConfig::new(0, Duration::from_secs(1), Duration::from_secs(1)),
            Err(BreakerConfigError::InvalidThreshold { provided: 0 })
        ));
        assert!(BreakerConfig::new(1, Duration::ZERO, Duration::from_secs(1)).is_err());
        assert!(BreakerConfig::new(1, Duration::from_secs(1), Duration::ZERO).is_err());
    }

    #[test]
    fn clean_identities_are_not_tracked() {
        let guard = AbuseGuard::new();
        assert!(matches!(guard.check(&subject(), &config(), 0), Gate::Pass));
        assert!(guard.is_empty());
    }

    #[test]
    fn opens_at_threshold_within_window() {
        let guard = AbuseGuard::new();
        let cfg = config();
        assert_eq!(guard.record_violation(&subject(), &cfg, 0), None);
        assert_eq!(guard.record_violation(&subject(), &cfg, 1_000), None);
        assert_eq!(
            guard.record_violation(&subject(), &cfg, 2_000),
            Some(Transition::Opened { violations: 3 })
        );
        match guard.check(&subject(), &cfg, 5_000) {
            Gate::Reject { retry_after } => assert_eq!(retry_after, Duration::from_secs(27)),
            other => panic!("expected reject, got {other:?}"),
        }
        let snap = guard.snapshot(&subject(), &cfg, 5_000).unwrap();
        assert_eq!(snap.status, CircuitStatus::Open);
        assert_eq!(snap.opened_at_ms, Some(2_000));
    }

    #[test]
    fn violations_outside_window_do_not_count() {
        let guard = AbuseGuard::new();
        let cfg = config();
        guard.record_violation(&subject(), &cfg, 0);
        guard.record_violation(&subject(), &cfg, 5_000);
        assert_eq!(guard.record_violation(&subject(), &cfg, 10_000), None);
        assert!(matches!(guard.check(&subject(), &cfg, 10_000), Gate::Pass));
    }

    #[test]
    fn single_probe_after_cooldown() {
        let guard = AbuseGuard::new();
        let cfg = config();
        open(&guard, &cfg, 0);

        let probe = match guard.check(&subject(), &cfg, 30_000) {
            Gate::Probe(p) => p,
            other => panic!("expected probe, got {other:?}"),
        };
        assert!(matches!(guard.check(&subject(), &cfg, 30_001), Gate::Reject { .. }));

        assert_eq!(probe.complete(true, 30_002), Transition::Closed);
        assert!(matches!(guard.check(&subject(), &cfg, 30_003), Gate::Pass));
        assert_eq!(guard.snapshot(&subject(), &cfg, 30_003).unwrap().violation_count, 0);
    }

    #[test]
    fn denied_probe_reopens_with_fresh_cooldown() {
        let guard = AbuseGuard::new();
        let cfg = config();
        open(&guard, &cfg, 0);
        let Gate::Probe(probe) = guard.check(&subject(), &cfg, 30_000) else {
            panic!("expected probe");
        };
        assert_eq!(probe.complete(false, 31_000), Transition::Reopened);
        match guard.check(&subject(), &cfg, 40_000) {
            Gate::Reject { retry_after } => assert_eq!(retry_after, Duration::from_secs(21)),
            other => panic!("expected reject, got {other:?}"),
        }
    }

    #[test]
    fn dropped_probe_frees_the_slot() {
        let guard = AbuseGuard::new();
        let cfg = config();
        open(&guard, &cfg, 0);
        let gate = guard.check(&subject(), &cfg, 30_000);
        assert!(matches!(gate, Gate::Probe(_)));
        drop(gate);
        assert!(matches!(guard.check(&subject(), &cfg, 30_001), Gate::Probe(_)));
    }

    #[test]
    fn disabled_never_opens() {
        let guard = AbuseGuard::new();
        let cfg = BreakerConfig::disabled();
        for t in 0..1_000 {
            assert_eq!(guard.record_violation(&subject(), &cfg, t), None);
        }
        assert!(matches!(guard.check(&subject(), &cfg, 1_000), Gate::Pass));
    }

    #[test]
    fn sweep_forgets_quiet_closed_circuits() {
        let guard = AbuseGuard::new();
        let cfg = config();
        guard.record_violation(&subject(), &cfg, 0);
        guard.record_violation(&IdentityKey::new(Scope::Ip, "1.2.3.4"), &cfg, 0);
        open(&guard, &cfg, 0);
        assert_eq!(guard.sweep(&cfg, 20_000), 1);
        assert_eq!(guard.len(), 1);
    }

    #[test]
    fn sweep_keeps_cooling_circuits_and_drops_expired_ones() {
        let guard = AbuseGuard::new();
        let cfg = config();
        open(&guard, &cfg, 0);
        let late = IdentityKey::new(Scope::Ip, "198.51.100.7");
        for _ in 0..cfg.violation_threshold() {
            guard.record_violation(&late, &cfg, 35_000);
        }

        // Cooldown 30s + window 10s: the first circuit expires at 40s.
        assert_eq!(guard.sweep(&cfg, 39_999), 0);
        assert_eq!(guard.sweep(&cfg, 40_000), 1);
        assert!(guard.snapshot(&subject(), &cfg, 40_000).is_none());
        assert_eq!(guard.snapshot(&late, &cfg, 40_000).unwrap().status, CircuitStatus::Open);
        assert!(matches!(guard.check(&subject(), &cfg, 40_001), Gate::Pass));
    }

    #[test]
    fn sweep_spares_held_permit_and_drops_abandoned_one() {
        let guard = AbuseGuard::new();
        let cfg = config();
        open(&guard, &cfg, 0);
        let Gate::Probe(permit) = guard.check(&subject(), &cfg, 30_000) else {
            panic!("expected half-open permit");
        };
        assert_eq!(guard.sweep(&cfg, 100_000), 0);
        drop(permit);
        assert_eq!(guard.sweep(&cfg, 100_000), 1);
        assert!(guard.is_empty());
    }

    #[test]
    fn violation_after_sweep_starts_a_fresh_entry() {
        let guard = AbuseGuard::new();
        let cfg = config();
        open(&guard, &cfg, 0);
        assert_eq!(guard.sweep(&cfg, 50_000), 1);
        assert_eq!(guard.record_violation(&subject(), &cfg, 50_000), None);
        let snap = guard.snapshot(&subject(), &cfg, 50_000).unwrap();
        assert_eq!(snap.status, CircuitStatus::Closed);
        assert_eq!(snap.violation_count, 1);
    }

    #[test]
    fn concurrent_checks_issue_one_probe() {
        let guard = Arc::new(AbuseGuard::new());
        let cfg = config();
        open(&guard, &cfg, 0);

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let guard = guard.clone();
                let cfg = cfg.clone();
                std::thread::spawn(move || match guard.check(&subject(), &cfg, 30_000) {
                    Gate::Probe(p) => {
                        std::mem::forget(p);
                        1usize
                    }
                    _ => 0usize,
                })
            })
            .collect();
        let probes: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(probes, 1);
    }
}
