//! Policies and the immutable policy set they are loaded into.
//!
//! A [`PolicySet`] is built once (from code or from
//! [`AdmissionConfig`](crate::config::AdmissionConfig)) and never mutated;
//! reconfiguration builds a new set and swaps it in whole.

use crate::algorithm::Algorithm;
use crate::breaker::BreakerConfig;
use crate::error::ConfigError;
use crate::exemption::Exemptions;
use crate::key::Scope;
use crate::range_guard::RangeGuardConfig;
use crate::reporter::AlertConfig;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Default multiplier applied to a policy's idle horizon to get its eviction TTL.
pub const DEFAULT_EVICTION_SAFETY_FACTOR: f64 = 2.0;

/// What to do when counter state cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Admit the request and log a degraded-mode event.
    #[default]
    FailOpen,
    /// Deny with [`DenyReason::StoreUnavailable`](crate::DenyReason::StoreUnavailable).
    FailClosed,
}

/// A single rate limit: scope, algorithm and failure behaviour.
#[derive(Debug, Clone, PartialEq)]
pub struct Policy {
    /// Stable identifier, used in counter keys, decisions and logs.
    pub id: Arc<str>,
    /// Which request dimension the policy is keyed on.
    pub scope: Scope,
    /// Decision function and its parameters.
    pub algorithm: Algorithm,
    /// Behaviour when the counter store fails.
    pub failure_mode: FailureMode,
    /// Whether a fail-closed outage of this policy is a critical condition.
    pub critical: bool,
    idle_ttl: Duration,
}

impl Policy {
    /// A fail-open, non-critical policy.
    pub fn new(id: impl Into<Arc<str>>, scope: Scope, algorithm: impl Into<Algorithm>) -> Self {
        let algorithm = algorithm.into();
        let idle_ttl = scaled(algorithm.idle_horizon(), DEFAULT_EVICTION_SAFETY_FACTOR);
        Self {
            id: id.into(),
            scope,
            algorithm,
            failure_mode: FailureMode::FailOpen,
            critical: false,
            idle_ttl,
        }
    }

    /// Set the failure mode.
    pub fn with_failure_mode(mut self, mode: FailureMode) -> Self {
        self.failure_mode = mode;
        self
    }

    /// Fail closed and flag outages as critical (auth-sensitive endpoints).
    pub fn sensitive(mut self) -> Self {
        self.failure_mode = FailureMode::FailClosed;
        self.critical = true;
        self
    }

    /// How long a key of this policy may sit idle before it is evicted.
    pub fn idle_ttl(&self) -> Duration {
        self.idle_ttl
    }

    fn with_safety_factor(mut self, factor: f64) -> Self {
        self.idle_ttl = scaled(self.algorithm.idle_horizon(), factor);
        self
    }
}

fn scaled(horizon: Duration, factor: f64) -> Duration {
    Duration::try_from_secs_f64(horizon.as_secs_f64() * factor).unwrap_or(Duration::MAX)
}

/// Path matcher for endpoint rules.
///
/// `"/login"` matches exactly, `"/api/*"` matches by prefix, `"*"` matches
/// everything. When several rules match, exact beats prefix, longer prefix
/// beats shorter, and the wildcard comes last.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EndpointPattern {
    /// Whole-path match.
    Exact(String),
    /// Match any path starting with the stored prefix.
    Prefix(String),
    /// Match every path.
    Any,
}

impl EndpointPattern {
    /// Parse a pattern string.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let raw = raw.trim();
        if raw == "*" {
            return Ok(EndpointPattern::Any);
        }
        if !raw.starts_with('/') {
            return Err(ConfigError::InvalidPattern(format!("'{raw}' must start with '/'")));
        }
        match raw.find('*') {
            None => Ok(EndpointPattern::Exact(raw.to_string())),
            Some(idx) if idx == raw.len() - 1 => {
                Ok(EndpointPattern::Prefix(raw[..idx].to_string()))
            }
            Some(_) => Err(ConfigError::InvalidPattern(format!(
                "'{raw}': '*' is only allowed as the final character"
            ))),
        }
    }

    /// Whether `path` (without query string) matches.
    pub fn matches(&self, path: &str) -> bool {
        match self {
            EndpointPattern::Exact(p) => p == path,
            EndpointPattern::Prefix(p) => path.starts_with(p.as_str()),
            EndpointPattern::Any => true,
        }
    }

    // Higher sorts first.
    fn specificity(&self) -> (u8, usize) {
        match self {
            EndpointPattern::Exact(p) => (2, p.len()),
            EndpointPattern::Prefix(p) => (1, p.len()),
            EndpointPattern::Any => (0, 0),
        }
    }
}

impl fmt::Display for EndpointPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointPattern::Exact(p) => f.write_str(p),
            EndpointPattern::Prefix(p) => write!(f, "{p}*"),
            EndpointPattern::Any => f.write_str("*"),
        }
    }
}

/// Identity field an endpoint budget can be split on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Partition {
    /// One budget per source IP.
    Ip,
    /// One budget per authenticated user (anonymous callers share one).
    User,
    /// One budget per API key (keyless callers share one).
    ApiKey,
}

impl Partition {
    /// Field label used in counter keys.
    pub fn as_str(self) -> &'static str {
        match self {
            Partition::Ip => "ip",
            Partition::User => "user",
            Partition::ApiKey => "api_key",
        }
    }
}

/// An endpoint policy and the paths it applies to.
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointRule {
    /// Paths covered.
    pub pattern: EndpointPattern,
    /// Limit applied to matching requests.
    pub policy: Arc<Policy>,
    /// Optional per-identity split of the budget.
    pub partition_by: Option<Partition>,
}

/// The complete, immutable set of policies plus guard settings.
#[derive(Debug, Clone)]
pub struct PolicySet {
    pub(crate) global: Arc<Policy>,
    // Sorted most specific first.
    pub(crate) endpoints: Vec<EndpointRule>,
    pub(crate) user: Option<Arc<Policy>>,
    pub(crate) user_tiers: HashMap<String, Arc<Policy>>,
    pub(crate) api_key: Option<Arc<Policy>>,
    pub(crate) api_key_tiers: HashMap<String, Arc<Policy>>,
    pub(crate) ip: Option<Arc<Policy>>,
    pub(crate) exemptions: Exemptions,
    pub(crate) breaker: BreakerConfig,
    pub(crate) range_guard: Option<RangeGuardConfig>,
    pub(crate) alerts: AlertConfig,
}

impl PolicySet {
    /// Start building a set around the mandatory global policy.
    pub fn builder(global: Policy) -> PolicySetBuilder {
        PolicySetBuilder {
            global,
            endpoints: Vec::new(),
            user: None,
            user_tiers: HashMap::new(),
            api_key: None,
            api_key_tiers: HashMap::new(),
            ip: None,
            exemptions: Exemptions::default(),
            breaker: BreakerConfig::default(),
            range_guard: None,
            alerts: AlertConfig::default(),
            eviction_safety_factor: DEFAULT_EVICTION_SAFETY_FACTOR,
        }
    }

    /// The global policy.
    pub fn global(&self) -> &Arc<Policy> {
        &self.global
    }

    /// Endpoint rules, most specific first.
    pub fn endpoints(&self) -> &[EndpointRule] {
        &self.endpoints
    }

    /// Most specific endpoint rule matching `path`, if any.
    pub fn endpoint_rule(&self, path: &str) -> Option<&EndpointRule> {
        self.endpoints.iter().find(|rule| rule.pattern.matches(path))
    }

    /// Per-user policy for `tier`, falling back to the default user policy.
    pub fn user_policy(&self, tier: Option<&str>) -> Option<&Arc<Policy>> {
        tier.and_then(|t| self.user_tiers.get(t)).or(self.user.as_ref())
    }

    /// Per-API-key policy for `tier`, falling back to the default key policy.
    pub fn api_key_policy(&self, tier: Option<&str>) -> Option<&Arc<Policy>> {
        tier.and_then(|t| self.api_key_tiers.get(t)).or(self.api_key.as_ref())
    }

    /// Per-IP policy.
    pub fn ip_policy(&self) -> Option<&Arc<Policy>> {
        self.ip.as_ref()
    }

    /// Trusted identities and ranges.
    pub fn exemptions(&self) -> &Exemptions {
        &self.exemptions
    }

    /// Abuse breaker thresholds.
    pub fn breaker(&self) -> &BreakerConfig {
        &self.breaker
    }

    /// IP-range spike detection, if enabled.
    pub fn range_guard(&self) -> Option<&RangeGuardConfig> {
        self.range_guard.as_ref()
    }

    /// Violation alert thresholds.
    pub fn alerts(&self) -> &AlertConfig {
        &self.alerts
    }

    /// Every policy in the set, global first.
    pub fn policies(&self) -> impl Iterator<Item = &Arc<Policy>> {
        std::iter::once(&self.global)
            .chain(self.endpoints.iter().map(|r| &r.policy))
            .chain(self.user.iter())
            .chain(self.user_tiers.values())
            .chain(self.api_key.iter())
            .chain(self.api_key_tiers.values())
            .chain(self.ip.iter())
    }
}

/// Builder for [`PolicySet`].
#[derive(Debug, Clone)]
pub struct PolicySetBuilder {
    global: Policy,
    endpoints: Vec<(EndpointPattern, Policy, Option<Partition>)>,
    user: Option<Policy>,
    user_tiers: HashMap<String, Policy>,
    api_key: Option<Policy>,
    api_key_tiers: HashMap<String, Policy>,
    ip: Option<Policy>,
    exemptions: Exemptions,
    breaker: BreakerConfig,
    range_guard: Option<RangeGuardConfig>,
    alerts: AlertConfig,
    eviction_safety_factor: f64,
}

impl PolicySetBuilder {
    /// Add an endpoint rule with a shared budget.
    pub fn endpoint(self, pattern: EndpointPattern, policy: Policy) -> Self {
        self.partitioned_endpoint(pattern, policy, None)
    }

    /// Add an endpoint rule, optionally split per identity.
    pub fn partitioned_endpoint(
        mut self,
        pattern: EndpointPattern,
        policy: Policy,
        partition_by: Option<Partition>,
    ) -> Self {
        self.endpoints.push((pattern, policy, partition_by));
        self
    }

    /// Default per-user policy.
    pub fn user(mut self, policy: Policy) -> Self {
        self.user = Some(policy);
        self
    }

    /// Per-user policy for one role / tier.
    pub fn user_tier(mut self, tier: impl Into<String>, policy: Policy) -> Self {
        self.user_tiers.insert(tier.into(), policy);
        self
    }

    /// Default per-API-key policy.
    pub fn api_key(mut self, policy: Policy) -> Self {
        self.api_key = Some(policy);
        self
    }

    /// Per-API-key policy for one tier.
    pub fn api_key_tier(mut self, tier: impl Into<String>, policy: Policy) -> Self {
        self.api_key_tiers.insert(tier.into(), policy);
        self
    }

    /// Per-IP policy.
    pub fn ip(mut self, policy: Policy) -> Self {
        self.ip = Some(policy);
        self
    }

    /// Exemption list.
    pub fn exemptions(mut self, exemptions: Exemptions) -> Self {
        self.exemptions = exemptions;
        self
    }

    /// Abuse breaker thresholds.
    pub fn breaker(mut self, breaker: BreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }

    /// Enable IP-range spike detection.
    pub fn range_guard(mut self, config: RangeGuardConfig) -> Self {
        self.range_guard = Some(config);
        self
    }

    /// Violation alert thresholds.
    pub fn alerts(mut self, alerts: AlertConfig) -> Self {
        self.alerts = alerts;
        self
    }

    /// Multiplier on each policy's idle horizon used as its eviction TTL.
    pub fn eviction_safety_factor(mut self, factor: f64) -> Self {
        self.eviction_safety_factor = factor;
        self
    }

    /// Validate and freeze the set.
    pub fn build(self) -> Result<PolicySet, ConfigError> {
        let factor = self.eviction_safety_factor;
        if !factor.is_finite() || factor < 1.0 {
            return Err(ConfigError::InvalidSetting(format!(
                "eviction_safety_factor must be >= 1.0 (got {factor})"
            )));
        }

        let mut ids = HashSet::new();
        let mut freeze = |policy: Policy| -> Result<Arc<Policy>, ConfigError> {
            if !ids.insert(policy.id.clone()) {
                return Err(ConfigError::InvalidSetting(format!(
                    "duplicate policy id '{}'",
                    policy.id
                )));
            }
            Ok(Arc::new(policy.with_safety_factor(factor)))
        };

        let global = freeze(self.global)?;

        let mut seen = HashSet::new();
        let mut endpoints = Vec::with_capacity(self.endpoints.len());
        for (pattern, policy, partition_by) in self.endpoints {
            if !seen.insert(pattern.clone()) {
                return Err(ConfigError::InvalidPattern(format!("duplicate pattern '{pattern}'")));
            }
            endpoints.push(EndpointRule { pattern, policy: freeze(policy)?, partition_by });
        }
        endpoints.sort_by(|a, b| b.pattern.specificity().cmp(&a.pattern.specificity()));

        let user = self.user.map(&mut freeze).transpose()?;
        let user_tiers = self
            .user_tiers
            .into_iter()
            .map(|(tier, p)| Ok((tier, freeze(p)?)))
            .collect::<Result<_, ConfigError>>()?;
        let api_key = self.api_key.map(&mut freeze).transpose()?;
        let api_key_tiers = self
            .api_key_tiers
            .into_iter()
            .map(|(tier, p)| Ok((tier, freeze(p)?)))
            .collect::<Result<_, ConfigError>>()?;
        let ip = self.ip.map(&mut freeze).transpose()?;

        Ok(PolicySet {
            global,
            endpoints,
            user,
            user_tiers,
            api_key,
            api_key_tiers,
            ip,
            exemptions: self.exemptions,
            breaker: self.breaker,
            range_guard: self.range_guard,
            alerts: self.alerts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::{FixedWindow, TokenBucket};

    fn fixed(id: &str, scope: Scope, limit: u64) -> Policy {
        Policy::new(id, scope, FixedWindow::new(limit, Duration::from_secs(60)).unwrap())
    }

    #[test]
    fn pattern_parsing() {
        assert_eq!(EndpointPattern::parse("*").unwrap(), EndpointPattern::Any);
        assert_eq!(
            EndpointPattern::parse("/api/*").unwrap(),
            EndpointPattern::Prefix("/api/".into())
        );
        assert_eq!(
            EndpointPattern::parse("/login").unwrap(),
            EndpointPattern::Exact("/login".into())
        );
        assert!(EndpointPattern::parse("login").is_err());
        assert!(EndpointPattern::parse("/a/*/b").is_err());
    }

    #[test]
    fn most_specific_rule_wins() {
        let set = PolicySet::builder(fixed("global", Scope::Global, 100))
            .endpoint(EndpointPattern::Any, fixed("any", Scope::Endpoint, 50))
            .endpoint(EndpointPattern::parse("/api/*").unwrap(), fixed("api", Scope::Endpoint, 20))
            .endpoint(
                EndpointPattern::parse("/api/admin/*").unwrap(),
                fixed("admin", Scope::Endpoint, 5),
            )
            .endpoint(
                EndpointPattern::parse("/api/login").unwrap(),
                fixed("login", Scope::Endpoint, 3),
            )
            .build()
            .unwrap();

        let pick = |p: &str| set.endpoint_rule(p).map(|r| r.policy.id.to_string());
        assert_eq!(pick("/api/login").as_deref(), Some("login"));
        assert_eq!(pick("/api/admin/users").as_deref(), Some("admin"));
        assert_eq!(pick("/api/items").as_deref(), Some("api"));
        assert_eq!(pick("/health").as_deref(), Some("any"));
    }

    #[test]
    fn duplicate_patterns_and_ids_are_rejected() {
        let dup_pattern = PolicySet::builder(fixed("global", Scope::Global, 10))
            .endpoint(EndpointPattern::Any, fixed("a", Scope::Endpoint, 1))
            .endpoint(EndpointPattern::Any, fixed("b", Scope::Endpoint, 1))
            .build();
        assert!(matches!(dup_pattern, Err(ConfigError::InvalidPattern(_))));

        let dup_id = PolicySet::builder(fixed("global", Scope::Global, 10))
            .ip(fixed("global", Scope::Ip, 1))
            .build();
        assert!(dup_id.is_err());
    }

    #[test]
    fn tiers_fall_back_to_default() {
        let set = PolicySet::builder(fixed("global", Scope::Global, 10))
            .user(fixed("user", Scope::User, 5))
            .user_tier("premium", fixed("user:premium", Scope::User, 50))
            .build()
            .unwrap();
        assert_eq!(&*set.user_policy(Some("premium")).unwrap().id, "user:premium");
        assert_eq!(&*set.user_policy(Some("basic")).unwrap().id, "user");
        assert_eq!(&*set.user_policy(None).unwrap().id, "user");
        assert!(set.api_key_policy(Some("premium")).is_none());
    }

    #[test]
    fn safety_factor_scales_idle_ttl() {
        let bucket = TokenBucket::new(10, 1.0).unwrap();
        let set = PolicySet::builder(Policy::new("global", Scope::Global, bucket))
            .eviction_safety_factor(3.0)
            .build()
            .unwrap();
        assert_eq!(set.global().idle_ttl(), Duration::from_secs(30));
        assert_eq!(set.policies().count(), 1);
    }

    #[test]
    fn sensitive_policy_fails_closed() {
        let p = fixed("login", Scope::Endpoint, 5).sensitive();
        assert_eq!(p.failure_mode, FailureMode::FailClosed);
        assert!(p.critical);
    }
}
