//! JSON configuration and live policy reload.
//!
//! ```json
//! {
//!   "global": { "algorithm": "token_bucket", "capacity": 1000, "refill_per_sec": 500 },
//!   "endpoints": [
//!     { "pattern": "/login", "partition_by": "ip", "sensitive": true,
//!       "limit": { "algorithm": "sliding_window_log", "limit": 5, "window_secs": 60 } }
//!   ],
//!   "user_tiers": { "premium": { "algorithm": "fixed_window", "limit": 600, "window_secs": 60 } },
//!   "exemptions": { "cidrs": ["10.0.0.0/8"] },
//!   "breaker": { "violation_threshold": 10, "observation_window_secs": 60, "cooldown_secs": 300 }
//! }
//! ```
//!
//! [`AdmissionConfig`] is the raw document; [`PolicySet::from_config`]
//! validates it. [`PolicyHandle`] holds the live set and swaps it atomically.

use crate::algorithm::{Algorithm, FixedWindow, SlidingWindowLog, TokenBucket};
use crate::breaker::BreakerConfig;
use crate::error::{AlgorithmError, ConfigError};
use crate::exemption::{Cidr, Exemptions};
use crate::key::Scope;
use crate::policy::{EndpointPattern, FailureMode, Partition, Policy, PolicySet};
use crate::range_guard::RangeGuardConfig;
use crate::reporter::AlertConfig;
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Algorithm and parameters for one limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "snake_case")]
pub enum LimitConfig {
    /// Token bucket.
    TokenBucket {
        /// Tokens a fresh key starts with.
        capacity: u64,
        /// Tokens added per second.
        refill_per_sec: f64,
        /// Tokens an idle key may bank; defaults to `capacity`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        burst: Option<u64>,
    },
    /// Sliding window log.
    SlidingWindowLog {
        /// Requests allowed per rolling window.
        limit: u64,
        /// Window length in seconds.
        window_secs: u64,
    },
    /// Fixed window counter.
    FixedWindow {
        /// Requests allowed per window.
        limit: u64,
        /// Window length in seconds.
        window_secs: u64,
    },
}

impl LimitConfig {
    /// Build the validated algorithm.
    pub fn to_algorithm(&self) -> Result<Algorithm, AlgorithmError> {
        Ok(match *self {
            LimitConfig::TokenBucket { capacity, refill_per_sec, burst } => {
                TokenBucket::with_burst(capacity, refill_per_sec, burst.unwrap_or(capacity))?
                    .into()
            }
            LimitConfig::SlidingWindowLog { limit, window_secs } => {
                SlidingWindowLog::new(limit, Duration::from_secs(window_secs))?.into()
            }
            LimitConfig::FixedWindow { limit, window_secs } => {
                FixedWindow::new(limit, Duration::from_secs(window_secs))?.into()
            }
        })
    }
}

/// One endpoint rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndpointConfig {
    /// `"/exact"`, `"/prefix/*"` or `"*"`.
    pub pattern: String,
    /// The limit.
    pub limit: LimitConfig,
    /// Split the budget per identity field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_by: Option<Partition>,
    /// Fail closed and treat outages as critical.
    #[serde(default)]
    pub sensitive: bool,
    /// Explicit failure mode; overrides `sensitive` when both are given.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_mode: Option<FailureMode>,
}

/// Trusted identities.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExemptionConfig {
    /// CIDR ranges or bare addresses.
    pub cidrs: Vec<String>,
    /// User ids.
    pub users: Vec<String>,
    /// Roles / tiers.
    pub roles: Vec<String>,
    /// API keys.
    pub api_keys: Vec<String>,
}

/// Abuse breaker thresholds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BreakerSection {
    /// `false` turns the breaker off.
    pub enabled: bool,
    /// Violations that open a circuit.
    pub violation_threshold: u32,
    /// Rolling window for violations, seconds.
    pub observation_window_secs: u64,
    /// Open duration before the probe, seconds.
    pub cooldown_secs: u64,
}

impl Default for BreakerSection {
    fn default() -> Self {
        let d = BreakerConfig::default();
        Self {
            enabled: true,
            violation_threshold: d.violation_threshold(),
            observation_window_secs: d.observation_window().as_secs(),
            cooldown_secs: d.cooldown().as_secs(),
        }
    }
}

/// IP-range spike detection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RangeGuardSection {
    /// Distinct addresses from one range that trip a block.
    pub distinct_ips: usize,
    /// Interval they are counted in, seconds.
    pub interval_secs: u64,
    /// Block length, seconds.
    pub cooldown_secs: u64,
    /// IPv4 grouping prefix.
    #[serde(default = "default_ipv4_prefix")]
    pub ipv4_prefix: u8,
    /// IPv6 grouping prefix.
    #[serde(default = "default_ipv6_prefix")]
    pub ipv6_prefix: u8,
}

fn default_ipv4_prefix() -> u8 {
    24
}

fn default_ipv6_prefix() -> u8 {
    64
}

/// Violation alerting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AlertSection {
    /// Per-key violations per window that raise an alert.
    pub key_threshold: Option<u64>,
    /// Per-endpoint violations per window that raise an alert.
    pub endpoint_threshold: Option<u64>,
    /// Threshold window, seconds.
    pub window_secs: u64,
    /// Alerts allowed per suppression window.
    pub max_alerts: u64,
    /// Suppression window, seconds.
    pub suppression_window_secs: u64,
    /// Aggregation bucket width, seconds.
    pub bucket_secs: u64,
    /// Aggregation retention, seconds.
    pub retention_secs: u64,
}

impl Default for AlertSection {
    fn default() -> Self {
        let d = AlertConfig::default();
        Self {
            key_threshold: d.key_threshold,
            endpoint_threshold: d.endpoint_threshold,
            window_secs: d.window.as_secs(),
            max_alerts: d.max_alerts,
            suppression_window_secs: d.suppression_window.as_secs(),
            bucket_secs: d.bucket.as_secs(),
            retention_secs: d.retention.as_secs(),
        }
    }
}

impl From<&AlertSection> for AlertConfig {
    fn from(s: &AlertSection) -> Self {
        AlertConfig {
            key_threshold: s.key_threshold,
            endpoint_threshold: s.endpoint_threshold,
            window: Duration::from_secs(s.window_secs),
            max_alerts: s.max_alerts,
            suppression_window: Duration::from_secs(s.suppression_window_secs),
            bucket: Duration::from_secs(s.bucket_secs),
            retention: Duration::from_secs(s.retention_secs),
        }
    }
}

fn default_safety_factor() -> f64 {
    crate::policy::DEFAULT_EVICTION_SAFETY_FACTOR
}

/// The full configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdmissionConfig {
    /// Limit shared by every request.
    pub global: LimitConfig,
    /// Endpoint rules.
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
    /// Default per-user limit.
    #[serde(default)]
    pub user: Option<LimitConfig>,
    /// Per-user limits by role.
    #[serde(default)]
    pub user_tiers: BTreeMap<String, LimitConfig>,
    /// Default per-API-key limit.
    #[serde(default)]
    pub api_key: Option<LimitConfig>,
    /// Per-API-key limits by tier.
    #[serde(default)]
    pub api_key_tiers: BTreeMap<String, LimitConfig>,
    /// Per-IP limit.
    #[serde(default)]
    pub ip: Option<LimitConfig>,
    /// Failure mode for every policy not set otherwise.
    #[serde(default)]
    pub default_failure_mode: FailureMode,
    /// Trusted identities.
    #[serde(default)]
    pub exemptions: ExemptionConfig,
    /// Abuse breaker.
    #[serde(default)]
    pub breaker: BreakerSection,
    /// IP-range spike detection; off when absent.
    #[serde(default)]
    pub range_guard: Option<RangeGuardSection>,
    /// Violation alerting.
    #[serde(default)]
    pub alerts: AlertSection,
    /// Multiplier on each policy's idle horizon used as its eviction TTL.
    #[serde(default = "default_safety_factor")]
    pub eviction_safety_factor: f64,
}

impl AdmissionConfig {
    /// Parse a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read and parse a JSON file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }
}

impl PolicySet {
    /// Validate a configuration document into a policy set.
    pub fn from_config(config: &AdmissionConfig) -> Result<PolicySet, ConfigError> {
        let mode = config.default_failure_mode;
        let policy = |id: String, scope: Scope, limit: &LimitConfig| -> Result<Policy, ConfigError> {
            let algorithm = limit
                .to_algorithm()
                .map_err(|source| ConfigError::InvalidPolicy { policy: id.clone(), source })?;
            Ok(Policy::new(id, scope, algorithm).with_failure_mode(mode))
        };

        let mut builder = PolicySet::builder(policy("global".into(), Scope::Global, &config.global)?);

        for rule in &config.endpoints {
            let pattern = EndpointPattern::parse(&rule.pattern)?;
            let mut p = policy(format!("endpoint:{pattern}"), Scope::Endpoint, &rule.limit)?;
            if rule.sensitive {
                p = p.sensitive();
            }
            if let Some(explicit) = rule.failure_mode {
                p = p.with_failure_mode(explicit);
            }
            builder = builder.partitioned_endpoint(pattern, p, rule.partition_by);
        }

        if let Some(limit) = &config.user {
            builder = builder.user(policy("user".into(), Scope::User, limit)?);
        }
        for (tier, limit) in &config.user_tiers {
            builder = builder.user_tier(tier.clone(), policy(format!("user:{tier}"), Scope::User, limit)?);
        }
        if let Some(limit) = &config.api_key {
            builder = builder.api_key(policy("api_key".into(), Scope::ApiKey, limit)?);
        }
        for (tier, limit) in &config.api_key_tiers {
            builder = builder
                .api_key_tier(tier.clone(), policy(format!("api_key:{tier}"), Scope::ApiKey, limit)?);
        }
        if let Some(limit) = &config.ip {
            builder = builder.ip(policy("ip".into(), Scope::Ip, limit)?);
        }

        let mut exemptions = Exemptions::new();
        for raw in &config.exemptions.cidrs {
            exemptions = exemptions.with_cidr(raw.parse::<Cidr>()?);
        }
        for user in &config.exemptions.users {
            exemptions = exemptions.with_user(user.clone());
        }
        for role in &config.exemptions.roles {
            exemptions = exemptions.with_role(role.clone());
        }
        for key in &config.exemptions.api_keys {
            exemptions = exemptions.with_api_key(key.clone());
        }
        builder = builder.exemptions(exemptions);

        let b = &config.breaker;
        let breaker = if b.enabled {
            BreakerConfig::new(
                b.violation_threshold,
                Duration::from_secs(b.observation_window_secs),
                Duration::from_secs(b.cooldown_secs),
            )
            .map_err(|e| ConfigError::InvalidBreaker(e.to_string()))?
        } else {
            BreakerConfig::disabled()
        };
        builder = builder.breaker(breaker);

        if let Some(r) = &config.range_guard {
            let guard = RangeGuardConfig::new(
                r.distinct_ips,
                Duration::from_secs(r.interval_secs),
                Duration::from_secs(r.cooldown_secs),
            )?
            .with_prefixes(r.ipv4_prefix, r.ipv6_prefix)?;
            builder = builder.range_guard(guard);
        }

        let alerts = AlertConfig::from(&config.alerts);
        alerts.validate()?;

        builder
            .alerts(alerts)
            .eviction_safety_factor(config.eviction_safety_factor)
            .build()
    }
}

/// The live policy set.
///
/// Readers take a snapshot with [`get`](Self::get) and keep using it for the
/// whole evaluation; [`set`](Self::set) replaces the set for later readers.
/// Clones share the same cell.
#[derive(Debug, Clone)]
pub struct PolicyHandle {
    inner: Arc<ArcSwap<PolicySet>>,
}

impl PolicyHandle {
    /// Handle holding `policies`.
    pub fn new(policies: PolicySet) -> Self {
        Self { inner: Arc::new(ArcSwap::from_pointee(policies)) }
    }

    /// Snapshot the current set.
    pub fn get(&self) -> Arc<PolicySet> {
        self.inner.load_full()
    }

    /// Replace the set.
    pub fn set(&self, policies: PolicySet) {
        self.inner.store(Arc::new(policies));
    }
}
