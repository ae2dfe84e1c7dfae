//! Request identities and the keys counter state is tracked against.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

/// Key value used for requests whose source IP cannot be parsed.
pub const ANONYMOUS: &str = "anonymous";

/// Scope a policy applies to.
///
/// Declaration order is evaluation order: global, endpoint, api key, user, ip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// One budget shared by every request.
    Global,
    /// Budget attached to an endpoint rule.
    Endpoint,
    /// Budget per API key, optionally tiered.
    ApiKey,
    /// Budget per authenticated user, optionally tiered by role.
    User,
    /// Budget per source IP.
    Ip,
}

impl Scope {
    /// Stable lowercase label for logs, metrics and storage keys.
    pub fn as_str(self) -> &'static str {
        match self {
            Scope::Global => "global",
            Scope::Endpoint => "endpoint",
            Scope::ApiKey => "api_key",
            Scope::User => "user",
            Scope::Ip => "ip",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Composite identifier of one counter: which policy, which scope, which value.
///
/// Two policies never share counter state even when they target the same
/// `(scope, value)`, so the policy id is part of the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PolicyKey {
    /// Identifier of the policy owning this counter.
    pub policy: Arc<str>,
    /// Scope of the policy.
    pub scope: Scope,
    /// Scope value, e.g. a user id, an IP or an endpoint pattern.
    pub value: Arc<str>,
}

impl PolicyKey {
    /// Build a key.
    pub fn new(policy: impl Into<Arc<str>>, scope: Scope, value: impl Into<Arc<str>>) -> Self {
        Self { policy: policy.into(), scope, value: value.into() }
    }

    /// Flat string form used by shared stores: `<policy>/<scope>/<value>`.
    pub fn storage_key(&self) -> String {
        format!("{}/{}/{}", self.policy, self.scope, self.value)
    }
}

impl fmt::Display for PolicyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {:?})", self.scope, self.value)
    }
}

/// Identity a circuit breaker tracks, independent of any policy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdentityKey {
    /// Kind of identity.
    pub scope: Scope,
    /// Identity value.
    pub value: Arc<str>,
}

impl IdentityKey {
    /// Build an identity key.
    pub fn new(scope: Scope, value: impl Into<Arc<str>>) -> Self {
        Self { scope, value: value.into() }
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scope, self.value)
    }
}

/// Who is making a request, as reported by the host pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestIdentity {
    /// Authenticated user id, if any.
    pub user_id: Option<String>,
    /// Source IP exactly as seen by the host (may be malformed).
    pub ip: String,
    /// API key, if the request carried one.
    pub api_key: Option<String>,
    /// Role or permission tier used to pick tiered limits and role exemptions.
    pub tier: Option<String>,
}

impl RequestIdentity {
    /// Anonymous request from `ip`.
    pub fn from_ip(ip: impl Into<String>) -> Self {
        Self { ip: ip.into(), ..Self::default() }
    }

    /// Attach an authenticated user.
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Attach an API key.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Attach a role / tier.
    pub fn with_tier(mut self, tier: impl Into<String>) -> Self {
        self.tier = Some(tier.into());
        self
    }

    /// Parse the source IP. Proxies and header quirks produce junk here, so
    /// callers treat `None` as the anonymous bucket rather than an error.
    pub fn parsed_ip(&self) -> Option<IpAddr> {
        let raw = self.ip.trim();
        raw.parse::<IpAddr>().ok().or_else(|| {
            // "[::1]:443" and "1.2.3.4:80" both show up from forwarded headers.
            raw.parse::<std::net::SocketAddr>().ok().map(|sa| sa.ip())
        })
    }

    /// Canonical IP key value, or [`ANONYMOUS`] when unparseable.
    pub fn ip_key_value(&self) -> Arc<str> {
        match self.parsed_ip() {
            Some(ip) => Arc::from(ip.to_string()),
            None => Arc::from(ANONYMOUS),
        }
    }

    /// The finest-grained identity present: user, then api key, then ip.
    pub fn breaker_subject(&self) -> IdentityKey {
        if let Some(user) = &self.user_id {
            IdentityKey::new(Scope::User, user.as_str())
        } else if let Some(key) = &self.api_key {
            IdentityKey::new(Scope::ApiKey, key.as_str())
        } else {
            IdentityKey::new(Scope::Ip, self.ip_key_value())
        }
    }
}
