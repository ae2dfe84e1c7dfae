//! Maps a request to the policies that apply to it.
//!
//! Resolution is pure: it reads the [`PolicySet`] snapshot and the request
//! identity and never touches counter state. A request with no matching
//! endpoint rule and no identifiers still resolves to the global policy.

use crate::key::{IdentityKey, PolicyKey, RequestIdentity, Scope, ANONYMOUS};
use crate::policy::{EndpointRule, Partition, Policy, PolicySet};
use std::net::IpAddr;
use std::sync::Arc;

/// Key value of the global policy's single counter.
pub const GLOBAL_KEY: &str = "*";

/// One policy to evaluate and the counter it is evaluated against.
#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    /// Policy to apply.
    pub policy: Arc<Policy>,
    /// Counter key.
    pub key: PolicyKey,
}

/// A resolved request.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedRequest {
    /// Targets in evaluation order: global, endpoint, api key, user, ip.
    pub targets: Vec<Target>,
    /// Identity the abuse breaker tracks.
    pub subject: IdentityKey,
    /// Parsed source IP, if it parsed.
    pub ip: Option<IpAddr>,
    /// Request path without query string or fragment.
    pub endpoint: Arc<str>,
}

/// Outcome of [`PolicyResolver::resolve`].
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Trusted identity; skip evaluation.
    Exempt,
    /// Evaluate the listed targets.
    Evaluate(ResolvedRequest),
}

/// Resolves requests against one policy set snapshot.
#[derive(Debug, Clone, Copy)]
pub struct PolicyResolver<'a> {
    policies: &'a PolicySet,
}

impl<'a> PolicyResolver<'a> {
    /// Resolver over `policies`.
    pub fn new(policies: &'a PolicySet) -> Self {
        Self { policies }
    }

    /// Resolve `identity` calling `endpoint`.
    pub fn resolve(&self, identity: &RequestIdentity, endpoint: &str) -> Resolution {
        if self.policies.exemptions().is_exempt(identity) {
            tracing::trace!(endpoint, "exempt identity; skipping evaluation");
            return Resolution::Exempt;
        }

        let path = strip_query(endpoint);
        let ip = identity.parsed_ip();
        if ip.is_none() {
            tracing::debug!(raw_ip = %identity.ip, "unparseable source ip; using anonymous bucket");
        }
        let ip_value = identity.ip_key_value();
        let tier = identity.tier.as_deref();

        let mut targets = Vec::with_capacity(5);
        let global = self.policies.global();
        targets.push(target(global, Scope::Global, Arc::from(GLOBAL_KEY)));

        if let Some(rule) = self.policies.endpoint_rule(path) {
            targets.push(target(&rule.policy, Scope::Endpoint, endpoint_value(rule, identity, &ip_value)));
        }
        if let Some(key) = &identity.api_key {
            if let Some(policy) = self.policies.api_key_policy(tier) {
                targets.push(target(policy, Scope::ApiKey, Arc::from(key.as_str())));
            }
        }
        if let Some(user) = &identity.user_id {
            if let Some(policy) = self.policies.user_policy(tier) {
                targets.push(target(policy, Scope::User, Arc::from(user.as_str())));
            }
        }
        if let Some(policy) = self.policies.ip_policy() {
            targets.push(target(policy, Scope::Ip, ip_value.clone()));
        }

        Resolution::Evaluate(ResolvedRequest {
            targets,
            subject: identity.breaker_subject(),
            ip,
            endpoint: Arc::from(path),
        })
    }
}

fn target(policy: &Arc<Policy>, scope: Scope, value: Arc<str>) -> Target {
    Target { key: PolicyKey::new(policy.id.clone(), scope, value), policy: policy.clone() }
}

fn endpoint_value(rule: &EndpointRule, identity: &RequestIdentity, ip_value: &Arc<str>) -> Arc<str> {
    let Some(partition) = rule.partition_by else {
        return Arc::from(rule.pattern.to_string());
    };
    let field = match partition {
        Partition::Ip => ip_value.as_ref(),
        Partition::User => identity.user_id.as_deref().unwrap_or(ANONYMOUS),
        Partition::ApiKey => identity.api_key.as_deref().unwrap_or(ANONYMOUS),
    };
    Arc::from(format!("{}|{}:{}", rule.pattern, partition.as_str(), field))
}

fn strip_query(endpoint: &str) -> &str {
    let end = endpoint.find(['?', '#']).unwrap_or(endpoint.len());
    &endpoint[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::FixedWindow;
    use crate::exemption::Exemptions;
    use crate::policy::EndpointPattern;
    use std::time::Duration;

    fn fixed(id: &str, scope: Scope) -> Policy {
        Policy::new(id, scope, FixedWindow::new(10, Duration::from_secs(60)).unwrap())
    }

    fn set() -> PolicySet {
        PolicySet::builder(fixed("global", Scope::Global))
            .endpoint(EndpointPattern::parse("/api/*").unwrap(), fixed("endpoint:/api/*", Scope::Endpoint))
            .partitioned_endpoint(
                EndpointPattern::parse("/login").unwrap(),
                fixed("endpoint:/login", Scope::Endpoint),
                Some(Partition::Ip),
            )
            .user(fixed("user", Scope::User))
            .user_tier("premium", fixed("user:premium", Scope::User))
            .api_key(fixed("api_key", Scope::ApiKey))
            .ip(fixed("ip", Scope::Ip))
            .exemptions(Exemptions::new().with_role("internal"))
            .build()
            .unwrap()
    }

    fn evaluate(set: &PolicySet, identity: &RequestIdentity, endpoint: &str) -> ResolvedRequest {
        match PolicyResolver::new(set).resolve(identity, endpoint) {
            Resolution::Evaluate(r) => r,
            Resolution::Exempt => panic!("unexpected exemption"),
        }
    }

    fn ids(resolved: &ResolvedRequest) -> Vec<String> {
        resolved.targets.iter().map(|t| t.policy.id.to_string()).collect()
    }

    #[test]
    fn full_identity_resolves_in_evaluation_order() {
        let set = set();
        let identity = RequestIdentity::from_ip("203.0.113.4")
            .with_user("u1")
            .with_api_key("k1")
            .with_tier("premium");
        let resolved = evaluate(&set, &identity, "/api/items?page=2");
        assert_eq!(ids(&resolved), vec!["global", "endpoint:/api/*", "api_key", "user:premium", "ip"]);
        assert_eq!(&*resolved.endpoint, "/api/items");
        assert_eq!(resolved.subject, IdentityKey::new(Scope::User, "u1"));

        let scopes: Vec<_> = resolved.targets.iter().map(|t| t.key.scope).collect();
        let mut sorted = scopes.clone();
        sorted.sort();
        assert_eq!(scopes, sorted);
    }

    #[test]
    fn unmatched_anonymous_request_gets_global_and_ip() {
        let set = set();
        let resolved = evaluate(&set, &RequestIdentity::from_ip("203.0.113.4"), "/health");
        assert_eq!(ids(&resolved), vec!["global", "ip"]);
        assert_eq!(&*resolved.targets[0].key.value, GLOBAL_KEY);
    }

    #[test]
    fn partitioned_endpoint_keys_include_identity() {
        let set = set();
        let a = evaluate(&set, &RequestIdentity::from_ip("203.0.113.4"), "/login");
        let b = evaluate(&set, &RequestIdentity::from_ip("203.0.113.5"), "/login");
        assert_eq!(&*a.targets[1].key.value, "/login|ip:203.0.113.4");
        assert_ne!(a.targets[1].key, b.targets[1].key);
    }

    #[test]
    fn malformed_ip_uses_anonymous_bucket() {
        let set = set();
        let resolved = evaluate(&set, &RequestIdentity::from_ip("garbage"), "/health");
        assert!(resolved.ip.is_none());
        assert_eq!(&*resolved.targets[1].key.value, ANONYMOUS);
    }

    #[test]
    fn exempt_role_skips_resolution() {
        let set = set();
        let identity = RequestIdentity::from_ip("203.0.113.4").with_tier("internal");
        assert_eq!(PolicyResolver::new(&set).resolve(&identity, "/login"), Resolution::Exempt);
    }
}
