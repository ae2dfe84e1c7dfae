//! The value handed back to the host for every admission check.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// `X-RateLimit-Limit` header name.
pub const HEADER_LIMIT: &str = "X-RateLimit-Limit";
/// `X-RateLimit-Remaining` header name.
pub const HEADER_REMAINING: &str = "X-RateLimit-Remaining";
/// `X-RateLimit-Reset` header name (epoch seconds).
pub const HEADER_RESET: &str = "X-RateLimit-Reset";
/// `Retry-After` header name (seconds).
pub const HEADER_RETRY_AFTER: &str = "Retry-After";

/// Machine-readable reason attached to every deny.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    /// A policy budget is exhausted.
    RateLimited,
    /// The abuse guard has blanket-rejected this identity or its IP range.
    CircuitOpen,
    /// Counter state could not be reached and the policy fails closed.
    StoreUnavailable,
}

impl DenyReason {
    /// Wire label used in deny bodies, logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            DenyReason::RateLimited => "rate_limited",
            DenyReason::CircuitOpen => "circuit_open",
            DenyReason::StoreUnavailable => "store_unavailable",
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of an admission check.
///
/// Ephemeral: produced per request, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    /// Whether the request may proceed now.
    pub allowed: bool,
    /// Budget size of the reporting policy.
    pub limit: u64,
    /// Units left in the reporting policy after this request.
    pub remaining: u64,
    /// Epoch milliseconds at which the reporting policy's budget recovers.
    pub reset_at_ms: u64,
    /// How long the caller should wait before retrying; zero when allowed.
    pub retry_after: Duration,
    /// Why the request was denied, if it was.
    pub reason: Option<DenyReason>,
    /// Policy that produced the reported numbers, if any.
    pub policy: Option<Arc<str>>,
    /// True when evaluation was skipped for a trusted identity.
    pub exempt: bool,
}

impl Decision {
    /// An allow carrying the policy's counters.
    pub fn allow(limit: u64, remaining: u64, reset_at_ms: u64) -> Self {
        Self {
            allowed: true,
            limit,
            remaining,
            reset_at_ms,
            retry_after: Duration::ZERO,
            reason: None,
            policy: None,
            exempt: false,
        }
    }

    /// A deny carrying the policy's counters and a retry hint.
    pub fn deny(
        reason: DenyReason,
        limit: u64,
        remaining: u64,
        reset_at_ms: u64,
        retry_after: Duration,
    ) -> Self {
        Self {
            allowed: false,
            limit,
            remaining,
            reset_at_ms,
            retry_after,
            reason: Some(reason),
            policy: None,
            exempt: false,
        }
    }

    /// Allow for an exempt identity; carries no counters.
    pub fn exempt(now_ms: u64) -> Self {
        Self { exempt: true, ..Self::allow(0, 0, now_ms) }
    }

    /// Tag the decision with the policy that produced it.
    pub fn with_policy(mut self, policy: impl Into<Arc<str>>) -> Self {
        self.policy = Some(policy.into());
        self
    }

    /// Shorthand for `!allowed`.
    pub fn is_denied(&self) -> bool {
        !self.allowed
    }

    /// Retry hint in whole seconds, rounded up; at least 1 for any deny.
    pub fn retry_after_secs(&self) -> u64 {
        if self.allowed {
            return 0;
        }
        let millis = u64::try_from(self.retry_after.as_millis()).unwrap_or(u64::MAX);
        millis.div_ceil(1000).max(1)
    }

    /// Reset instant in epoch seconds, rounded up.
    pub fn reset_epoch_secs(&self) -> u64 {
        self.reset_at_ms.div_ceil(1000)
    }

    /// HTTP status the host should answer with.
    pub fn status_code(&self) -> u16 {
        match self.reason {
            None => 200,
            Some(DenyReason::StoreUnavailable) => 503,
            Some(DenyReason::RateLimited | DenyReason::CircuitOpen) => 429,
        }
    }

    /// Response headers for the host to attach. Exempt requests get none.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        if self.exempt {
            return Vec::new();
        }
        let mut headers = vec![
            (HEADER_LIMIT, self.limit.to_string()),
            (HEADER_REMAINING, self.remaining.to_string()),
            (HEADER_RESET, self.reset_epoch_secs().to_string()),
        ];
        if !self.allowed {
            headers.push((HEADER_RETRY_AFTER, self.retry_after_secs().to_string()));
        }
        headers
    }

    /// Serializable body for deny responses.
    pub fn deny_body(&self) -> Option<DenyBody> {
        self.reason
            .map(|reason| DenyBody { error: reason, retry_after_secs: self.retry_after_secs() })
    }
}

/// JSON body returned with a deny: `{"error": "rate_limited", "retry_after_secs": 3}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DenyBody {
    /// Machine-readable reason.
    pub error: DenyReason,
    /// Numeric retry hint.
    pub retry_after_secs: u64,
}
