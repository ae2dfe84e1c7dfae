//! Error types for admission control.
//!
//! Nothing here escapes [`AdmissionService::evaluate`](crate::AdmissionService::evaluate):
//! store failures are resolved into a [`Decision`] by the policy's failure mode,
//! and configuration errors surface only when a policy set is built or loaded.

use crate::decision::Decision;
use std::fmt;
use std::time::Duration;

/// Failures reaching or updating counter state.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum StoreError {
    /// The backing store cannot be reached.
    #[error("counter store unavailable: {reason}")]
    Unavailable {
        /// Backend-specific detail.
        reason: String,
    },
    /// The backing store did not answer within the latency budget.
    #[error("counter store timed out after {elapsed:?}")]
    Timeout {
        /// Time spent waiting before giving up.
        elapsed: Duration,
    },
    /// Optimistic concurrency kept losing races.
    #[error("counter store contention: gave up after {attempts} compare-and-swap attempts")]
    Contention {
        /// Attempts made.
        attempts: usize,
    },
    /// Stored state could not be encoded or decoded.
    #[error("counter state codec error: {0}")]
    Codec(String),
}

impl StoreError {
    /// Shorthand for [`StoreError::Unavailable`].
    pub fn unavailable(reason: impl Into<String>) -> Self {
        StoreError::Unavailable { reason: reason.into() }
    }

    /// Check if this error is a timeout (callers fall back to local state).
    pub fn is_timeout(&self) -> bool {
        matches!(self, StoreError::Timeout { .. })
    }
}

/// Invalid algorithm parameters.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum AlgorithmError {
    /// Capacity / threshold must be > 0.
    #[error("limit must be > 0 (got {provided})")]
    InvalidLimit {
        /// Value provided by caller.
        provided: u64,
    },
    /// Refill rate must be finite and > 0.
    #[error("refill rate must be finite and > 0 (got {provided})")]
    InvalidRate {
        /// Value provided by caller.
        provided: f64,
    },
    /// Burst must be >= capacity.
    #[error("burst must be >= capacity (burst {burst}, capacity {capacity})")]
    InvalidBurst {
        /// Burst provided.
        burst: u64,
        /// Capacity it was checked against.
        capacity: u64,
    },
    /// Window must be at least one millisecond.
    #[error("window must be >= 1ms (got {0:?})")]
    InvalidWindow(Duration),
}

/// Errors produced while loading or validating a policy set.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum ConfigError {
    /// The configuration document is not valid JSON for the schema.
    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),
    /// The configuration file could not be read.
    #[error("config read error: {0}")]
    Io(#[from] std::io::Error),
    /// A policy's parameters are invalid.
    #[error("policy '{policy}': {source}")]
    InvalidPolicy {
        /// Policy identifier.
        policy: String,
        /// Underlying validation failure.
        #[source]
        source: AlgorithmError,
    },
    /// An endpoint pattern is malformed or duplicated.
    #[error("invalid endpoint pattern: {0}")]
    InvalidPattern(String),
    /// An exemption CIDR could not be parsed.
    #[error("invalid CIDR: {0}")]
    InvalidCidr(String),
    /// Breaker or range-guard thresholds are invalid.
    #[error("invalid breaker config: {0}")]
    InvalidBreaker(String),
    /// Any other out-of-range or conflicting setting.
    #[error("invalid setting: {0}")]
    InvalidSetting(String),
}

/// Error returned by the admission middleware.
#[derive(Debug, Clone)]
pub enum AdmissionError<E> {
    /// The request was denied; the decision carries headers and retry hint.
    Rejected(Decision),
    /// The wrapped service failed.
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for AdmissionError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejected(decision) => {
                let reason = decision.reason.map(|r| r.as_str()).unwrap_or("denied");
                write!(f, "request rejected ({}), retry after {:?}", reason, decision.retry_after)
            }
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for AdmissionError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            Self::Rejected(_) => None,
        }
    }
}

impl<E> AdmissionError<E> {
    /// Check if this error is an admission deny.
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }

    /// Borrow the deny decision if present.
    pub fn decision(&self) -> Option<&Decision> {
        match self {
            Self::Rejected(d) => Some(d),
            Self::Inner(_) => None,
        }
    }

    /// Get the inner error if this is an Inner variant.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            Self::Rejected(_) => None,
        }
    }
}
