//! IP-range spike detection.
//!
//! Distributed floods rotate source addresses, so no single key builds up
//! violation history. This guard groups source IPs into ranges (`/24` for
//! IPv4 and `/64` for IPv6 by default) and opens a range-wide circuit when
//! too many distinct addresses from one range show up within a short
//! interval.

use crate::error::ConfigError;
use crate::exemption::{mask, Cidr};
use crate::store::lock;
use dashmap::DashMap;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Thresholds for range-scoped blocking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeGuardConfig {
    distinct_ips: usize,
    interval: Duration,
    cooldown: Duration,
    ipv4_prefix: u8,
    ipv6_prefix: u8,
}

impl RangeGuardConfig {
    /// Open a range when `distinct_ips` addresses from it appear within `interval`.
    pub fn new(
        distinct_ips: usize,
        interval: Duration,
        cooldown: Duration,
    ) -> Result<Self, ConfigError> {
        if distinct_ips < 2 {
            return Err(ConfigError::InvalidBreaker(format!(
                "range_guard.distinct_ips must be >= 2 (got {distinct_ips})"
            )));
        }
        if interval.is_zero() || cooldown.is_zero() {
            return Err(ConfigError::InvalidBreaker(
                "range_guard interval and cooldown must be > 0".into(),
            ));
        }
        Ok(Self { distinct_ips, interval, cooldown, ipv4_prefix: 24, ipv6_prefix: 64 })
    }

    /// Override the prefix lengths used to group addresses.
    pub fn with_prefixes(mut self, ipv4: u8, ipv6: u8) -> Result<Self, ConfigError> {
        if ipv4 > 32 || ipv6 > 128 {
            return Err(ConfigError::InvalidBreaker(format!(
                "range_guard prefixes out of range (v4 {ipv4}, v6 {ipv6})"
            )));
        }
        self.ipv4_prefix = ipv4;
        self.ipv6_prefix = ipv6;
        Ok(self)
    }

    /// Distinct addresses that trip the guard.
    pub fn distinct_ips(&self) -> usize {
        self.distinct_ips
    }

    /// Interval distinct addresses are counted in.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// How long a tripped range stays blocked.
    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// The range `ip` belongs to.
    pub fn range_of(&self, ip: IpAddr) -> Cidr {
        let ip = ip.to_canonical();
        let prefix = if ip.is_ipv4() { self.ipv4_prefix } else { self.ipv6_prefix };
        // Prefixes were validated, so construction cannot fail; fall back to a host route.
        Cidr::new(mask(ip, prefix), prefix).unwrap_or_else(|_| host_route(ip))
    }
}

fn host_route(ip: IpAddr) -> Cidr {
    let prefix = if ip.is_ipv4() { 32 } else { 128 };
    match Cidr::new(ip, prefix) {
        Ok(c) => c,
        Err(_) => unreachable!("host prefix is always valid"),
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Outcome of [`RangeGuard::observe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangeVerdict {
    /// Nothing unusual.
    Clear,
    /// The source range is blocked.
    Blocked {
        /// The blocked range.
        range: Cidr,
        /// Time left on the block.
        retry_after: Duration,
        /// Distinct addresses seen, when this observation tripped the block.
        tripped_by: Option<usize>,
    },
}

#[derive(Debug, Default)]
struct RangeEntry {
    // address -> last seen
    seen: HashMap<IpAddr, u64>,
    blocked_until_ms: Option<u64>,
}

/// Tracks distinct source addresses per range.
#[derive(Debug, Default)]
pub struct RangeGuard {
    ranges: DashMap<Cidr, Arc<Mutex<RangeEntry>>>,
}

impl RangeGuard {
    /// Empty guard.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ranges currently tracked.
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    /// True when nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Record a request from `ip` and report whether its range is blocked.
    pub fn observe(&self, ip: IpAddr, config: &RangeGuardConfig, now_ms: u64) -> RangeVerdict {
        let ip = ip.to_canonical();
        let range = config.range_of(ip);
        let entry = self.ranges.entry(range).or_default().value().clone();
        let mut guard = lock(&entry);

        if let Some(until) = guard.blocked_until_ms {
            if now_ms < until {
                return RangeVerdict::Blocked {
                    range,
                    retry_after: Duration::from_millis(until - now_ms),
                    tripped_by: None,
                };
            }
            guard.blocked_until_ms = None;
            tracing::info!(range = %range, "ip range block lifted");
        }

        let interval = millis(config.interval);
        guard.seen.retain(|_, last| now_ms.saturating_sub(*last) < interval);
        guard.seen.insert(ip, now_ms);

        let distinct = guard.seen.len();
        if distinct < config.distinct_ips {
            return RangeVerdict::Clear;
        }

        let cooldown = millis(config.cooldown);
        guard.blocked_until_ms = Some(now_ms.saturating_add(cooldown));
        guard.seen.clear();
        tracing::warn!(
            range = %range,
            distinct,
            cooldown_ms = cooldown,
            "distinct-address spike from one range; blocking range"
        );
        RangeVerdict::Blocked { range, retry_after: config.cooldown, tripped_by: Some(distinct) }
    }

    /// Whether `range` is blocked at `now_ms`.
    pub fn is_blocked(&self, range: &Cidr, now_ms: u64) -> bool {
        self.ranges
            .get(range)
            .map(|e| e.value().clone())
            .is_some_and(|e| lock(&e).blocked_until_ms.is_some_and(|until| now_ms < until))
    }

    /// Drop ranges with no recent traffic and no active block.
    pub fn sweep(&self, config: &RangeGuardConfig, now_ms: u64) -> usize {
        let interval = millis(config.interval);
        let before = self.ranges.len();
        self.ranges.retain(|_, entry| {
            let mut guard = lock(entry);
            guard.seen.retain(|_, last| now_ms.saturating_sub(*last) < interval);
            let blocked = guard.blocked_until_ms.is_some_and(|until| now_ms < until);
            blocked || !guard.seen.is_empty()
        });
        before.saturating_sub(self.ranges.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RangeGuardConfig {
        RangeGuardConfig::new(4, Duration::from_secs(10), Duration::from_secs(60)).unwrap()
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn validates_thresholds() {
        assert!(RangeGuardConfig::new(1, Duration::from_secs(1), Duration::from_secs(1)).is_err());
        assert!(RangeGuardConfig::new(5, Duration::ZERO, Duration::from_secs(1)).is_err());
        assert!(config().with_prefixes(33, 64).is_err());
    }

    #[test]
    fn spike_from_one_range_blocks_whole_range() {
        let guard = RangeGuard::new();
        let cfg = config();
        for (i, host) in ["203.0.113.1", "203.0.113.2", "203.0.113.3"].iter().enumerate() {
            assert_eq!(guard.observe(ip(host), &cfg, i as u64 * 100), RangeVerdict::Clear);
        }
        let tripped = guard.observe(ip("203.0.113.4"), &cfg, 400);
        assert!(matches!(tripped, RangeVerdict::Blocked { tripped_by: Some(4), .. }));

        // A never-seen neighbour is blocked too; other ranges are not.
        match guard.observe(ip("203.0.113.200"), &cfg, 10_400) {
            RangeVerdict::Blocked { range, retry_after, tripped_by } => {
                assert_eq!(range.to_string(), "203.0.113.0/24");
                assert_eq!(retry_after, Duration::from_secs(50));
                assert_eq!(tripped_by, None);
            }
            other => panic!("expected block, got {other:?}"),
        }
        assert_eq!(guard.observe(ip("198.51.100.1"), &cfg, 10_400), RangeVerdict::Clear);

        assert_eq!(guard.observe(ip("203.0.113.5"), &cfg, 60_400), RangeVerdict::Clear);
    }

    #[test]
    fn repeat_addresses_do_not_count_twice() {
        let guard = RangeGuard::new();
        let cfg = config();
        for t in 0..100 {
            assert_eq!(guard.observe(ip("203.0.113.1"), &cfg, t), RangeVerdict::Clear);
        }
    }

    #[test]
    fn slow_trickle_stays_clear() {
        let guard = RangeGuard::new();
        let cfg = config();
        for i in 1..=20u64 {
            let host = format!("203.0.113.{i}");
            assert_eq!(guard.observe(ip(&host), &cfg, i * 4_000), RangeVerdict::Clear);
        }
    }

    #[test]
    fn ipv6_groups_by_64() {
        let cfg = config();
        let a = cfg.range_of(ip("2001:db8:1:2::a"));
        let b = cfg.range_of(ip("2001:db8:1:2:ffff::1"));
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "2001:db8:1:2::/64");
    }

    #[test]
    fn sweep_drops_quiet_ranges() {
        let guard = RangeGuard::new();
        let cfg = config();
        guard.observe(ip("198.51.100.1"), &cfg, 0);
        for (i, host) in ["203.0.113.1", "203.0.113.2", "203.0.113.3", "203.0.113.4"]
            .iter()
            .enumerate()
        {
            guard.observe(ip(host), &cfg, i as u64);
        }
        assert_eq!(guard.sweep(&cfg, 20_000), 1);
        assert!(guard.is_blocked(&cfg.range_of(ip("203.0.113.9")), 20_000));
    }
}
