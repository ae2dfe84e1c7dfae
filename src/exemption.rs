//! Trusted identities that skip admission control entirely.

use crate::error::ConfigError;
use crate::key::RequestIdentity;
use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// An IPv4 or IPv6 network in CIDR notation. A bare address is a host route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cidr {
    network: IpAddr,
    prefix: u8,
}

impl Cidr {
    /// Network `addr/prefix`; host bits of `addr` are cleared.
    pub fn new(addr: IpAddr, prefix: u8) -> Result<Self, ConfigError> {
        let max = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix > max {
            return Err(ConfigError::InvalidCidr(format!("{addr}/{prefix}: prefix exceeds {max}")));
        }
        Ok(Self { network: mask(addr, prefix), prefix })
    }

    /// Network address.
    pub fn network(&self) -> IpAddr {
        self.network
    }

    /// Prefix length in bits.
    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// Whether `ip` falls inside this network. IPv4-mapped IPv6 addresses
    /// are compared as IPv4.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        let ip = ip.to_canonical();
        match (self.network, ip) {
            (IpAddr::V4(_), IpAddr::V4(_)) | (IpAddr::V6(_), IpAddr::V6(_)) => {
                mask(ip, self.prefix) == self.network
            }
            _ => false,
        }
    }
}

/// Clear everything after the first `prefix` bits.
pub(crate) fn mask(addr: IpAddr, prefix: u8) -> IpAddr {
    match addr {
        IpAddr::V4(v4) => {
            let bits = u32::from(v4);
            let m = if prefix == 0 { 0 } else { u32::MAX << (32 - u32::from(prefix)) };
            IpAddr::V4((bits & m).into())
        }
        IpAddr::V6(v6) => {
            let bits = u128::from(v6);
            let m = if prefix == 0 { 0 } else { u128::MAX << (128 - u32::from(prefix)) };
            IpAddr::V6((bits & m).into())
        }
    }
}

impl FromStr for Cidr {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => {
                let prefix = prefix
                    .parse::<u8>()
                    .map_err(|_| ConfigError::InvalidCidr(format!("{s}: bad prefix length")))?;
                (addr, Some(prefix))
            }
            None => (s, None),
        };
        let addr = addr
            .parse::<IpAddr>()
            .map_err(|_| ConfigError::InvalidCidr(format!("{s}: bad address")))?
            .to_canonical();
        let prefix = prefix.unwrap_or(if addr.is_ipv4() { 32 } else { 128 });
        Cidr::new(addr, prefix)
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

/// Trusted ranges, users, roles and API keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Exemptions {
    cidrs: Vec<Cidr>,
    users: HashSet<String>,
    roles: HashSet<String>,
    api_keys: HashSet<String>,
}

impl Exemptions {
    /// No exemptions.
    pub fn new() -> Self {
        Self::default()
    }

    /// Trust an IP range.
    pub fn with_cidr(mut self, cidr: Cidr) -> Self {
        self.cidrs.push(cidr);
        self
    }

    /// Trust a user id.
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.users.insert(user.into());
        self
    }

    /// Trust every identity carrying `role` as its tier.
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.insert(role.into());
        self
    }

    /// Trust an API key.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_keys.insert(key.into());
        self
    }

    /// True when no exemption is configured.
    pub fn is_empty(&self) -> bool {
        self.cidrs.is_empty()
            && self.users.is_empty()
            && self.roles.is_empty()
            && self.api_keys.is_empty()
    }

    /// Whether `identity` skips evaluation. Unparseable IPs never match a range.
    pub fn is_exempt(&self, identity: &RequestIdentity) -> bool {
        if identity.user_id.as_ref().is_some_and(|u| self.users.contains(u)) {
            return true;
        }
        if identity.api_key.as_ref().is_some_and(|k| self.api_keys.contains(k)) {
            return true;
        }
        if identity.tier.as_ref().is_some_and(|r| self.roles.contains(r)) {
            return true;
        }
        if self.cidrs.is_empty() {
            return false;
        }
        identity.parsed_ip().is_some_and(|ip| self.cidrs.iter().any(|c| c.contains(&ip)))
    }
}
