//! IP allow-list with CIDR support. IPv4 and IPv6 entries live in separate
//! tables and are matched independently; an IPv4-mapped IPv6 peer is
//! normalized to IPv4 before the check.

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use std::net::IpAddr;

use crate::config::IpWhitelistConfig;

/// Parse a single allow-list entry: either a bare address (host route) or a
/// CIDR range. Returns `None` for anything malformed.
pub fn parse_entry(entry: &str) -> Option<IpNet> {
    let entry = entry.trim();
    if let Ok(net) = entry.parse::<IpNet>() {
        return Some(net);
    }
    match entry.parse::<IpAddr>() {
        Ok(IpAddr::V4(a)) => Ipv4Net::new(a, 32).ok().map(IpNet::V4),
        Ok(IpAddr::V6(a)) => Ipv6Net::new(a, 128).ok().map(IpNet::V6),
        Err(_) => None,
    }
}

/// Flattened allow-list built once at startup.
#[derive(Debug, Default)]
pub struct IpAllowList {
    enabled: bool,
    v4: Vec<Ipv4Net>,
    v6: Vec<Ipv6Net>,
}

impl IpAllowList {
    /// Build from config. Malformed entries are a hard startup error.
    pub fn from_config(cfg: &IpWhitelistConfig) -> Result<Self, String> {
        if !cfg.enabled {
            return Ok(Self::default());
        }
        let mut v4 = Vec::new();
        let mut v6 = Vec::new();
        for entry in &cfg.entries {
            match parse_entry(entry) {
                Some(IpNet::V4(net)) => v4.push(net),
                Some(IpNet::V6(net)) => v6.push(net),
                None => return Err(format!("invalid ip_whitelist entry: {entry}")),
            }
        }
        Ok(Self {
            enabled: true,
            v4,
            v6,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// `true` iff the peer may proceed. Disabled or empty-family semantics:
    /// a disabled list allows everyone; an enabled list allows only members.
    pub fn check(&self, ip: IpAddr) -> bool {
        if !self.enabled {
            return true;
        }
        match normalize(ip) {
            IpAddr::V4(a) => self.v4.iter().any(|net| net.contains(&a)),
            IpAddr::V6(a) => self.v6.iter().any(|net| net.contains(&a)),
        }
    }

    pub fn len(&self) -> usize {
        self.v4.len() + self.v6.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Collapse IPv4-mapped IPv6 addresses (`::ffff:a.b.c.d`) to IPv4 so a
/// dual-stack listener matches v4 entries.
fn normalize(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => ip,
        },
        v4 => v4,
    }
}
