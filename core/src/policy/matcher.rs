//! Host, domain and IP-range matchers shared by the policy engine and the
//! network guard classifier.

use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::Ipv6Addr;

/// Case-insensitive, trailing-dot-insensitive wildcard domain match.
/// `*.foo.bar` matches `foo.bar` and any subdomain of it.
pub fn matches_wildcard_domain(host: &str, pattern: &str) -> bool {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    let pattern = pattern.trim_end_matches('.').to_ascii_lowercase();
    if host.is_empty() || pattern.is_empty() {
        return false;
    }
    match pattern.strip_prefix("*.") {
        Some(apex) => host == apex || host.ends_with(&format!(".{apex}")),
        None => host == pattern,
    }
}

/// IPv4 CIDR evaluated via integer mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Cidr {
    network: u32,
    prefix: u8,
}

impl Ipv4Cidr {
    pub fn parse(raw: &str) -> Option<Self> {
        let (addr, prefix) = match raw.split_once('/') {
            Some((addr, prefix)) => (addr, prefix.parse::<u8>().ok()?),
            None => (raw, 32),
        };
        if prefix > 32 {
            return None;
        }
        let addr: Ipv4Addr = addr.trim().parse().ok()?;
        Some(Self {
            network: u32::from(addr) & Self::mask(prefix),
            prefix,
        })
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        u32::from(addr) & Self::mask(self.prefix) == self.network
    }

    fn mask(prefix: u8) -> u32 {
        if prefix == 0 {
            0
        } else {
            u32::MAX << (32 - u32::from(prefix))
        }
    }
}

/// Parses a URL host component into an IP literal, tolerating bracketed IPv6.
pub fn host_ip(host: &str) -> Option<IpAddr> {
    let trimmed = host.trim().trim_start_matches('[').trim_end_matches(']');
    trimmed.parse::<IpAddr>().ok()
}

/// Private/LAN detection across both families. IPv6 compression and
/// IPv4-mapped tails are handled by the address parser before the first-byte
/// inspection.
pub fn is_private_ip(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => is_private_v4(*v4),
        IpAddr::V6(v6) => is_private_v6(*v6),
    }
}

fn is_private_v4(addr: Ipv4Addr) -> bool {
    let octets = addr.octets();
    match octets {
        [10, ..] => true,
        [172, b, ..] if (16..=31).contains(&b) => true,
        [192, 168, ..] => true,
        // Carrier-grade NAT 100.64.0.0/10.
        [100, b, ..] if (64..=127).contains(&b) => true,
        // Link-local 169.254.0.0/16.
        [169, 254, ..] => true,
        _ => false,
    }
}

fn is_private_v6(addr: Ipv6Addr) -> bool {
    if let Some(mapped) = addr.to_ipv4_mapped() {
        return is_private_v4(mapped);
    }
    let first = addr.octets()[0];
    let second = addr.octets()[1];
    // Unique-local fc00::/7.
    if first & 0xfe == 0xfc {
        return true;
    }
    // Link-local fe80::/10.
    first == 0xfe && second & 0xc0 == 0x80
}

/// Loopback labels always bypass the guard.
pub fn is_loopback_host(host: &str) -> bool {
    let normalized = host
        .trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_ascii_lowercase();
    normalized == "localhost" || normalized == "127.0.0.1" || normalized == "::1"
}
