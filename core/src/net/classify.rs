//! Pure host classifier: reduces `(host, port)` against the network policy to
//! a block decision. Never mutates policy, never emits events.

use crate::net::block::BlockReason;
use crate::policy::Decision;
use crate::policy::Ipv4Cidr;
use crate::policy::NetworkPolicy;
use crate::policy::PolicyMode;
use crate::policy::host_ip;
use crate::policy::is_loopback_host;
use crate::policy::is_private_ip;
use crate::policy::matches_wildcard_domain;

/// Well-known encrypted-DNS endpoints blocked regardless of policy. Keeping
/// DNS on the platform resolver is what lets the rest of the guard see real
/// hostnames.
const DOH_DOMAINS: &[&str] = &[
    "cloudflare-dns.com",
    "mozilla.cloudflare-dns.com",
    "one.one.one.one",
    "dns.google",
    "dns.google.com",
    "dns.quad9.net",
    "dns9.quad9.net",
    "dns10.quad9.net",
    "doh.opendns.com",
    "dns.nextdns.io",
];

const DOH_CIDRS: &[&str] = &[
    "1.1.1.1/32",
    "1.0.0.1/32",
    "8.8.8.8/32",
    "8.8.4.4/32",
    "9.9.9.9/32",
    "149.112.112.112/32",
    "208.67.222.222/32",
    "208.67.220.220/32",
    "45.90.28.0/23",
];

const DOT_PORT: u16 = 853;

#[derive(Debug, Clone, PartialEq)]
pub struct HostDecision {
    pub block: bool,
    pub reason: Option<BlockReason>,
    /// The rule or list entry that produced the decision.
    pub rule: Option<String>,
}

impl HostDecision {
    fn allow(rule: impl Into<String>) -> Self {
        Self {
            block: false,
            reason: None,
            rule: Some(rule.into()),
        }
    }

    fn block(reason: BlockReason, rule: impl Into<String>) -> Self {
        Self {
            block: true,
            reason: Some(reason),
            rule: Some(rule.into()),
        }
    }
}

/// Classifier precedence:
///
/// 1. DoT port 853 always blocks.
/// 2. Loopback labels always pass.
/// 3. Configured allow lists (domains, IPs, IP ranges) pass.
/// 4. The built-in DoH blocklist blocks.
/// 5. Configured block lists block.
/// 6. IP literals consult the private-LAN stance and the literal toggle.
/// 7. Under `default_deny`, at least one wildcard rule must allow the host.
pub fn should_block_host(host: &str, port: Option<u16>, network: &NetworkPolicy) -> HostDecision {
    let host = host.trim().trim_end_matches('.').to_ascii_lowercase();

    if port == Some(DOT_PORT) {
        return HostDecision::block(BlockReason::DotBlocked, "dot_port");
    }

    if is_loopback_host(&host) {
        return HostDecision::allow("loopback");
    }

    let ip = host_ip(&host);

    for domain in &network.allow_domains {
        if domain_suffix_match(&host, domain) {
            return HostDecision::allow(format!("allow_domain:{domain}"));
        }
    }
    if let Some(ip) = ip {
        for entry in &network.allow_ips {
            if entry.eq_ignore_ascii_case(&host) {
                return HostDecision::allow(format!("allow_ip:{entry}"));
            }
            if let (Some(cidr), std::net::IpAddr::V4(v4)) = (Ipv4Cidr::parse(entry), ip)
                && cidr.contains(v4)
            {
                return HostDecision::allow(format!("allow_ip:{entry}"));
            }
        }
        if let std::net::IpAddr::V4(v4) = ip {
            for range in &network.allow_ip_ranges {
                if let Some(cidr) = Ipv4Cidr::parse(range)
                    && cidr.contains(v4)
                {
                    return HostDecision::allow(format!("allow_ip_range:{range}"));
                }
            }
        }
    }

    for domain in DOH_DOMAINS {
        if domain_suffix_match(&host, domain) {
            return HostDecision::block(BlockReason::DohBlocked, format!("doh:{domain}"));
        }
    }
    if let Some(std::net::IpAddr::V4(v4)) = ip {
        for range in DOH_CIDRS {
            if let Some(cidr) = Ipv4Cidr::parse(range)
                && cidr.contains(v4)
            {
                return HostDecision::block(BlockReason::DohBlocked, format!("doh:{range}"));
            }
        }
    }

    for domain in &network.block_domains {
        if domain_suffix_match(&host, domain) {
            return HostDecision::block(
                BlockReason::DomainBlocked,
                format!("block_domain:{domain}"),
            );
        }
    }
    if let Some(ip) = ip {
        for entry in &network.block_ips {
            let exact = entry.eq_ignore_ascii_case(&host);
            let in_cidr = matches!(
                (Ipv4Cidr::parse(entry), ip),
                (Some(cidr), std::net::IpAddr::V4(v4)) if cidr.contains(v4)
            );
            if exact || in_cidr {
                return HostDecision::block(BlockReason::IpBlocked, format!("block_ip:{entry}"));
            }
        }
    }

    if let Some(ip) = ip {
        if is_private_ip(&ip) {
            return match network.allow_private_lan {
                Decision::Allow => HostDecision::allow("private_lan:allow"),
                Decision::Ask => {
                    HostDecision::block(BlockReason::PrivateLanBlocked, "private_lan:ask")
                }
                Decision::Deny => {
                    let reason = if ip.is_ipv6() {
                        BlockReason::IpV6Private
                    } else {
                        BlockReason::IpPrivate
                    };
                    HostDecision::block(reason, "private_lan:deny")
                }
            };
        }
        if !network.allow_ip_literals {
            return HostDecision::block(BlockReason::IpLiteralBlocked, "ip_literals_disabled");
        }
    }

    if network.mode == PolicyMode::DefaultDeny {
        for rule in &network.rules {
            if matches_wildcard_domain(&host, &rule.pattern) {
                return HostDecision::allow(format!("rule:{}", rule.pattern));
            }
        }
        return HostDecision::block(BlockReason::PolicyDefaultDeny, "default_deny");
    }

    HostDecision::allow("default_allow")
}

/// Exact or `.`-suffix domain match used by the configured lists.
fn domain_suffix_match(host: &str, domain: &str) -> bool {
    let domain = domain.trim().trim_end_matches('.').to_ascii_lowercase();
    if domain.is_empty() {
        return false;
    }
    if let Some(pattern) = domain.strip_prefix("*.") {
        return matches_wildcard_domain(host, &format!("*.{pattern}"));
    }
    host == domain || host.ends_with(&format!(".{domain}"))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::policy::WildcardRule;

    fn network() -> NetworkPolicy {
        NetworkPolicy::default()
    }

    #[test]
    fn dot_port_always_blocks() {
        let decision = should_block_host("resolver.example", Some(853), &network());
        assert!(decision.block);
        assert_eq!(decision.reason, Some(BlockReason::DotBlocked));
    }

    #[test]
    fn loopback_always_allows() {
        for host in ["localhost", "127.0.0.1", "::1"] {
            assert!(!should_block_host(host, Some(443), &network()).block);
        }
    }

    #[test]
    fn allow_domain_beats_doh_blocklist() {
        let mut net = network();
        net.allow_domains.push("dns.google".to_string());
        assert!(!should_block_host("dns.google", None, &net).block);
    }

    #[test]
    fn doh_endpoints_block_by_domain_and_ip() {
        let mut net = network();
        net.allow_ip_literals = true;
        let by_domain = should_block_host("dns.quad9.net", None, &net);
        assert_eq!(by_domain.reason, Some(BlockReason::DohBlocked));
        let by_ip = should_block_host("8.8.8.8", None, &net);
        assert_eq!(by_ip.reason, Some(BlockReason::DohBlocked));
    }

    #[test]
    fn configured_blocklists_block_subdomains() {
        let mut net = network();
        net.block_domains.push("evil.example".to_string());
        let decision = should_block_host("api.evil.example", None, &net);
        assert_eq!(decision.reason, Some(BlockReason::DomainBlocked));
    }

    #[test]
    fn private_ranges_follow_lan_stance() {
        let mut net = network();

        net.allow_private_lan = Decision::Allow;
        assert!(!should_block_host("192.168.1.10", None, &net).block);

        net.allow_private_lan = Decision::Ask;
        let asked = should_block_host("192.168.1.10", None, &net);
        assert_eq!(asked.reason, Some(BlockReason::PrivateLanBlocked));

        net.allow_private_lan = Decision::Deny;
        let denied = should_block_host("10.0.0.7", None, &net);
        assert_eq!(denied.reason, Some(BlockReason::IpPrivate));
        let denied6 = should_block_host("fe80::1", None, &net);
        assert_eq!(denied6.reason, Some(BlockReason::IpV6Private));
    }

    #[test]
    fn all_private_v4_ranges_deny_with_ip_private() {
        let mut net = network();
        net.allow_private_lan = Decision::Deny;
        for host in ["10.1.1.1", "172.16.5.5", "192.168.0.2", "100.64.9.9", "169.254.0.3"] {
            let decision = should_block_host(host, None, &net);
            assert_eq!(decision.reason, Some(BlockReason::IpPrivate), "{host}");
        }
    }

    #[test]
    fn public_ip_literal_respects_toggle() {
        let mut net = network();
        net.allow_ip_literals = false;
        let decision = should_block_host("93.184.216.34", None, &net);
        assert_eq!(decision.reason, Some(BlockReason::IpLiteralBlocked));
        net.allow_ip_literals = true;
        assert!(!should_block_host("93.184.216.34", None, &net).block);
    }

    #[test]
    fn default_deny_requires_a_matching_rule() {
        let mut net = network();
        net.mode = PolicyMode::DefaultDeny;
        let blocked = should_block_host("example.com", None, &net);
        assert_eq!(blocked.reason, Some(BlockReason::PolicyDefaultDeny));

        net.rules.push(WildcardRule {
            pattern: "*.example.com".to_string(),
            paths: Vec::new(),
        });
        assert!(!should_block_host("api.example.com", None, &net).block);
        assert!(!should_block_host("example.com", None, &net).block);
    }

    #[test]
    fn allow_ip_cidr_entry_allows() {
        let mut net = network();
        net.allow_ips.push("203.0.113.0/24".to_string());
        assert!(!should_block_host("203.0.113.9", None, &net).block);
    }
}
