//! Input validation for rule descriptors
//!
//! Pure checks with no side effects. Malformed input is reported, never raised:
//! the single-field checks return `bool`, and [`validate_descriptor`] aggregates
//! every violated constraint so the caller can report them all at once.

use crate::core::firewall::{Chain, Protocol, RuleDescriptor};
use std::fmt;
use std::net::IpAddr;

/// A single violated constraint on a descriptor field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub field: &'static str,
    pub message: String,
}

impl Violation {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// True iff `s` is a syntactically valid IPv4 or IPv6 literal.
///
/// No DNS resolution and no reachability check. CIDR networks are rejected:
/// rules match a single source host.
///
/// # Examples
///
/// ```
/// use hostwall::validators::validate_address;
///
/// assert!(validate_address("203.0.113.5"));
/// assert!(validate_address("2001:db8::1"));
/// assert!(!validate_address("999.1.1.1"));
/// assert!(!validate_address("example.com"));
/// ```
pub fn validate_address(s: &str) -> bool {
    s.parse::<IpAddr>().is_ok()
}

/// True iff `port` is in `1..=65535`.
pub fn validate_port(port: u32) -> bool {
    (1..=65_535).contains(&port)
}

/// True iff `chain` names one of INPUT, OUTPUT or FORWARD (any case).
pub fn validate_chain(chain: &str) -> bool {
    chain.parse::<Chain>().is_ok()
}

/// True iff `protocol` is tcp or udp (any case).
pub fn validate_protocol(protocol: &str) -> bool {
    protocol.parse::<Protocol>().is_ok()
}

/// Collects every constraint the descriptor violates. Empty means valid.
///
/// Chain and protocol are enforced by their types, so only the free-form
/// source and port can fail here.
pub fn validate_descriptor(rule: &RuleDescriptor) -> Vec<Violation> {
    let mut violations = Vec::new();

    if !validate_address(&rule.source) {
        violations.push(Violation::new(
            "source",
            format!("'{}' is not a valid IPv4 or IPv6 address", rule.source),
        ));
    }

    if !validate_port(rule.port) {
        violations.push(Violation::new(
            "port",
            format!("{} is outside 1-65535", rule.port),
        ));
    }

    violations
}

/// Checks if a port is well-known and returns informational message.
///
/// This is informational only and does not block the rule.
pub fn check_well_known_port(port: u16) -> Option<String> {
    let name = match port {
        22 => "SSH",
        80 => "HTTP",
        443 => "HTTPS",
        53 => "DNS",
        25 => "SMTP",
        21 => "FTP",
        3389 => "RDP",
        0..=1024 => return Some(format!("Privileged port {port}")),
        _ => return None,
    };
    Some(format!("Port {port}: {name}"))
}

/// Checks if a source address is in a reserved range and returns informational warning.
///
/// This is informational only and does not block the rule.
pub fn check_reserved_ip(ip: IpAddr) -> Option<String> {
    match ip {
        IpAddr::V4(ipv4) => {
            if ipv4.is_private() {
                return Some("Private IP range (RFC 1918) - usually safe for LAN".to_string());
            }

            if ipv4.is_loopback() {
                return Some("Loopback range (127.x) - traffic never leaves this host".to_string());
            }

            if ipv4.is_link_local() {
                return Some("Link-local range (169.254.x.x) - APIPA addresses".to_string());
            }

            if ipv4.is_unspecified() {
                return Some("Unspecified address (0.0.0.0) matches no real source".to_string());
            }

            None
        }
        IpAddr::V6(ipv6) => {
            if ipv6.is_loopback() {
                return Some("IPv6 loopback (::1) - traffic never leaves this host".to_string());
            }

            if ipv6.segments()[0] & 0xffc0 == 0xfe80 {
                return Some("IPv6 link-local (fe80::/10) - local network only".to_string());
            }

            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_address_valid() {
        assert!(validate_address("203.0.113.5"));
        assert!(validate_address("0.0.0.0"));
        assert!(validate_address("::1"));
        assert!(validate_address("2001:db8::1"));
    }

    #[test]
    fn test_validate_address_malformed() {
        assert!(!validate_address("999.1.1.1"));
        assert!(!validate_address("abc"));
        assert!(!validate_address(""));
        assert!(!validate_address("10.0.0.0/8"));
        assert!(!validate_address("1.2.3"));
        assert!(!validate_address(" 1.2.3.4"));
        assert!(!validate_address("1.2.3.4; rm -rf /"));
    }

    #[test]
    fn test_validate_port_bounds() {
        assert!(!validate_port(0));
        assert!(validate_port(1));
        assert!(validate_port(65_535));
        assert!(!validate_port(65_536));
    }

    #[test]
    fn test_validate_chain() {
        assert!(validate_chain("INPUT"));
        assert!(validate_chain("output"));
        assert!(validate_chain("Forward"));
        assert!(!validate_chain("PREROUTING"));
        assert!(!validate_chain(""));
    }

    #[test]
    fn test_validate_protocol() {
        assert!(validate_protocol("tcp"));
        assert!(validate_protocol("UDP"));
        assert!(!validate_protocol("icmp"));
        assert!(!validate_protocol("tcp+udp"));
    }

    #[test]
    fn test_validate_descriptor_aggregates() {
        let rule = RuleDescriptor::new(Chain::Input, "abc", 0, Protocol::Tcp);
        let violations = validate_descriptor(&rule);
        assert_eq!(violations.len(), 2);
        assert_eq!(violations[0].field, "source");
        assert_eq!(violations[1].field, "port");
    }

    #[test]
    fn test_validate_descriptor_valid() {
        let rule = RuleDescriptor::new(Chain::Input, "203.0.113.5", 443, Protocol::Tcp);
        assert!(validate_descriptor(&rule).is_empty());
    }

    #[test]
    fn test_check_well_known_port() {
        assert!(check_well_known_port(22).unwrap().contains("SSH"));
        assert!(check_well_known_port(443).unwrap().contains("HTTPS"));
        assert!(check_well_known_port(999).unwrap().contains("Privileged"));
        assert!(check_well_known_port(8080).is_none());
    }

    #[test]
    fn test_check_reserved_ip() {
        let private = check_reserved_ip("192.168.1.10".parse().unwrap());
        assert!(private.unwrap().contains("RFC 1918"));

        let loopback = check_reserved_ip("127.0.0.1".parse().unwrap());
        assert!(loopback.unwrap().contains("Loopback"));

        let link_local = check_reserved_ip("fe80::1".parse().unwrap());
        assert!(link_local.unwrap().contains("link-local"));

        assert!(check_reserved_ip("8.8.8.8".parse().unwrap()).is_none());
    }
}

#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    proptest! {
        #[test]
        fn test_any_ipv4_literal_is_valid(bits in any::<u32>()) {
            let addr = Ipv4Addr::from(bits).to_string();
            prop_assert!(validate_address(&addr));
        }

        #[test]
        fn test_any_ipv6_literal_is_valid(bits in any::<u128>()) {
            let addr = Ipv6Addr::from(bits).to_string();
            prop_assert!(validate_address(&addr));
        }

        #[test]
        fn test_out_of_range_octet_is_invalid(
            a in 256u32..1000,
            b in 0u32..256,
            c in 0u32..256,
            d in 0u32..256
        ) {
            let addr = format!("{a}.{b}.{c}.{d}");
            prop_assert!(!validate_address(&addr));
        }

        #[test]
        fn test_validate_port_matches_range(port in any::<u32>()) {
            prop_assert_eq!(validate_port(port), (1..=65_535).contains(&port));
        }

        #[test]
        fn test_alphabetic_strings_are_not_addresses(s in "[g-zG-Z]{1,20}") {
            prop_assert!(!validate_address(&s));
        }

        #[test]
        fn test_descriptor_valid_iff_no_violations(
            bits in any::<u32>(),
            port in 0u32..70_000
        ) {
            let rule = RuleDescriptor::new(
                Chain::Input,
                Ipv4Addr::from(bits).to_string(),
                port,
                Protocol::Udp,
            );
            let violations = validate_descriptor(&rule);
            prop_assert_eq!(violations.is_empty(), validate_port(port));
            prop_assert_eq!(rule.key().is_some(), violations.is_empty());
        }
    }
}
