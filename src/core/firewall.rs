//! Firewall rule descriptors and iptables argument generation
//!
//! A [`RuleDescriptor`] is the declarative unit the engine works with: a chain,
//! a literal source address, a destination port and a transport protocol. The
//! action is always ACCEPT, so it is not part of a rule's identity.
//!
//! # Identity
//!
//! Two descriptors name the same rule when their [`RuleKey`]s are equal. The key
//! normalises the source through [`IpAddr`], so `2001:db8::1` and
//! `2001:0db8:0:0::1` collapse onto one rule.
//!
//! # Example
//!
//! ```
//! use hostwall::core::firewall::{Chain, Protocol, RuleDescriptor};
//!
//! let rule = RuleDescriptor::new(Chain::Input, "203.0.113.5", 443, Protocol::Tcp);
//! assert_eq!(
//!     rule.engine_args(),
//!     ["INPUT", "-p", "tcp", "-s", "203.0.113.5", "--dport", "443", "-j", "ACCEPT"]
//! );
//! ```

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use strum::IntoEnumIterator;

/// Built-in filter chain a rule is attached to
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(ascii_case_insensitive)]
pub enum Chain {
    /// Traffic addressed to this host
    #[strum(serialize = "INPUT")]
    Input,
    /// Traffic originating from this host
    #[strum(serialize = "OUTPUT")]
    Output,
    /// Traffic routed through this host
    #[strum(serialize = "FORWARD")]
    Forward,
}

/// Transport protocol matched by a rule
///
/// Only protocols that carry a destination port are representable.
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Default,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum Protocol {
    #[default]
    #[strum(serialize = "tcp")]
    Tcp,
    #[strum(serialize = "udp")]
    Udp,
}

impl Protocol {
    pub const fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }

    /// IANA protocol number, as printed by newer iptables with `-n`
    pub const fn number(self) -> u8 {
        match self {
            Protocol::Tcp => 6,
            Protocol::Udp => 17,
        }
    }

    /// Parses the `prot` column of a rule listing (name or number).
    fn from_listing(token: &str) -> Option<Self> {
        let number = token.parse::<u8>().ok();
        Self::iter().find(|p| token == p.as_str() || number == Some(p.number()))
    }
}

/// Rule action. This system only ever accepts.
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Default,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    #[default]
    #[strum(serialize = "ACCEPT")]
    Accept,
}

/// A declarative filter rule as supplied by the caller.
///
/// `source` and `port` keep the caller's values unchecked so a malformed request
/// can be represented and reported; the validator gates every mutating call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuleDescriptor {
    pub chain: Chain,
    pub source: String,
    pub port: u32,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub action: Action,
}

impl RuleDescriptor {
    pub fn new(chain: Chain, source: impl Into<String>, port: u32, protocol: Protocol) -> Self {
        Self {
            chain,
            source: source.into(),
            port,
            protocol,
            action: Action::Accept,
        }
    }

    /// Identity key, or `None` when the source or port is malformed.
    pub fn key(&self) -> Option<RuleKey> {
        let source = self.source.parse::<IpAddr>().ok()?;
        let port = u16::try_from(self.port).ok().filter(|p| *p != 0)?;
        Some(RuleKey {
            chain: self.chain,
            source,
            port,
            protocol: self.protocol,
        })
    }

    pub fn is_ipv6(&self) -> bool {
        matches!(self.source.parse::<IpAddr>(), Ok(IpAddr::V6(_)))
    }

    /// Rule specification shared by `-C`, `-A` and `-D`.
    pub fn engine_args(&self) -> Vec<String> {
        vec![
            self.chain.to_string(),
            "-p".to_string(),
            self.protocol.to_string(),
            "-s".to_string(),
            self.source.clone(),
            "--dport".to_string(),
            self.port.to_string(),
            "-j".to_string(),
            self.action.to_string(),
        ]
    }
}

impl fmt::Display for RuleDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Chain={}, Source IP={}, Destination Port={}, Protocol={}",
            self.chain, self.source, self.port, self.protocol
        )
    }
}

/// Identity of a rule: (chain, source, destination port, protocol).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuleKey {
    pub chain: Chain,
    pub source: IpAddr,
    pub port: u16,
    pub protocol: Protocol,
}

impl RuleKey {
    pub fn to_descriptor(self) -> RuleDescriptor {
        RuleDescriptor::new(
            self.chain,
            self.source.to_string(),
            u32::from(self.port),
            self.protocol,
        )
    }
}

/// Recovers rule descriptors from `iptables -L -n [-v]` output.
///
/// Only rules this system could have produced are recovered: ACCEPT on a
/// built-in chain, tcp/udp, a single-host source and a single destination port.
/// Everything else in the listing is skipped. Order follows the listing.
pub fn parse_listing(text: &str) -> Vec<RuleDescriptor> {
    let mut rules = Vec::new();
    let mut chain: Option<Chain> = None;

    for line in text.lines() {
        let trimmed = line.trim();

        if let Some(rest) = trimmed.strip_prefix("Chain ") {
            chain = rest
                .split_whitespace()
                .next()
                .and_then(|name| name.parse::<Chain>().ok());
            continue;
        }

        let Some(current) = chain else {
            continue;
        };

        let tokens: Vec<&str> = trimmed.split_whitespace().collect();
        if let Some(rule) = parse_rule_line(current, &tokens) {
            rules.push(rule);
        }
    }

    rules
}

fn parse_rule_line(chain: Chain, tokens: &[&str]) -> Option<RuleDescriptor> {
    // Verbose listings lead with packet and byte counters
    let offset = if tokens.len() > 2 && is_counter(tokens[0]) && is_counter(tokens[1]) {
        2
    } else {
        0
    };

    let target = *tokens.get(offset)?;
    if target != "ACCEPT" {
        return None;
    }
    let protocol = Protocol::from_listing(tokens.get(offset + 1)?)?;

    let mut addresses = tokens
        .iter()
        .enumerate()
        .skip(offset + 2)
        .filter_map(|(i, t)| t.parse::<IpNetwork>().ok().map(|net| (i, net)));
    let (_, source) = addresses.next()?;
    let (dest_index, _) = addresses.next()?;

    let is_host = match source {
        IpNetwork::V4(net) => net.prefix() == 32,
        IpNetwork::V6(net) => net.prefix() == 128,
    };
    if !is_host {
        return None;
    }

    let port = tokens[dest_index + 1..]
        .iter()
        .find_map(|t| t.strip_prefix("dpt:"))
        .and_then(|p| p.parse::<u16>().ok())?;

    Some(RuleDescriptor::new(
        chain,
        source.ip().to_string(),
        u32::from(port),
        protocol,
    ))
}

pub(crate) fn is_counter(token: &str) -> bool {
    let digits = token.trim_end_matches(['K', 'M', 'G', 'T']);
    !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())
}
