//! Traffic census: aggregate a socket-table dump into a summary
//!
//! Pure transformation, no I/O. The dump comes from the filter gateway; the
//! parsing strategy depends on which tool produced it, so each format gets its
//! own [`SocketTableParser`] and the gateway reports which one applies.
//!
//! Malformed lines never raise. They are excluded from the aggregates but still
//! counted in `total_lines`.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::Ipv6Addr;
use std::sync::LazyLock;

/// Dotted-quad address followed by `:port`
static IPV4_ENDPOINT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\d+\.\d+\.\d+\.\d+:\d+").expect("IPv4 endpoint pattern is valid")
});

/// Aggregated view of a socket table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficSummary {
    /// Every line of the dump, matched or not
    pub total_lines: usize,
    /// Local ports in scan order, duplicates preserved
    pub listening_ports: Vec<String>,
    /// Occurrences per protocol label (first field of each line)
    pub protocol_counts: BTreeMap<String, usize>,
}

impl TrafficSummary {
    fn record(&mut self, protocol: &str, port: &str) {
        self.listening_ports.push(port.to_string());
        *self
            .protocol_counts
            .entry(protocol.to_string())
            .or_insert(0) += 1;
    }
}

/// Which tool produced a socket-table dump
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SocketTableFormat {
    /// `netstat -tuln`: `Proto Recv-Q Send-Q Local-Address Foreign-Address State`
    #[default]
    Netstat,
    /// `ss -tuln`: `Netid State Recv-Q Send-Q Local:Port Peer:Port`
    Ss,
}

impl SocketTableFormat {
    pub fn parser(self) -> &'static dyn SocketTableParser {
        match self {
            SocketTableFormat::Netstat => &NetstatParser,
            SocketTableFormat::Ss => &SsParser,
        }
    }
}

/// Strategy for turning one tool's dump into a [`TrafficSummary`]
pub trait SocketTableParser: Send + Sync {
    fn summarize(&self, raw: &str) -> TrafficSummary;
}

/// Parser for `netstat -tuln` output
///
/// A line counts when it contains a dotted-quad `address:port`, or when its
/// local-address field is an IPv6 endpoint such as `:::22`. The protocol is the
/// first field and the port is the suffix after the last `:` of the fourth.
pub struct NetstatParser;

impl SocketTableParser for NetstatParser {
    fn summarize(&self, raw: &str) -> TrafficSummary {
        let mut summary = TrafficSummary::default();

        for line in raw.split('\n') {
            summary.total_lines += 1;

            let fields: Vec<&str> = line.split_whitespace().collect();
            let ipv4 = IPV4_ENDPOINT.is_match(line);
            let ipv6 = fields.get(3).is_some_and(|f| is_ipv6_endpoint(f));
            if !ipv4 && !ipv6 {
                continue;
            }
            if fields.len() < 4 {
                continue;
            }

            let port = fields[3].rsplit(':').next().unwrap_or(fields[3]);
            summary.record(fields[0], port);
        }

        summary
    }
}

/// Parser for `ss -tuln` output
///
/// The local endpoint is the fifth field; interface scopes (`%lo`) and IPv6
/// brackets are tolerated.
pub struct SsParser;

impl SocketTableParser for SsParser {
    fn summarize(&self, raw: &str) -> TrafficSummary {
        let mut summary = TrafficSummary::default();

        for line in raw.split('\n') {
            summary.total_lines += 1;

            let fields: Vec<&str> = line.split_whitespace().collect();
            let Some(local) = fields.get(4) else {
                continue;
            };
            let Some((host, port)) = local.rsplit_once(':') else {
                continue;
            };
            if port.is_empty() || !port.chars().all(|c| c.is_ascii_digit()) {
                continue;
            }

            let host = host.split('%').next().unwrap_or(host);
            let host = host.trim_start_matches('[').trim_end_matches(']');
            if host == "*" || host.parse::<std::net::IpAddr>().is_ok() {
                summary.record(fields[0], port);
            }
        }

        summary
    }
}

fn is_ipv6_endpoint(field: &str) -> bool {
    field.rsplit_once(':').is_some_and(|(host, port)| {
        port.parse::<u16>().is_ok() && host.parse::<Ipv6Addr>().is_ok()
    })
}

/// Summarizes a `netstat -tuln` dump.
///
/// # Example
///
/// ```
/// use hostwall::census::summarize;
///
/// let raw = "tcp        0      0 0.0.0.0:22              0.0.0.0:*               LISTEN";
/// let summary = summarize(raw);
/// assert_eq!(summary.listening_ports, ["22"]);
/// assert_eq!(summary.protocol_counts["tcp"], 1);
/// ```
pub fn summarize(raw: &str) -> TrafficSummary {
    NetstatParser.summarize(raw)
}


#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn test_netstat_never_panics(raw in "\\PC*") {
            let summary = summarize(&raw);
            prop_assert_eq!(summary.total_lines, raw.split('\n').count());
            let counted: usize = summary.protocol_counts.values().sum();
            prop_assert_eq!(counted, summary.listening_ports.len());
        }

        #[test]
        fn test_ss_never_panics(raw in "\\PC*") {
            let summary = SsParser.summarize(&raw);
            let counted: usize = summary.protocol_counts.values().sum();
            prop_assert_eq!(counted, summary.listening_ports.len());
        }

        #[test]
        fn test_ipv4_listener_is_counted(
            a in any::<u8>(),
            b in any::<u8>(),
            c in any::<u8>(),
            d in any::<u8>(),
            port in 1u16..=65535
        ) {
            let line = format!(
                "tcp        0      0 {a}.{b}.{c}.{d}:{port}      0.0.0.0:*     LISTEN"
            );
            let summary = summarize(&line);
            prop_assert_eq!(summary.listening_ports, vec![port.to_string()]);
        }
    }
}
