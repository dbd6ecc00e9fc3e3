use super::{FilterGateway, WriteStatus};
use crate::census::SocketTableFormat;
use crate::core::error::{Error, Result};
use crate::core::firewall::{Chain, RuleDescriptor, RuleKey};
use std::fmt::Write as _;
use std::sync::{Mutex, MutexGuard, PoisonError};
use strum::IntoEnumIterator;

/// Number of times each gateway operation was invoked
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GatewayCalls {
    pub list: usize,
    pub apply: usize,
    pub withdraw: usize,
    pub sockets: usize,
}

impl GatewayCalls {
    /// Calls that would have touched the filter engine's rule set
    pub fn writes(&self) -> usize {
        self.apply + self.withdraw
    }
}

#[derive(Debug, Default)]
struct State {
    rules: Vec<RuleKey>,
    calls: GatewayCalls,
    write_failure: Option<String>,
    listing_failure: Option<String>,
    sockets: String,
    socket_format: SocketTableFormat,
}

/// In-process gateway with the same contract as [`super::IptablesGateway`]
///
/// Keeps rules in insertion order and renders them like `iptables -L -n -v`,
/// so listings round-trip through [`crate::core::firewall::parse_listing`].
/// Backs `--dry-run` and the test suites, which use the call counters and
/// failure injection.
#[derive(Debug, Default)]
pub struct MemoryGateway {
    state: Mutex<State>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Gateway whose socket table returns `raw`, parsed as `format`.
    pub fn with_sockets(raw: impl Into<String>, format: SocketTableFormat) -> Self {
        let gateway = Self::new();
        {
            let mut state = gateway.lock();
            state.sockets = raw.into();
            state.socket_format = format;
        }
        gateway
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn calls(&self) -> GatewayCalls {
        self.lock().calls
    }

    /// Active rules in insertion order.
    pub fn rules(&self) -> Vec<RuleDescriptor> {
        self.lock().rules.iter().map(|k| k.to_descriptor()).collect()
    }

    /// Makes every subsequent apply/withdraw fail with `message`.
    pub fn fail_writes_with(&self, message: impl Into<String>) {
        self.lock().write_failure = Some(message.into());
    }

    /// Makes every subsequent listing fail with `message`.
    pub fn fail_listing_with(&self, message: impl Into<String>) {
        self.lock().listing_failure = Some(message.into());
    }

    pub fn clear_failures(&self) {
        let mut state = self.lock();
        state.write_failure = None;
        state.listing_failure = None;
    }
}

fn injected(message: &str) -> Error {
    Error::Engine {
        message: message.to_string(),
        stderr: Some(message.to_string()),
        exit_code: Some(1),
    }
}

fn key_of(rule: &RuleDescriptor) -> Result<RuleKey> {
    rule.key().ok_or_else(|| Error::Engine {
        message: format!("Bad argument in rule: {rule}"),
        stderr: None,
        exit_code: Some(2),
    })
}

fn render(rules: &[RuleKey]) -> String {
    let mut out = String::new();
    for chain in Chain::iter() {
        let _ = writeln!(out, "Chain {chain} (policy ACCEPT 0 packets, 0 bytes)");
        out.push_str(
            " pkts bytes target     prot opt in     out     source               destination\n",
        );
        for rule in rules.iter().filter(|r| r.chain == chain) {
            let (opt, any) = if rule.source.is_ipv6() {
                ("  ", "::/0")
            } else {
                ("--", "0.0.0.0/0")
            };
            let proto = rule.protocol.as_str();
            let source = rule.source.to_string();
            let _ = writeln!(
                out,
                "    0     0 ACCEPT     {proto:<4} {opt}  *      *       {source:<20} {any:<20} {proto} dpt:{}",
                rule.port
            );
        }
        out.push('\n');
    }
    out
}

impl FilterGateway for MemoryGateway {
    async fn list_rules(&self) -> Result<String> {
        let mut state = self.lock();
        state.calls.list += 1;
        if let Some(message) = &state.listing_failure {
            return Err(injected(message));
        }
        Ok(render(&state.rules))
    }

    async fn apply_rule(&self, rule: &RuleDescriptor) -> Result<WriteStatus> {
        let mut state = self.lock();
        state.calls.apply += 1;
        if let Some(message) = &state.write_failure {
            return Err(injected(message));
        }

        let key = key_of(rule)?;
        if state.rules.contains(&key) {
            return Ok(WriteStatus::AlreadyPresent);
        }
        state.rules.push(key);
        Ok(WriteStatus::Changed)
    }

    async fn withdraw_rule(&self, rule: &RuleDescriptor) -> Result<WriteStatus> {
        let mut state = self.lock();
        state.calls.withdraw += 1;
        if let Some(message) = &state.write_failure {
            return Err(injected(message));
        }

        let key = key_of(rule)?;
        match state.rules.iter().position(|k| *k == key) {
            Some(index) => {
                state.rules.remove(index);
                Ok(WriteStatus::Changed)
            }
            None => Ok(WriteStatus::NotPresent),
        }
    }

    async fn list_listening_sockets(&self) -> Result<String> {
        let mut state = self.lock();
        state.calls.sockets += 1;
        Ok(state.sockets.clone())
    }

    fn socket_table_format(&self) -> SocketTableFormat {
        self.lock().socket_format
    }
}
