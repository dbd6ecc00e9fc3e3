//! Filter gateway: the boundary to the host packet filter and socket table
//!
//! The rule engine only ever talks to a [`FilterGateway`]. Implementations:
//!
//! - [`IptablesGateway`]: iptables/ip6tables plus `ss`/`netstat`, elevated
//! - [`MemoryGateway`]: in-process rule table for dry runs and tests
//!
//! # Contract
//!
//! - `apply_rule` on a rule that is already present is a no-op and reports
//!   [`WriteStatus::AlreadyPresent`].
//! - `withdraw_rule` on an absent rule reports [`WriteStatus::NotPresent`],
//!   never a generic engine error.
//! - Any other failure of the facility is an `Error::Engine` carrying its
//!   diagnostic text.
//! - Calls are serialized: a gateway never runs two engine invocations at once.

mod iptables;
mod memory;

pub use iptables::IptablesGateway;
pub use memory::{GatewayCalls, MemoryGateway};

use crate::census::{SocketTableFormat, TrafficSummary};
use crate::core::error::Result;
use crate::core::firewall::RuleDescriptor;

/// Result of a write that reached the filter engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    /// The rule set changed
    Changed,
    /// Apply of a rule that was already active; nothing changed
    AlreadyPresent,
    /// Withdraw of a rule that was not active; nothing changed
    NotPresent,
}

#[allow(async_fn_in_trait)]
pub trait FilterGateway {
    /// Human-readable listing of the active rules.
    async fn list_rules(&self) -> Result<String>;

    async fn apply_rule(&self, rule: &RuleDescriptor) -> Result<WriteStatus>;

    async fn withdraw_rule(&self, rule: &RuleDescriptor) -> Result<WriteStatus>;

    /// Raw dump of listening sockets, in [`Self::socket_table_format`].
    async fn list_listening_sockets(&self) -> Result<String>;

    fn socket_table_format(&self) -> SocketTableFormat;
}

/// Dumps the socket table through `gateway` and summarizes it with the
/// parser matching the gateway's tool.
///
/// # Errors
///
/// Returns `Err` if the socket table cannot be read.
pub async fn take_census<G: FilterGateway>(gateway: &G) -> Result<TrafficSummary> {
    let raw = gateway.list_listening_sockets().await?;
    let summary = gateway.socket_table_format().parser().summarize(&raw);
    tracing::info!(
        "Traffic census completed: {} lines, {} listeners",
        summary.total_lines,
        summary.listening_ports.len()
    );
    Ok(summary)
}
