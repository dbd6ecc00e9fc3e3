//! hostwall - host firewall rule manager
//!
//! Declares, applies, withdraws, snapshots and restores iptables filter rules,
//! and summarizes the listening-socket table.
//!
//! # Architecture
//!
//! - [`core`] - Rule model, filter gateway, rule engine and snapshot store
//! - [`census`] - Socket-table parsing into a traffic summary
//! - [`validators`] - Input validation for rule descriptors
//! - [`audit`] - Security audit logging for all mutating operations
//! - [`elevation`] - Privilege escalation via sudo/run0
//! - [`config`] - Configuration persistence
//! - [`utils`] - Utility functions (XDG directories, atomic writes)
//!
//! # Safety Features
//!
//! - Every rule is validated before any privileged call
//! - Presence checks make apply and withdraw idempotent
//! - Bounded, serialized calls into the packet filter
//! - SHA-256 snapshot checksums
//! - Atomic file operations with secure permissions

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_errors_doc)]

pub mod audit;
pub mod census;
pub mod config;
pub mod core;
pub mod elevation;
pub mod utils;
pub mod validators;

// Re-export commonly used types
pub use census::{TrafficSummary, summarize};
pub use core::engine::{RuleEngine, RuleOutcome};
pub use core::error::{Error, Result};
pub use core::firewall::{Chain, Protocol, RuleDescriptor};
pub use core::gateway::{FilterGateway, IptablesGateway, MemoryGateway};
pub use core::snapshot::{Snapshot, SnapshotStore};
