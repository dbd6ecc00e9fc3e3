//! Core firewall management functionality
//!
//! This module contains the core types and logic for managing iptables filter rules.
//! It provides:
//!
//! - [`firewall`]: Rule descriptors, identity keys and listing recovery
//! - [`gateway`]: The boundary to the host packet filter and socket table
//! - [`engine`]: Validated, idempotent apply/withdraw with structured outcomes
//! - [`snapshot`]: Single-slot snapshot persistence, restore and drift
//! - [`error`]: Error types for firewall operations

pub mod engine;
pub mod error;
pub mod firewall;
pub mod gateway;
pub mod snapshot;

#[cfg(test)]
pub mod test_helpers;
