//! Shared test utilities for core module tests
//!
//! Provides common test helpers to avoid duplication across test suites.
//! This module is only compiled in test mode.

use crate::core::engine::RuleEngine;
use crate::core::firewall::{Chain, Protocol, RuleDescriptor};
use crate::core::gateway::MemoryGateway;
use std::sync::Mutex;

/// Mutex for tests that need exclusive access to environment variables.
///
/// Use this when your test needs to:
/// 1. Temporarily change env vars to different values
/// 2. Restore env vars after the test
/// 3. Test behavior when env vars are absent
///
/// # Example
///
/// ```ignore
/// let _guard = ENV_VAR_MUTEX.lock().unwrap();
/// unsafe {
///     std::env::set_var("HOSTWALL_ELEVATION_METHOD", "sudo");
/// }
/// // ... test with custom env state ...
/// unsafe {
///     std::env::remove_var("HOSTWALL_ELEVATION_METHOD");
/// }
/// ```
pub static ENV_VAR_MUTEX: Mutex<()> = Mutex::new(());

/// Drives a future to completion on a fresh single-threaded runtime.
///
/// Env-var tests hold the `ENV_VAR_MUTEX` guard for their whole body, so
/// they stay synchronous and await through this instead of `#[tokio::test]`.
pub fn block_on<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(future)
}

/// The reference rule: INPUT, 203.0.113.5, 443/tcp.
pub fn https_rule() -> RuleDescriptor {
    RuleDescriptor::new(Chain::Input, "203.0.113.5", 443, Protocol::Tcp)
}

/// INPUT tcp rule with the given source and port.
pub fn input_rule(source: &str, port: u32) -> RuleDescriptor {
    RuleDescriptor::new(Chain::Input, source, port, Protocol::Tcp)
}

/// Engine over a fresh in-memory gateway.
pub fn memory_engine() -> RuleEngine<MemoryGateway> {
    RuleEngine::new(MemoryGateway::new())
}
