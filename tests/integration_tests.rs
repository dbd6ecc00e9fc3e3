//! Integration tests for hostwall
//!
//! These tests drive the real `IptablesGateway` end to end: process spawning,
//! presence checks, error classification, listing recovery and snapshots.
//!
//! # Running with Mock
//!
//! The gateway is pointed at `tests/mock_iptables.sh`, which keeps its rules in
//! a per-test temp file, so no privileges or real firewall are involved:
//! ```bash
//! cargo test --test integration_tests
//! ```

#![allow(clippy::uninlined_format_args)]

use hostwall::census::SocketTableFormat;
use hostwall::config::AppConfig;
use hostwall::core::engine::{ResultCode, RuleEngine, Status};
use hostwall::core::error::Error;
use hostwall::core::firewall::{Chain, Protocol, RuleDescriptor};
use hostwall::core::gateway::{FilterGateway, IptablesGateway, take_census};
use hostwall::core::snapshot::{SnapshotRules, SnapshotStore, diff};
use hostwall::elevation::ElevationMethod;
use std::path::PathBuf;
use tempfile::TempDir;

const NETSTAT_DUMP: &str = "\
Active Internet connections (only servers)
Proto Recv-Q Send-Q Local Address           Foreign Address         State
tcp        0      0 0.0.0.0:22              0.0.0.0:*               LISTEN
tcp        0      0 127.0.0.1:5432          0.0.0.0:*               LISTEN
udp        0      0 0.0.0.0:68              0.0.0.0:*
tcp6       0      0 :::22                   :::*                    LISTEN
";

/// Get the path to the mock iptables script
fn mock_script() -> String {
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.push("tests");
    path.push("mock_iptables.sh");
    path.display().to_string()
}

/// Per-test directory holding the mock's rule state, snapshot and fixtures
struct Harness {
    dir: TempDir,
    config: AppConfig,
}

impl Harness {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let sockets = dir.path().join("sockets.txt");
        std::fs::write(&sockets, NETSTAT_DUMP).unwrap();

        let state = |name: &str| dir.path().join(name).display().to_string();
        let config = AppConfig {
            snapshot_path: Some(dir.path().join("firewall_snapshot.json")),
            audit_log_path: Some(dir.path().join("audit.log")),
            command_timeout_secs: 10,
            iptables_command: vec!["sh".to_string(), mock_script(), state("v4.rules")],
            ip6tables_command: vec!["sh".to_string(), mock_script(), state("v6.rules")],
            socket_command: Some(vec!["cat".to_string(), sockets.display().to_string()]),
            socket_format: Some(SocketTableFormat::Netstat),
            ..AppConfig::default()
        };

        Self { dir, config }
    }

    fn gateway(&self) -> IptablesGateway {
        IptablesGateway::with_method(&self.config, ElevationMethod::Direct).unwrap()
    }

    fn engine(&self) -> RuleEngine<IptablesGateway> {
        RuleEngine::new(self.gateway())
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn read(&self, name: &str) -> String {
        std::fs::read_to_string(self.path(name)).unwrap_or_default()
    }

    fn calls(&self, name: &str) -> Vec<String> {
        self.read(&format!("{name}.log"))
            .lines()
            .map(String::from)
            .collect()
    }
}

fn https_rule() -> RuleDescriptor {
    RuleDescriptor::new(Chain::Input, "203.0.113.5", 443, Protocol::Tcp)
}

#[tokio::test]
async fn test_end_to_end_scenario() {
    let harness = Harness::new();
    let mut engine = harness.engine();
    let rule = https_rule();

    assert_eq!(engine.apply(&rule).await.status, Status::Success);

    let listing = engine.list().await;
    assert!(listing.is_ok());
    assert!(
        listing
            .text
            .lines()
            .any(|l| l.contains("203.0.113.5") && l.contains("dpt:443")),
        "listing was:\n{}",
        listing.text
    );

    assert_eq!(engine.withdraw(&rule).await.status, Status::Success);
    assert!(!engine.list().await.text.contains("203.0.113.5"));

    let outcome = engine.withdraw(&rule).await;
    assert_eq!(outcome.status, Status::NotFound);
    assert_eq!(outcome.result_code(), ResultCode::NotFound);
}

#[tokio::test]
async fn test_apply_checks_presence_first() {
    let harness = Harness::new();
    let mut engine = harness.engine();

    engine.apply(&https_rule()).await;
    let second = engine.apply(&https_rule()).await;

    assert_eq!(second.status, Status::Success);
    assert_eq!(harness.read("v4.rules").lines().count(), 1);

    let ops: Vec<_> = harness
        .calls("v4.rules")
        .iter()
        .map(|c| c.split_whitespace().next().unwrap_or_default().to_string())
        .collect();
    assert_eq!(ops, ["-C", "-A", "-C"]);
}

#[tokio::test]
async fn test_invalid_rule_never_spawns_engine() {
    let harness = Harness::new();
    let mut engine = harness.engine();

    let outcome = engine
        .apply(&RuleDescriptor::new(Chain::Input, "999.1.1.1", 65536, Protocol::Tcp))
        .await;

    assert_eq!(outcome.result_code(), ResultCode::Validation);
    assert_eq!(outcome.violations.len(), 2);
    assert!(harness.calls("v4.rules").is_empty());
}

#[tokio::test]
async fn test_engine_failure_carries_stderr() {
    let harness = Harness::new();
    std::fs::write(
        harness.path("v4.rules.fail"),
        "Another app is currently holding the xtables lock. Perhaps you want to use the -w option?\n",
    )
    .unwrap();
    let mut engine = harness.engine();

    let outcome = engine.apply(&https_rule()).await;
    assert_eq!(outcome.status, Status::EngineError);
    assert_eq!(outcome.result_code(), ResultCode::Engine);
    assert!(outcome.message.as_deref().unwrap().contains("xtables lock"));

    let outcome = engine.withdraw(&https_rule()).await;
    assert_eq!(outcome.status, Status::EngineError);

    let listing = engine.list().await;
    assert!(listing.text.is_empty());
    match listing.failure {
        Some(Error::Engine { exit_code, stderr, .. }) => {
            assert_eq!(exit_code, Some(4));
            assert!(stderr.unwrap().contains("xtables"));
        }
        other => panic!("unexpected failure: {other:?}"),
    }
}

#[tokio::test]
async fn test_ipv6_rules_use_ip6tables() {
    let harness = Harness::new();
    let mut engine = harness.engine();
    let rule = RuleDescriptor::new(Chain::Input, "2001:db8::10", 22, Protocol::Tcp);

    assert!(engine.apply(&rule).await.is_success());
    assert!(harness.read("v4.rules").is_empty());
    assert_eq!(harness.read("v6.rules").trim(), "INPUT tcp 2001:db8::10 22");

    // Listing concatenates both families
    let recovered = engine.recovered_rules().await.unwrap();
    assert_eq!(recovered, vec![rule]);
}

#[tokio::test]
async fn test_ipv6_listing_failure_is_reported() {
    let harness = Harness::new();
    let mut engine = harness.engine();
    let rule = RuleDescriptor::new(Chain::Input, "2001:db8::10", 22, Protocol::Tcp);
    assert!(engine.apply(&rule).await.is_success());

    std::fs::write(
        harness.path("v6.rules.fail"),
        "can't initialize ip6tables table `filter'\n",
    )
    .unwrap();

    let listing = engine.list().await;
    assert!(!listing.is_ok());
    assert!(listing.text.is_empty());
    assert!(matches!(listing.failure, Some(Error::Engine { exit_code: Some(4), .. })));
    assert!(engine.recovered_rules().await.is_err());
}

#[tokio::test]
async fn test_census_through_gateway() {
    let harness = Harness::new();
    let gateway = harness.gateway();

    let summary = take_census(&gateway).await.unwrap();
    assert_eq!(summary.listening_ports, ["22", "5432", "68", "22"]);
    assert_eq!(summary.protocol_counts.get("tcp"), Some(&2));
    assert_eq!(summary.protocol_counts.get("udp"), Some(&1));
    assert_eq!(summary.protocol_counts.get("tcp6"), Some(&1));
    assert!(!summary.protocol_counts.contains_key("Proto"));
}

#[tokio::test]
async fn test_structured_snapshot_replays_after_flush() {
    let harness = Harness::new();
    let store = SnapshotStore::new(harness.config.snapshot_path());
    let mut engine = harness.engine();

    let rules = vec![
        https_rule(),
        RuleDescriptor::new(Chain::Forward, "198.51.100.4", 53, Protocol::Udp),
    ];
    engine.apply_batch(&rules).await;
    store
        .save_structured(engine.recovered_rules().await.unwrap())
        .await
        .unwrap();

    // Simulate a flushed firewall
    std::fs::write(harness.path("v4.rules"), "").unwrap();

    let snapshot = store.load().await.unwrap();
    let drift = diff(&snapshot, &engine.list().await.text);
    assert_eq!(drift.removed.len(), 2);

    let report = store.restore(&snapshot, &mut engine).await;
    assert!(!report.is_informational());
    assert!(report.outcomes().iter().all(|o| o.is_success()));
    // Listing order is INPUT, FORWARD, OUTPUT
    assert_eq!(engine.recovered_rules().await.unwrap(), rules);
    assert!(diff(&snapshot, &engine.list().await.text).is_empty());
}

#[tokio::test]
async fn test_raw_snapshot_is_not_replayed() {
    let harness = Harness::new();
    let store = SnapshotStore::new(harness.config.snapshot_path());
    let mut engine = harness.engine();

    engine.apply(&https_rule()).await;
    let listing = engine.list().await.text;
    store.save(&listing).await.unwrap();

    let snapshot = store.load().await.unwrap();
    assert_eq!(snapshot.rules, SnapshotRules::Raw(listing));

    let before = harness.calls("v4.rules").len();
    let report = store.restore(&snapshot, &mut engine).await;
    assert!(report.is_informational());
    assert_eq!(harness.calls("v4.rules").len(), before);
}

#[tokio::test]
async fn test_hung_engine_times_out() {
    let harness = Harness::new();
    let config = AppConfig {
        command_timeout_secs: 1,
        iptables_command: vec!["sh".to_string(), "-c".to_string(), "sleep 30".to_string()],
        ..harness.config.clone()
    };
    let gateway = IptablesGateway::with_method(&config, ElevationMethod::Direct).unwrap();

    let started = std::time::Instant::now();
    let err = gateway.list_rules().await.unwrap_err();
    assert!(err.to_string().contains("timed out"));
    assert!(started.elapsed() < std::time::Duration::from_secs(10));
}

#[tokio::test]
async fn test_connect_without_elevation() {
    let harness = Harness::new();
    // SAFETY: only this test reads the variable
    unsafe {
        std::env::set_var("HOSTWALL_TEST_NO_ELEVATION", "1");
    }

    let gateway = IptablesGateway::connect(&harness.config).await.unwrap();
    assert_eq!(gateway.socket_table_format(), SocketTableFormat::Netstat);
    assert!(gateway.list_rules().await.unwrap().contains("Chain INPUT"));
}

#[tokio::test]
async fn test_audit_trail_written() {
    let harness = Harness::new();
    let audit = hostwall::audit::AuditLog::new(harness.config.audit_log_path());
    let mut engine = harness.engine().with_audit(audit.clone());

    engine.apply(&https_rule()).await;
    engine.withdraw(&https_rule()).await;

    let events = audit.read_recent(5).await.unwrap();
    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|e| e.success));
    assert!(harness.config.audit_log_path().exists());
}
