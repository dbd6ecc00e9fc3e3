//! Single-slot snapshot store for the active rule set
//!
//! A snapshot is a JSON record `{timestamp, rules, checksum}` where `rules` is
//! either the opaque listing text or a sequence of rule descriptors. Saving
//! overwrites the previous record atomically; there is no history.
//!
//! Only structured snapshots can be replayed. An opaque listing is reported
//! back to the caller as informational and nothing is applied.

use crate::audit::{AuditEvent, AuditLog, EventType};
use crate::core::engine::{RuleEngine, RuleOutcome};
use crate::core::error::{Error, Result, SnapshotError};
use crate::core::firewall::{RuleDescriptor, is_counter, parse_listing};
use crate::core::gateway::FilterGateway;
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Rule payload of a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SnapshotRules {
    /// Listing text exactly as the filter engine printed it
    Raw(String),
    /// Descriptors that can be replayed through the rule engine
    Structured(Vec<RuleDescriptor>),
}

impl SnapshotRules {
    pub fn is_structured(&self) -> bool {
        matches!(self, SnapshotRules::Structured(_))
    }

    fn checksum(&self) -> Result<String> {
        let json = serde_json::to_string(self)?;
        let mut hasher = Sha256::new();
        hasher.update(json.as_bytes());
        Ok(format!("{:x}", hasher.finalize()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(with = "timestamp")]
    pub timestamp: DateTime<Utc>,
    pub rules: SnapshotRules,
    /// SHA-256 of the serialized `rules`; absent in records from older tools
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl Snapshot {
    fn capture(rules: SnapshotRules) -> Result<Self> {
        let checksum = rules.checksum()?;
        Ok(Self {
            timestamp: Utc::now(),
            rules,
            checksum: Some(checksum),
        })
    }

    fn verify(&self) -> Result<()> {
        let Some(expected) = &self.checksum else {
            return Ok(());
        };
        let actual = self.rules.checksum()?;
        if *expected == actual {
            Ok(())
        } else {
            Err(SnapshotError::ChecksumMismatch {
                expected: expected.clone(),
                actual,
            }
            .into())
        }
    }
}

/// RFC 3339 on write; RFC 3339 or naive ISO-8601 (taken as UTC) on read.
mod timestamp {
    use super::{DateTime, NaiveDateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::AutoSi, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        parse(&raw).ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp '{raw}'")))
    }

    pub fn parse(raw: &str) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(raw)
            .map(|ts| ts.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
                    .ok()
                    .map(|naive| naive.and_utc())
            })
    }
}

/// What a restore did
#[derive(Debug)]
pub enum RestoreReport {
    /// Every descriptor was replayed through the rule engine
    Replayed {
        timestamp: DateTime<Utc>,
        outcomes: Vec<RuleOutcome>,
    },
    /// The snapshot holds an opaque listing; nothing was applied
    InformationalOnly {
        timestamp: DateTime<Utc>,
        line_count: usize,
        /// Rules the listing parser could recover, for the operator's benefit
        recoverable: usize,
    },
}

impl RestoreReport {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            RestoreReport::Replayed { timestamp, .. }
            | RestoreReport::InformationalOnly { timestamp, .. } => *timestamp,
        }
    }

    pub fn outcomes(&self) -> &[RuleOutcome] {
        match self {
            RestoreReport::Replayed { outcomes, .. } => outcomes,
            RestoreReport::InformationalOnly { .. } => &[],
        }
    }

    pub fn is_informational(&self) -> bool {
        matches!(self, RestoreReport::InformationalOnly { .. })
    }
}

/// Drift between a snapshot and the live rule set
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotDiff {
    /// Present now, absent from the snapshot
    pub added: Vec<String>,
    /// In the snapshot, gone now
    pub removed: Vec<String>,
}

impl SnapshotDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    /// `- ` / `+ ` prefixed lines, removals first.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for line in &self.removed {
            let _ = writeln!(out, "- {line}");
        }
        for line in &self.added {
            let _ = writeln!(out, "+ {line}");
        }
        out
    }
}

pub struct SnapshotStore {
    path: PathBuf,
    lock: Mutex<()>,
    audit: Option<AuditLog>,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
            audit: None,
        }
    }

    #[must_use]
    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stores `listing` verbatim, replacing any previous snapshot.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the record cannot be written.
    pub async fn save(&self, listing: &str) -> Result<Snapshot> {
        self.write(SnapshotRules::Raw(listing.to_string())).await
    }

    /// Stores replayable descriptors, replacing any previous snapshot.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the record cannot be written.
    pub async fn save_structured(&self, rules: Vec<RuleDescriptor>) -> Result<Snapshot> {
        self.write(SnapshotRules::Structured(rules)).await
    }

    async fn write(&self, rules: SnapshotRules) -> Result<Snapshot> {
        let snapshot = Snapshot::capture(rules)?;
        let json = serde_json::to_string_pretty(&snapshot)?;

        let result = {
            let _guard = self.lock.lock().await;
            let path = self.path.clone();
            tokio::task::spawn_blocking(move || crate::utils::write_atomic(&path, json.as_bytes()))
                .await
                .map_err(std::io::Error::other)
                .and_then(|r| r)
        };

        let structured = snapshot.rules.is_structured();
        self.record(
            EventType::SaveSnapshot,
            result.as_ref().err().map(ToString::to_string),
            serde_json::json!({
                "path": self.path.display().to_string(),
                "structured": structured,
            }),
        )
        .await;

        match result {
            Ok(()) => {
                info!("Configuration saved to {}", self.path.display());
                Ok(snapshot)
            }
            Err(e) => {
                error!("Failed to save configuration: {e}");
                Err(e.into())
            }
        }
    }

    /// Reads the stored snapshot back.
    ///
    /// # Errors
    ///
    /// - `SnapshotError::NotFound` if nothing was saved yet
    /// - `SnapshotError::Corrupt` if the record does not parse
    /// - `SnapshotError::ChecksumMismatch` if the rules were altered
    pub async fn load(&self) -> Result<Snapshot> {
        let contents = {
            let _guard = self.lock.lock().await;
            tokio::fs::read_to_string(&self.path).await
        };

        let contents = match contents {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                error!("No saved configuration found");
                return Err(SnapshotError::NotFound(self.path.display().to_string()).into());
            }
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                return Err(SnapshotError::Corrupt(e.to_string()).into());
            }
            Err(e) => return Err(e.into()),
        };

        let snapshot: Snapshot = serde_json::from_str(&contents).map_err(|e| {
            error!("Snapshot {} is corrupt: {e}", self.path.display());
            Error::Snapshot(SnapshotError::Corrupt(e.to_string()))
        })?;
        snapshot.verify()?;

        Ok(snapshot)
    }

    /// Replays a structured snapshot through `engine`.
    ///
    /// Every descriptor is applied independently and gets its own outcome.
    /// An opaque snapshot is never replayed; the report says what it holds.
    pub async fn restore<G: FilterGateway>(
        &self,
        snapshot: &Snapshot,
        engine: &mut RuleEngine<G>,
    ) -> RestoreReport {
        info!(
            "Restoring configuration from {}",
            snapshot.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true)
        );

        let report = match &snapshot.rules {
            // Unchecksummed `[]` is what legacy tooling wrote when listing failed
            SnapshotRules::Structured(rules)
                if rules.is_empty() && snapshot.checksum.is_none() =>
            {
                warn!("Snapshot has no checksum and no rules; nothing to replay");
                RestoreReport::InformationalOnly {
                    timestamp: snapshot.timestamp,
                    line_count: 0,
                    recoverable: 0,
                }
            }
            SnapshotRules::Structured(rules) => RestoreReport::Replayed {
                timestamp: snapshot.timestamp,
                outcomes: engine.apply_batch(rules).await,
            },
            SnapshotRules::Raw(listing) => {
                let recoverable = parse_listing(listing).len();
                warn!(
                    "Snapshot holds an unstructured listing; no rules were replayed ({recoverable} recognisable)"
                );
                RestoreReport::InformationalOnly {
                    timestamp: snapshot.timestamp,
                    line_count: listing.lines().count(),
                    recoverable,
                }
            }
        };

        let failed = report.outcomes().iter().filter(|o| !o.is_success()).count();
        self.record(
            EventType::RestoreSnapshot,
            (failed > 0).then(|| format!("{failed} rule(s) failed to replay")),
            serde_json::json!({
                "path": self.path.display().to_string(),
                "informational_only": report.is_informational(),
                "replayed": report.outcomes().len(),
            }),
        )
        .await;

        report
    }

    async fn record(
        &self,
        event_type: EventType,
        error: Option<String>,
        details: serde_json::Value,
    ) {
        if let Some(audit) = &self.audit {
            audit
                .record(AuditEvent::new(event_type, error.is_none(), details, error))
                .await;
        }
    }
}

/// Compares a snapshot against the current listing.
///
/// Opaque snapshots are compared line by line with packet counters stripped;
/// structured snapshots are compared rule by rule against the rules
/// recoverable from `current`.
pub fn diff(snapshot: &Snapshot, current: &str) -> SnapshotDiff {
    let (old, new) = match &snapshot.rules {
        SnapshotRules::Raw(listing) => (normalize_listing(listing), normalize_listing(current)),
        SnapshotRules::Structured(rules) => {
            (rule_lines(rules), rule_lines(&parse_listing(current)))
        }
    };

    let text_diff = similar::TextDiff::from_lines(&old, &new);
    let mut result = SnapshotDiff::default();
    for change in text_diff.iter_all_changes() {
        let line = change.value().trim_end_matches('\n').to_string();
        match change.tag() {
            similar::ChangeTag::Delete => result.removed.push(line),
            similar::ChangeTag::Insert => result.added.push(line),
            similar::ChangeTag::Equal => {}
        }
    }
    result
}

fn rule_lines(rules: &[RuleDescriptor]) -> String {
    let mut out = String::new();
    for rule in rules {
        let _ = writeln!(out, "{rule}");
    }
    out
}

/// Drops blank lines, packet/byte counters and policy counters.
fn normalize_listing(listing: &str) -> String {
    let mut out = String::new();
    for line in listing.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        if let Some((head, policy)) = trimmed.split_once(" (policy ") {
            let verdict = policy.split_whitespace().next().unwrap_or_default();
            let verdict = verdict.trim_end_matches(')');
            let _ = writeln!(out, "{head} (policy {verdict})");
            continue;
        }

        let tokens: Vec<&str> = trimmed.split_whitespace().collect();
        let counted = tokens.len() > 2 && is_counter(tokens[0]) && is_counter(tokens[1]);
        let header = tokens.len() >= 2 && tokens[0] == "pkts";
        let body = if counted || header {
            &tokens[2..]
        } else {
            &tokens[..]
        };
        let _ = writeln!(out, "{}", body.join(" "));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::firewall::{Chain, Protocol};

    #[test]
    fn test_untagged_rules_shapes() {
        let raw: SnapshotRules = serde_json::from_str(r#""Chain INPUT""#).unwrap();
        assert_eq!(raw, SnapshotRules::Raw("Chain INPUT".to_string()));

        let structured: SnapshotRules =
            serde_json::from_str(r#"[{"chain":"INPUT","source":"192.0.2.1","port":22}]"#).unwrap();
        assert!(structured.is_structured());
    }

    #[test]
    fn test_naive_timestamp_accepted() {
        let json = r#"{"timestamp":"2024-03-01T12:30:45.123456","rules":"Chain INPUT (policy ACCEPT)"}"#;
        let snapshot: Snapshot = serde_json::from_str(json).unwrap();
        assert_eq!(
            snapshot.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
            "2024-03-01T12:30:45.123456Z"
        );
        assert!(snapshot.checksum.is_none());
        assert!(snapshot.verify().is_ok());
    }

    #[test]
    fn test_rfc3339_with_offset_normalised_to_utc() {
        let ts = timestamp::parse("2024-03-01T14:00:00+02:00").unwrap();
        assert_eq!(ts.to_rfc3339(), "2024-03-01T12:00:00+00:00");
        assert!(timestamp::parse("yesterday").is_none());
    }

    #[test]
    fn test_checksum_detects_tampering() {
        let mut snapshot = Snapshot::capture(SnapshotRules::Raw("a".to_string())).unwrap();
        assert!(snapshot.verify().is_ok());

        snapshot.rules = SnapshotRules::Raw("b".to_string());
        let err = snapshot.verify().unwrap_err();
        assert!(matches!(
            err,
            Error::Snapshot(SnapshotError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_diff_ignores_counters() {
        let before = "\
Chain INPUT (policy ACCEPT 0 packets, 0 bytes)
 pkts bytes target     prot opt in     out     source               destination
    0     0 ACCEPT     tcp  --  *      *       203.0.113.5          0.0.0.0/0            tcp dpt:443
";
        let after = "\
Chain INPUT (policy ACCEPT 912 packets, 81K bytes)
 pkts bytes target     prot opt in     out     source               destination
   42  2520 ACCEPT     tcp  --  *      *       203.0.113.5          0.0.0.0/0            tcp dpt:443
    0     0 ACCEPT     udp  --  *      *       198.51.100.7         0.0.0.0/0            udp dpt:53
";
        let snapshot = Snapshot::capture(SnapshotRules::Raw(before.to_string())).unwrap();
        let drift = diff(&snapshot, after);

        assert!(drift.removed.is_empty());
        assert_eq!(drift.added.len(), 1);
        assert!(drift.added[0].contains("198.51.100.7"));
        assert!(drift.render().starts_with("+ "));
    }

    #[test]
    fn test_diff_tolerates_bare_header_token() {
        let snapshot = Snapshot::capture(SnapshotRules::Raw(
            "Chain INPUT (policy ACCEPT)\npkts\n".to_string(),
        ))
        .unwrap();
        let drift = diff(&snapshot, "Chain INPUT (policy ACCEPT)\n");

        assert!(drift.added.is_empty());
        assert_eq!(drift.removed, ["pkts"]);
    }

    #[test]
    fn test_diff_structured() {
        let kept = RuleDescriptor::new(Chain::Input, "203.0.113.5", 443, Protocol::Tcp);
        let gone = RuleDescriptor::new(Chain::Input, "192.0.2.9", 22, Protocol::Tcp);
        let snapshot =
            Snapshot::capture(SnapshotRules::Structured(vec![kept.clone(), gone.clone()])).unwrap();

        let current = "\
Chain INPUT (policy ACCEPT)
target     prot opt source               destination
ACCEPT     tcp  --  203.0.113.5          0.0.0.0/0            tcp dpt:443
";
        let drift = diff(&snapshot, current);
        assert!(drift.added.is_empty());
        assert_eq!(drift.removed, vec![gone.to_string()]);
    }

    #[test]
    fn test_identical_listing_has_no_drift() {
        let listing = "Chain OUTPUT (policy ACCEPT)\ntarget     prot opt source               destination\n";
        let snapshot = Snapshot::capture(SnapshotRules::Raw(listing.to_string())).unwrap();
        assert!(diff(&snapshot, listing).is_empty());
    }
}
