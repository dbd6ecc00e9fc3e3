//! Rule engine: validated, idempotent rule changes through a [`FilterGateway`]
//!
//! Every mutating call runs the validator first; a descriptor that fails never
//! reaches the gateway. Every call produces exactly one [`RuleOutcome`], which
//! the caller owns. Gateway failures become failed outcomes rather than errors,
//! so a batch keeps going after one bad rule.
//!
//! Rules applied during the session are tracked in a [`RuleIndex`] keyed by
//! identity tuple, independent of how the underlying engine matches rules.

use crate::audit::{AuditEvent, AuditLog};
use crate::core::error::{Error, ErrorTranslation, IptablesErrorPattern, Result};
use crate::core::firewall::{RuleDescriptor, RuleKey, parse_listing};
use crate::core::gateway::{FilterGateway, WriteStatus};
use crate::validators::{self, Violation};
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Operation {
    Applied,
    Withdrawn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Status {
    Success,
    NotFound,
    EngineError,
}

/// Machine-checkable result of one operation, usable as a process exit code
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ResultCode {
    Success = 0,
    NotFound = 2,
    Validation = 3,
    Engine = 4,
}

impl ResultCode {
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Result of one apply or withdraw
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleOutcome {
    pub descriptor: RuleDescriptor,
    pub operation: Operation,
    pub status: Status,
    /// Engine diagnostic or validation summary; a note for idempotent no-ops
    pub message: Option<String>,
    /// Non-empty only when the descriptor was rejected before the gateway
    pub violations: Vec<Violation>,
}

impl RuleOutcome {
    fn new(descriptor: &RuleDescriptor, operation: Operation, status: Status) -> Self {
        Self {
            descriptor: descriptor.clone(),
            operation,
            status,
            message: None,
            violations: Vec::new(),
        }
    }

    fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }

    pub fn is_validation_failure(&self) -> bool {
        !self.violations.is_empty()
    }

    pub fn result_code(&self) -> ResultCode {
        match self.status {
            Status::Success => ResultCode::Success,
            Status::NotFound => ResultCode::NotFound,
            Status::EngineError if self.is_validation_failure() => ResultCode::Validation,
            Status::EngineError => ResultCode::Engine,
        }
    }

    /// One line for the operator, in the log's wording.
    pub fn status_line(&self) -> String {
        let rule = &self.descriptor;
        let detail = self.message.as_deref().unwrap_or("unknown error");
        match (self.operation, self.status) {
            (Operation::Applied, Status::Success) => match &self.message {
                Some(note) => format!("Rule Added: {rule} ({note})"),
                None => format!("Rule Added: {rule}"),
            },
            (Operation::Withdrawn, Status::Success) => format!("Rule Deleted: {rule}"),
            (_, Status::NotFound) => format!("Rule Not Found: {rule}"),
            (_, Status::EngineError) if self.is_validation_failure() => {
                format!("Rule Rejected: {rule}: {detail}")
            }
            (Operation::Applied, Status::EngineError) => format!("Failed to add rule: {detail}"),
            (Operation::Withdrawn, Status::EngineError) => {
                format!("Failed to delete rule: {detail}")
            }
        }
    }

    /// Operator hints for an engine failure.
    pub fn translation(&self) -> Option<ErrorTranslation> {
        if self.status != Status::EngineError || self.is_validation_failure() {
            return None;
        }
        self.message.as_deref().map(IptablesErrorPattern::match_error)
    }
}

/// Output of [`RuleEngine::list`]
///
/// A failed listing yields empty text plus the failure, so the caller can log
/// it without the listing ever raising.
#[derive(Debug)]
pub struct RuleListing {
    pub text: String,
    pub failure: Option<Error>,
}

impl RuleListing {
    pub fn is_ok(&self) -> bool {
        self.failure.is_none()
    }
}

/// Rules applied by this session, keyed by identity, in application order
#[derive(Debug, Clone, Default)]
pub struct RuleIndex {
    entries: Vec<(RuleKey, DateTime<Utc>)>,
}

impl RuleIndex {
    pub fn contains(&self, key: &RuleKey) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    fn insert(&mut self, key: RuleKey) {
        if !self.contains(&key) {
            self.entries.push((key, Utc::now()));
        }
    }

    fn remove(&mut self, key: &RuleKey) {
        self.entries.retain(|(k, _)| k != key);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// When `key` was applied, if this session applied it.
    pub fn applied_at(&self, key: &RuleKey) -> Option<DateTime<Utc>> {
        self.entries
            .iter()
            .find_map(|(k, at)| (k == key).then_some(*at))
    }

    pub fn descriptors(&self) -> Vec<RuleDescriptor> {
        self.entries.iter().map(|(k, _)| k.to_descriptor()).collect()
    }
}

pub struct RuleEngine<G> {
    gateway: G,
    index: RuleIndex,
    audit: Option<AuditLog>,
}

impl<G: FilterGateway> RuleEngine<G> {
    pub fn new(gateway: G) -> Self {
        Self {
            gateway,
            index: RuleIndex::default(),
            audit: None,
        }
    }

    /// Records every outcome in `audit`.
    #[must_use]
    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    pub fn applied(&self) -> &RuleIndex {
        &self.index
    }

    /// Makes `rule` active. Applying an active rule succeeds without change.
    pub async fn apply(&mut self, rule: &RuleDescriptor) -> RuleOutcome {
        let outcome = match validate(rule, Operation::Applied) {
            Err(rejected) => rejected,
            Ok(key) => {
                log_advisories(&key);
                match self.gateway.apply_rule(rule).await {
                    Ok(status) => {
                        self.index.insert(key);
                        info!("Rule Added: {rule}");
                        let outcome = RuleOutcome::new(rule, Operation::Applied, Status::Success);
                        if status == WriteStatus::AlreadyPresent {
                            outcome.with_message("already present")
                        } else {
                            outcome
                        }
                    }
                    Err(e) => {
                        error!("Failed to add rule: {e}");
                        RuleOutcome::new(rule, Operation::Applied, Status::EngineError)
                            .with_message(engine_detail(&e))
                    }
                }
            }
        };

        self.audit(&outcome).await;
        outcome
    }

    /// Removes `rule`. Withdrawing an absent rule reports `NotFound`.
    pub async fn withdraw(&mut self, rule: &RuleDescriptor) -> RuleOutcome {
        let outcome = match validate(rule, Operation::Withdrawn) {
            Err(rejected) => rejected,
            Ok(key) => match self.gateway.withdraw_rule(rule).await {
                Ok(WriteStatus::NotPresent) => {
                    self.index.remove(&key);
                    warn!("Rule not found: {rule}");
                    RuleOutcome::new(rule, Operation::Withdrawn, Status::NotFound)
                        .with_message("no matching rule in chain")
                }
                Ok(_) => {
                    self.index.remove(&key);
                    info!("Rule Deleted: {rule}");
                    RuleOutcome::new(rule, Operation::Withdrawn, Status::Success)
                }
                Err(e) => {
                    error!("Failed to delete rule: {e}");
                    RuleOutcome::new(rule, Operation::Withdrawn, Status::EngineError)
                        .with_message(engine_detail(&e))
                }
            },
        };

        self.audit(&outcome).await;
        outcome
    }

    /// Applies each rule in order; every rule gets its own outcome.
    pub async fn apply_batch(&mut self, rules: &[RuleDescriptor]) -> Vec<RuleOutcome> {
        let mut outcomes = Vec::with_capacity(rules.len());
        for rule in rules {
            outcomes.push(self.apply(rule).await);
        }
        outcomes
    }

    pub async fn withdraw_batch(&mut self, rules: &[RuleDescriptor]) -> Vec<RuleOutcome> {
        let mut outcomes = Vec::with_capacity(rules.len());
        for rule in rules {
            outcomes.push(self.withdraw(rule).await);
        }
        outcomes
    }

    /// Current listing, unmodified and in the engine's order.
    pub async fn list(&self) -> RuleListing {
        match self.gateway.list_rules().await {
            Ok(text) => RuleListing {
                text,
                failure: None,
            },
            Err(e) => {
                error!("Failed to list rules: {e}");
                RuleListing {
                    text: String::new(),
                    failure: Some(e),
                }
            }
        }
    }

    /// Descriptors recoverable from the live listing.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the gateway cannot list rules.
    pub async fn recovered_rules(&self) -> Result<Vec<RuleDescriptor>> {
        let text = self.gateway.list_rules().await?;
        let rules = parse_listing(&text);
        debug!("Recovered {} rules from listing", rules.len());
        Ok(rules)
    }

    async fn audit(&self, outcome: &RuleOutcome) {
        if let Some(audit) = &self.audit {
            audit.record(AuditEvent::from_outcome(outcome)).await;
        }
    }
}

/// Runs the validator; on failure builds the rejected outcome.
fn validate(
    rule: &RuleDescriptor,
    operation: Operation,
) -> std::result::Result<RuleKey, RuleOutcome> {
    let violations = validators::validate_descriptor(rule);
    if violations.is_empty()
        && let Some(key) = rule.key()
    {
        return Ok(key);
    }

    for violation in &violations {
        error!("Invalid rule: {violation}");
    }
    let message = violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ");
    let mut outcome = RuleOutcome::new(rule, operation, Status::EngineError).with_message(message);
    outcome.violations = violations;
    Err(outcome)
}

fn log_advisories(key: &RuleKey) {
    if let Some(note) = validators::check_well_known_port(key.port) {
        debug!("{note}");
    }
    if let Some(note) = validators::check_reserved_ip(key.source) {
        debug!("{note}");
    }
}

/// Facility diagnostic when available, otherwise the error text.
fn engine_detail(error: &Error) -> String {
    match error {
        Error::Engine {
            stderr: Some(stderr),
            ..
        } => stderr.clone(),
        other => other.to_string(),
    }
}
