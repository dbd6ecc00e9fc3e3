use crate::validators::Violation;
use thiserror::Error;

/// Core error types for hostwall
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Rule descriptor failed validation and never reached the gateway
    #[error("Validation failed: {}", format_violations(.violations))]
    Validation { violations: Vec<Violation> },

    /// The process lacks the rights to read or write filter state
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// The packet-filter facility rejected or failed the call
    #[error("Filter engine error: {message}")]
    Engine {
        message: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },

    /// Withdraw of a rule that is not present
    #[error("Rule not found: {0}")]
    NotFound(String),

    /// Snapshot operation failed
    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    /// No compatible packet-filter facility on this host
    #[error("Unsupported platform: {0}")]
    UnsupportedPlatform(String),

    /// Privilege escalation could not be arranged
    #[error("Elevation error: {0}")]
    Elevation(#[from] crate::elevation::ElevationError),
}

/// Snapshot-specific errors
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("No snapshot at {0}")]
    NotFound(String),

    #[error("Snapshot corrupted: {0}")]
    Corrupt(String),

    #[error("Snapshot checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
}

/// Coarse error taxonomy for callers that branch on the failure class only
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ErrorKind {
    #[strum(serialize = "validation")]
    Validation,
    #[strum(serialize = "permission-denied")]
    PermissionDenied,
    #[strum(serialize = "engine")]
    Engine,
    #[strum(serialize = "not-found")]
    NotFound,
    #[strum(serialize = "corrupt-data")]
    CorruptData,
    #[strum(serialize = "unsupported-platform")]
    UnsupportedPlatform,
}

impl Error {
    pub fn engine(message: impl Into<String>) -> Self {
        Error::Engine {
            message: message.into(),
            stderr: None,
            exit_code: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation { .. } => ErrorKind::Validation,
            Error::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Error::NotFound(_) | Error::Snapshot(SnapshotError::NotFound(_)) => {
                ErrorKind::NotFound
            }
            Error::Snapshot(_) | Error::Serialization(_) => ErrorKind::CorruptData,
            Error::UnsupportedPlatform(_) => ErrorKind::UnsupportedPlatform,
            Error::Elevation(e) if e.is_permission_problem() => ErrorKind::PermissionDenied,
            Error::Engine { .. } | Error::Io(_) | Error::Elevation(_) => ErrorKind::Engine,
        }
    }

    /// Fatal errors end the session at startup instead of becoming an outcome.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::PermissionDenied | ErrorKind::UnsupportedPlatform
        )
    }
}

fn format_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Represents a translated error with helpful context
#[derive(Debug, Clone)]
pub struct ErrorTranslation {
    pub user_message: String,
    pub suggestions: Vec<String>,
}

impl ErrorTranslation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            user_message: message.into(),
            suggestions: Vec::new(),
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }
}

/// Database of iptables error patterns and their translations
pub struct IptablesErrorPattern;

impl IptablesErrorPattern {
    /// Matches an error message against known patterns and returns a user-friendly translation.
    pub fn match_error(msg: &str) -> ErrorTranslation {
        let lower = msg.to_lowercase();

        if lower.contains("permission denied")
            || lower.contains("operation not permitted")
            || lower.contains("you must be root")
        {
            return ErrorTranslation::new("Insufficient permissions to modify firewall rules")
                .with_suggestion("Run as root, or configure passwordless sudo for iptables")
                .with_suggestion("Check that CAP_NET_ADMIN is available to this process");
        }

        if lower.contains("no such file") || lower.contains("command not found") {
            return ErrorTranslation::new("iptables is not installed or not found in PATH")
                .with_suggestion("Install iptables: sudo apt install iptables  (Debian/Ubuntu)")
                .with_suggestion("Or: sudo dnf install iptables-nft  (Fedora/RHEL)")
                .with_suggestion("Or: sudo pacman -S iptables-nft  (Arch)");
        }

        if lower.contains("xtables lock") || lower.contains("resource temporarily unavailable") {
            return ErrorTranslation::new("Another process holds the xtables lock")
                .with_suggestion("Another firewall tool may be modifying rules right now")
                .with_suggestion("Wait a moment and try again");
        }

        if lower.contains("does a matching rule exist") || lower.contains("bad rule") {
            return ErrorTranslation::new("No matching rule exists in that chain")
                .with_suggestion("List current rules to see what is active");
        }

        if lower.contains("no chain/target/match by that name") {
            return ErrorTranslation::new("Chain, target or match module not available")
                .with_suggestion("Check the chain name: INPUT, OUTPUT or FORWARD")
                .with_suggestion("Load the conntrack/multiport modules if they are missing");
        }

        if lower.contains("host/network") && lower.contains("not found") {
            return ErrorTranslation::new("Invalid source address")
                .with_suggestion("Use a literal address such as 192.0.2.10 or 2001:db8::10");
        }

        if lower.contains("invalid port") || lower.contains("port") && lower.contains("range") {
            return ErrorTranslation::new("Invalid destination port")
                .with_suggestion("Port numbers must be between 1 and 65535");
        }

        if lower.contains("timed out") {
            return ErrorTranslation::new("Firewall command timed out")
                .with_suggestion("Check system load and the xtables lock holder")
                .with_suggestion("Raise command_timeout_secs in the configuration");
        }

        ErrorTranslation::new(format!("Firewall error: {msg}"))
            .with_suggestion("Check the detailed error message for more information")
            .with_suggestion("Verify iptables works: sudo iptables -L -n")
    }
}

pub type Result<T> = std::result::Result<T, Error>;
