//! Privilege elevation for packet-filter operations
//!
//! Reading and writing filter state needs root. hostwall checks this once, at
//! gateway construction, and then prefixes every engine invocation with the
//! chosen method. Elevation is always non-interactive: a missing right is a
//! fatal `PermissionDenied`, never a password prompt in the middle of a batch.
//!
//! # Elevation Strategy
//!
//! 1. Already root: run tools directly
//! 2. `HOSTWALL_ELEVATION_METHOD` override (`sudo`, `run0` or `none`)
//! 3. Automatic: `sudo -n`, accepted only if `sudo -n true` succeeds
//!
//! # Environment Variables
//!
//! - `HOSTWALL_ELEVATION_METHOD`: Force a specific elevation method. `none` runs
//!   tools directly, for hosts where CAP_NET_ADMIN is granted some other way.
//! - `HOSTWALL_TEST_NO_ELEVATION`: Bypass elevation entirely (for testing only).
//!
//! # Security
//!
//! - Commands are constructed without shell interpolation
//! - All descriptor fields are validated before they reach an argument vector
//! - Binaries (sudo/run0, target program) are checked for availability

use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Error type for privilege elevation operations
#[derive(Debug, thiserror::Error)]
pub enum ElevationError {
    /// Requested elevation method is not available (binary not found)
    #[error("Elevation method '{0}' is not available (binary not found)")]
    MethodNotAvailable(String),

    /// Invalid value for `HOSTWALL_ELEVATION_METHOD`
    #[error("Invalid HOSTWALL_ELEVATION_METHOD '{0}'. Valid options: sudo, run0, none")]
    InvalidMethod(String),

    /// The probe ran but the rights are not there
    #[error("{0}")]
    NotPrivileged(String),

    /// Generic I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ElevationError {
    pub fn is_permission_problem(&self) -> bool {
        matches!(
            self,
            ElevationError::NotPrivileged(_) | ElevationError::MethodNotAvailable(_)
        )
    }
}

/// How engine invocations gain root
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ElevationMethod {
    #[strum(serialize = "direct")]
    Direct,
    #[strum(serialize = "sudo")]
    Sudo,
    #[strum(serialize = "run0")]
    Run0,
}

impl ElevationMethod {
    /// Detects the elevation method and verifies it works without a prompt.
    ///
    /// # Errors
    ///
    /// Returns `Err` if no non-interactive way to gain root exists, or if
    /// `HOSTWALL_ELEVATION_METHOD` holds an unknown value.
    pub async fn detect() -> Result<Self, ElevationError> {
        if std::env::var("HOSTWALL_TEST_NO_ELEVATION").is_ok() {
            debug!("Elevation bypassed by HOSTWALL_TEST_NO_ELEVATION");
            return Ok(ElevationMethod::Direct);
        }

        if nix::unistd::getuid().is_root() {
            return Ok(ElevationMethod::Direct);
        }

        if let Ok(method) = std::env::var("HOSTWALL_ELEVATION_METHOD") {
            let method = method.to_lowercase();
            if !method.is_empty() {
                return match method.as_str() {
                    "none" => {
                        warn!("Elevation disabled; tools run with the caller's rights");
                        Ok(ElevationMethod::Direct)
                    }
                    "sudo" => {
                        probe(ElevationMethod::Sudo).await?;
                        Ok(ElevationMethod::Sudo)
                    }
                    "run0" => {
                        probe(ElevationMethod::Run0).await?;
                        Ok(ElevationMethod::Run0)
                    }
                    _ => Err(ElevationError::InvalidMethod(method)),
                };
            }
        }

        probe(ElevationMethod::Sudo).await?;
        info!("Using non-interactive sudo for firewall operations");
        Ok(ElevationMethod::Sudo)
    }

    /// Builds a command running `tool` (program plus leading args) with `args`.
    pub fn command(self, tool: &[String], args: &[String]) -> Command {
        let (program, prefix) = match tool.split_first() {
            Some((program, prefix)) => (program.as_str(), prefix),
            None => ("iptables", &[][..]),
        };

        let mut cmd = match self {
            ElevationMethod::Direct => Command::new(program),
            ElevationMethod::Sudo => {
                let mut cmd = Command::new("sudo");
                cmd.arg("-n").arg(program);
                cmd
            }
            ElevationMethod::Run0 => {
                let mut cmd = Command::new("run0");
                cmd.arg("--no-ask-password").arg(program);
                cmd
            }
        };
        cmd.args(prefix).args(args);
        cmd
    }
}

/// Runs `true` through the method to confirm no password is needed.
async fn probe(method: ElevationMethod) -> Result<(), ElevationError> {
    let binary = method.to_string();
    if !binary_exists(&binary) {
        return Err(ElevationError::MethodNotAvailable(binary));
    }

    let status = method
        .command(&["true".to_string()], &[])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await?;

    if status.success() {
        Ok(())
    } else {
        Err(ElevationError::NotPrivileged(format!(
            "{binary} requires a password or denied access; run as root or configure passwordless {binary}"
        )))
    }
}

/// Checks if a binary exists, either as a path or somewhere in PATH
///
/// # Arguments
///
/// * `name` - Binary name or path (e.g., "sudo", "/usr/sbin/iptables")
pub fn binary_exists(name: &str) -> bool {
    if name.contains('/') {
        return Path::new(name).is_file();
    }

    std::env::var_os("PATH")
        .and_then(|paths| {
            std::env::split_paths(&paths).find_map(|dir| {
                let full_path = dir.join(name);
                if full_path.is_file() {
                    Some(full_path)
                } else {
                    None
                }
            })
        })
        .is_some()
}
