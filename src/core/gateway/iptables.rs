use super::{FilterGateway, WriteStatus};
use crate::census::SocketTableFormat;
use crate::config::AppConfig;
use crate::core::error::{Error, Result};
use crate::core::firewall::RuleDescriptor;
use crate::elevation::{ElevationMethod, binary_exists};
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Gateway backed by the iptables command-line tools
///
/// Every invocation goes through the elevation method detected at
/// construction and is bounded by the configured timeout. One lock covers the
/// whole gateway, so a presence check and the write that follows it are
/// never interleaved with another call from this process.
#[derive(Debug)]
pub struct IptablesGateway {
    method: ElevationMethod,
    iptables: Vec<String>,
    ip6tables: Option<Vec<String>>,
    sockets: Option<(Vec<String>, SocketTableFormat)>,
    timeout: Duration,
    lock: Mutex<()>,
}

impl IptablesGateway {
    /// Detects platform support and privileges, then builds the gateway.
    ///
    /// # Errors
    ///
    /// - `UnsupportedPlatform` if this is not Linux or iptables is missing
    /// - `PermissionDenied` if root cannot be obtained without a prompt
    pub async fn connect(config: &AppConfig) -> Result<Self> {
        if !cfg!(target_os = "linux") {
            return Err(Error::UnsupportedPlatform(format!(
                "{} has no iptables; hostwall requires Linux",
                std::env::consts::OS
            )));
        }

        let method = ElevationMethod::detect().await.map_err(|e| {
            if e.is_permission_problem() {
                Error::PermissionDenied(e.to_string())
            } else {
                Error::Elevation(e)
            }
        })?;
        info!("Firewall operations will run via {method} elevation");

        Self::with_method(config, method)
    }

    /// Builds the gateway with an already-established elevation method.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedPlatform` if the configured iptables tool is missing.
    pub fn with_method(config: &AppConfig, method: ElevationMethod) -> Result<Self> {
        let iptables = config.iptables_command.clone();
        if !tool_exists(&iptables) {
            return Err(Error::UnsupportedPlatform(format!(
                "packet filter tool '{}' not found",
                iptables.join(" ")
            )));
        }

        let ip6tables = Some(config.ip6tables_command.clone()).filter(|t| tool_exists(t));
        if ip6tables.is_none() {
            warn!("ip6tables not found; IPv6 rules will be rejected");
        }

        let sockets = detect_socket_tool(config);
        if sockets.is_none() {
            warn!("Neither ss nor netstat found; traffic census unavailable");
        }

        Ok(Self {
            method,
            iptables,
            ip6tables,
            sockets,
            timeout: config.command_timeout(),
            lock: Mutex::new(()),
        })
    }

    fn tool_for(&self, rule: &RuleDescriptor) -> Result<&[String]> {
        if rule.is_ipv6() {
            self.ip6tables.as_deref().ok_or_else(|| {
                Error::UnsupportedPlatform("ip6tables is required for IPv6 sources".to_string())
            })
        } else {
            Ok(&self.iptables)
        }
    }

    /// Runs one tool invocation to completion or timeout.
    async fn run(&self, tool: &[String], args: &[String]) -> Result<Output> {
        debug!("Running {} {}", tool.join(" "), args.join(" "));

        let child = self
            .method
            .command(tool, args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                error!("Failed to spawn {}: {e}", tool.join(" "));
                Error::engine(format!("Failed to spawn {}: {e}", tool.join(" ")))
            })?;

        match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => Ok(output?),
            Err(_) => {
                error!(
                    "{} timed out after {}s",
                    tool.join(" "),
                    self.timeout.as_secs()
                );
                Err(Error::engine(format!(
                    "{} timed out after {}s",
                    tool.join(" "),
                    self.timeout.as_secs()
                )))
            }
        }
    }

    /// `-C`: whether an identical rule is already in the chain.
    async fn rule_present(&self, tool: &[String], rule: &RuleDescriptor) -> Result<bool> {
        let output = self.run(tool, &rule_command("-C", rule)).await?;

        if output.status.success() {
            Ok(true)
        } else if reports_missing_rule(&output) {
            Ok(false)
        } else {
            Err(engine_error("Rule check", &output))
        }
    }
}

impl FilterGateway for IptablesGateway {
    async fn list_rules(&self) -> Result<String> {
        let _guard = self.lock.lock().await;
        let args = ["-L", "-n", "-v"].map(String::from);

        let output = self.run(&self.iptables, &args).await?;
        if !output.status.success() {
            return Err(engine_error("Rule listing", &output));
        }
        let mut listing = String::from_utf8_lossy(&output.stdout).into_owned();

        if let Some(ip6tables) = &self.ip6tables {
            // A partial listing would drop IPv6 rules from snapshots
            let output = self.run(ip6tables, &args).await?;
            if !output.status.success() {
                return Err(engine_error("IPv6 rule listing", &output));
            }
            if !listing.ends_with('\n') {
                listing.push('\n');
            }
            listing.push_str(&String::from_utf8_lossy(&output.stdout));
        }

        Ok(listing)
    }

    async fn apply_rule(&self, rule: &RuleDescriptor) -> Result<WriteStatus> {
        let _guard = self.lock.lock().await;
        let tool = self.tool_for(rule)?;

        if self.rule_present(tool, rule).await? {
            debug!("Rule already present: {rule}");
            return Ok(WriteStatus::AlreadyPresent);
        }

        let output = self.run(tool, &rule_command("-A", rule)).await?;
        if output.status.success() {
            Ok(WriteStatus::Changed)
        } else {
            Err(engine_error("Rule append", &output))
        }
    }

    async fn withdraw_rule(&self, rule: &RuleDescriptor) -> Result<WriteStatus> {
        let _guard = self.lock.lock().await;
        let tool = self.tool_for(rule)?;

        if !self.rule_present(tool, rule).await? {
            return Ok(WriteStatus::NotPresent);
        }

        let output = self.run(tool, &rule_command("-D", rule)).await?;
        if output.status.success() {
            Ok(WriteStatus::Changed)
        } else if reports_missing_rule(&output) {
            Ok(WriteStatus::NotPresent)
        } else {
            Err(engine_error("Rule delete", &output))
        }
    }

    async fn list_listening_sockets(&self) -> Result<String> {
        let _guard = self.lock.lock().await;
        let (tool, _) = self.sockets.as_ref().ok_or_else(|| {
            Error::UnsupportedPlatform("no socket inspection tool (ss or netstat)".to_string())
        })?;

        let output = self.run(tool, &[]).await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(engine_error("Socket listing", &output))
        }
    }

    fn socket_table_format(&self) -> SocketTableFormat {
        self.sockets
            .as_ref()
            .map_or(SocketTableFormat::Netstat, |(_, format)| *format)
    }
}

fn tool_exists(tool: &[String]) -> bool {
    tool.first().is_some_and(|program| binary_exists(program))
}

fn detect_socket_tool(config: &AppConfig) -> Option<(Vec<String>, SocketTableFormat)> {
    if let Some(tool) = &config.socket_command {
        let format = config.socket_format.unwrap_or_else(|| {
            if tool.first().is_some_and(|p| p.ends_with("ss")) {
                SocketTableFormat::Ss
            } else {
                SocketTableFormat::Netstat
            }
        });
        return Some((tool.clone(), format));
    }

    if binary_exists("ss") {
        Some((
            vec!["ss".to_string(), "-tuln".to_string()],
            SocketTableFormat::Ss,
        ))
    } else if binary_exists("netstat") {
        Some((
            vec!["netstat".to_string(), "-tuln".to_string()],
            SocketTableFormat::Netstat,
        ))
    } else {
        None
    }
}

fn rule_command(op: &str, rule: &RuleDescriptor) -> Vec<String> {
    let mut args = vec![op.to_string()];
    args.extend(rule.engine_args());
    args
}

/// iptables exits 1 with "Bad rule (does a matching rule exist in that chain?)"
/// when `-C`/`-D` find nothing. Some builds print nothing at all.
fn reports_missing_rule(output: &Output) -> bool {
    if output.status.code() != Some(1) {
        return false;
    }
    let stderr = String::from_utf8_lossy(&output.stderr).to_lowercase();
    stderr.trim().is_empty()
        || stderr.contains("does a matching rule exist")
        || stderr.contains("bad rule")
}

fn engine_error(action: &str, output: &Output) -> Error {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let exit_code = output.status.code();
    let detail = if stderr.is_empty() {
        exit_code.map_or_else(
            || "terminated by signal".to_string(),
            |code| format!("exit status {code}"),
        )
    } else {
        stderr.clone()
    };
    error!("{action} failed: {detail}");

    Error::Engine {
        message: format!("{action} failed: {detail}"),
        stderr: Some(stderr).filter(|s| !s.is_empty()),
        exit_code,
    }
}
