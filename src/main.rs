//! hostwall - host firewall rule manager
//!
//! Command-line front end over the `hostwall` library.
//!
//! # Usage
//!
//! ```bash
//! hostwall list                               # Show active filter rules
//! hostwall add INPUT 203.0.113.5 443          # Accept 203.0.113.5 -> 443/tcp
//! hostwall add INPUT 2001:db8::5 53 -p udp    # IPv6 sources go to ip6tables
//! hostwall delete INPUT 203.0.113.5 443       # Withdraw the same rule
//! hostwall analyze                            # Summarize listening sockets
//! hostwall save --structured                  # Snapshot replayable rules
//! hostwall restore                            # Replay the snapshot
//! hostwall diff                               # Compare snapshot with live rules
//! hostwall config --write                     # Persist the effective config
//! ```
//!
//! The exit status is the worst result code of the invocation: 0 success,
//! 2 rule not found, 3 rejected by validation, 4 filter engine failure,
//! 1 for any other error.

use clap::{Parser, Subcommand};
use hostwall::audit::AuditLog;
use hostwall::config::{AppConfig, load_config, save_config};
use hostwall::core::engine::{ResultCode, RuleEngine, RuleOutcome};
use hostwall::core::error::{Error, IptablesErrorPattern};
use hostwall::core::firewall::{Chain, Protocol, RuleDescriptor};
use hostwall::core::gateway::{FilterGateway, IptablesGateway, MemoryGateway, take_census};
use hostwall::core::snapshot::{RestoreReport, SnapshotStore, diff};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "hostwall", version)]
#[command(about = "Host firewall rule manager for iptables", long_about = None)]
struct Cli {
    /// Configuration file (default: XDG data dir)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Run against an in-memory rule table; the host firewall and the
    /// snapshot file are left untouched
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List current firewall rules
    List,
    /// Add an ACCEPT rule
    Add(RuleArgs),
    /// Delete an existing ACCEPT rule
    Delete(RuleArgs),
    /// Summarize listening sockets
    Analyze,
    /// Save the current rules to the snapshot file
    Save {
        /// Store replayable rule descriptors instead of the raw listing
        #[arg(long)]
        structured: bool,
    },
    /// Restore rules from the snapshot file
    Restore,
    /// Show differences between the snapshot and the live rules
    Diff,
    /// Print the effective configuration
    Config {
        /// Persist it to the configuration file
        #[arg(long)]
        write: bool,
    },
}

#[derive(clap::Args)]
struct RuleArgs {
    /// INPUT, OUTPUT or FORWARD
    chain: Chain,
    /// Source IPv4 or IPv6 address
    source: String,
    /// Destination port (1-65535)
    port: u32,
    /// tcp or udp
    #[arg(short, long, default_value = "tcp")]
    protocol: Protocol,
}

impl RuleArgs {
    fn descriptor(&self) -> RuleDescriptor {
        RuleDescriptor::new(self.chain, self.source.clone(), self.port, self.protocol)
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to create Tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> ExitCode {
    let loaded = load_config(cli.config.as_deref()).await;
    let config = loaded.as_ref().cloned().unwrap_or_default();
    // Logging needs the configured path, so load problems are reported after init
    init_logging(&config.log_path());
    if let Err(e) = &loaded {
        warn!("Using default configuration: {e}");
    }

    let result = if let Commands::Config { write } = cli.command {
        show_config(&config, cli.config.as_deref(), write && !cli.dry_run).await
    } else if cli.dry_run {
        info!("Dry run: using in-memory gateway");
        let engine = RuleEngine::new(MemoryGateway::new());
        let store = SnapshotStore::new(config.snapshot_path());
        handle_command(cli.command, engine, &store, true).await
    } else {
        match IptablesGateway::connect(&config).await {
            Ok(gateway) => {
                let audit = AuditLog::new(config.audit_log_path());
                let engine = RuleEngine::new(gateway).with_audit(audit.clone());
                let store = SnapshotStore::new(config.snapshot_path()).with_audit(audit);
                handle_command(cli.command, engine, &store, false).await
            }
            Err(e) => Err(e),
        }
    };

    match result {
        Ok(code) => ExitCode::from(code.code()),
        Err(e) => {
            if e.is_fatal() {
                error!("Fatal: {e}");
            } else {
                error!("{e}");
            }
            print_error(&e, &config);
            ExitCode::FAILURE
        }
    }
}

async fn handle_command<G: FilterGateway>(
    command: Commands,
    mut engine: RuleEngine<G>,
    store: &SnapshotStore,
    dry_run: bool,
) -> Result<ResultCode, Error> {
    match command {
        Commands::List => {
            let listing = engine.list().await;
            if let Some(e) = listing.failure {
                return Err(e);
            }
            println!("Current Firewall Rules:");
            println!("{}", listing.text);
            Ok(ResultCode::Success)
        }
        Commands::Add(args) => {
            let outcome = engine.apply(&args.descriptor()).await;
            print_outcome(&outcome);
            Ok(outcome.result_code())
        }
        Commands::Delete(args) => {
            let outcome = engine.withdraw(&args.descriptor()).await;
            print_outcome(&outcome);
            Ok(outcome.result_code())
        }
        Commands::Analyze => {
            let summary = take_census(engine.gateway()).await?;
            println!("Traffic Analysis Results:");
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(ResultCode::Success)
        }
        Commands::Save { .. } if dry_run => {
            println!("Dry run: {} left unchanged", store.path().display());
            Ok(ResultCode::Success)
        }
        Commands::Save { structured } => {
            let snapshot = if structured {
                let rules = engine.recovered_rules().await?;
                println!("Captured {} replayable rule(s)", rules.len());
                store.save_structured(rules).await?
            } else {
                let listing = engine.list().await;
                if let Some(e) = listing.failure {
                    return Err(e);
                }
                store.save(&listing.text).await?
            };
            println!(
                "Configuration saved to {} at {}",
                store.path().display(),
                snapshot.timestamp.to_rfc3339()
            );
            Ok(ResultCode::Success)
        }
        Commands::Restore => {
            let snapshot = store.load().await?;
            let report = store.restore(&snapshot, &mut engine).await;
            println!(
                "Restoring configuration from {}",
                report.timestamp().to_rfc3339()
            );

            match &report {
                RestoreReport::InformationalOnly {
                    line_count,
                    recoverable,
                    ..
                } => {
                    println!(
                        "Snapshot holds a raw listing ({line_count} lines, {recoverable} recognisable rules)."
                    );
                    println!("No rules were replayed. Save with --structured to enable replay.");
                    Ok(ResultCode::Success)
                }
                RestoreReport::Replayed { outcomes, .. } => {
                    for outcome in outcomes {
                        print_outcome(outcome);
                    }
                    Ok(outcomes
                        .iter()
                        .map(RuleOutcome::result_code)
                        .max()
                        .unwrap_or(ResultCode::Success))
                }
            }
        }
        Commands::Diff => {
            let snapshot = store.load().await?;
            let listing = engine.list().await;
            if let Some(e) = listing.failure {
                return Err(e);
            }

            let drift = diff(&snapshot, &listing.text);
            if drift.is_empty() {
                println!(
                    "No changes since snapshot of {}",
                    snapshot.timestamp.to_rfc3339()
                );
            } else {
                print!("{}", drift.render());
            }
            Ok(ResultCode::Success)
        }
        // Needs no gateway; dispatched before one is built
        Commands::Config { .. } => Ok(ResultCode::Success),
    }
}

async fn show_config(
    config: &AppConfig,
    path: Option<&Path>,
    write: bool,
) -> Result<ResultCode, Error> {
    println!("{}", serde_json::to_string_pretty(config)?);
    if write {
        save_config(config, path).await?;
        info!("Configuration written");
        println!("Configuration written");
    }
    Ok(ResultCode::Success)
}

fn print_outcome(outcome: &RuleOutcome) {
    if outcome.is_success() {
        println!("{}", outcome.status_line());
        return;
    }

    eprintln!("{}", outcome.status_line());
    if let Some(translation) = outcome.translation() {
        eprintln!("  {}", translation.user_message);
        for suggestion in translation.suggestions {
            eprintln!("  - {suggestion}");
        }
    }
}

fn print_error(error: &Error, config: &AppConfig) {
    eprintln!("Error: {error}");
    if matches!(
        error,
        Error::PermissionDenied(_) | Error::UnsupportedPlatform(_) | Error::Engine { .. }
    ) {
        let translation = IptablesErrorPattern::match_error(&error.to_string());
        for suggestion in translation.suggestions {
            eprintln!("  - {suggestion}");
        }
    }
    eprintln!("See {} for details", config.log_path().display());
}

/// Logs to `path`, falling back to stderr when it cannot be opened.
fn init_logging(path: &Path) {
    let file = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => hostwall::utils::ensure_dir(parent),
        _ => Ok(()),
    }
    .and_then(|()| {
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
    });

    if let Ok(file) = file {
        tracing_subscriber::fmt()
            .with_writer(file)
            .with_ansi(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .init();
    }
}
