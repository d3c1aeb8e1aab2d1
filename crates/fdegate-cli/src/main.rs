//! fdegate command-line interface: status, dry-run decisions, login drills
//! and recovery key maintenance.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use fdegate_core::{
    config::{bootstrap_template, DEFAULT_CONFIG_PATH},
    logging,
    workflow::{self, WorkflowLevel, WorkflowReport},
    Credentials, FdegateConfig, FilePreferences, LoginAttempt,
};
use fdegate_system::system_engine;
use log::debug;
use rpassword::prompt_password;
use schemars::schema_for;
use serde_json::to_string_pretty;
use std::fs;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

#[derive(Parser, Debug)]
#[command(
    name = "fdegate",
    version,
    about = "Login-time disk encryption enforcement and recovery key escrow."
)]
struct Cli {
    /// Path to the fdegate configuration file.
    #[arg(short, long, global = true, env = "FDEGATE_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show encryption state, host capabilities and the stored recovery secret.
    Status,

    /// Report what the Check stage would decide for a user, without acting.
    Decide {
        #[arg(short, long)]
        username: String,
    },

    /// Run every login stage for a user against an in-process host.
    ///
    /// This is a real drill: it may enable encryption and restart the machine.
    Login {
        #[arg(short, long)]
        username: String,
    },

    /// Rotate the personal recovery key now and persist the new one.
    Rotate {
        #[arg(short, long)]
        username: String,
    },

    /// Reconcile an existing recovery output document into the keychain.
    Import {
        #[arg(long = "from")]
        from: PathBuf,
    },

    /// Clear the key-rotated flag so the next qualifying login may rotate.
    ResetGeneration,

    /// Validate the configuration file.
    Validate,

    /// Print the configuration JSON schema.
    Schema,

    /// Write a bootstrap configuration file.
    InitConfig {
        /// Destination; defaults to the global --config path.
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    logging::init("info");
    let cli = Cli::parse();

    match cli.command {
        Commands::Schema => {
            let schema = schema_for!(FdegateConfig);
            println!("{}", to_string_pretty(&schema)?);
            Ok(())
        }
        Commands::InitConfig { output, force } => {
            let target = output.unwrap_or(cli.config);
            init_config(&target, force)
        }
        Commands::Validate => {
            let cfg = FdegateConfig::load(&cli.config).with_context(|| {
                format!("failed to load configuration from {}", cli.config.display())
            })?;
            let issues = cfg.validate();
            if issues.is_empty() {
                println!(
                    "Configuration valid (storage={}, escrow={}).",
                    if cfg.storage.store_in_keychain {
                        "keychain"
                    } else {
                        "file"
                    },
                    if cfg.escrow_configured() {
                        "configured"
                    } else {
                        "none"
                    }
                );
                return Ok(());
            }
            eprintln!("Configuration validation failed:");
            for issue in issues {
                eprintln!("  - {issue}");
            }
            std::process::exit(1);
        }
        Commands::ResetGeneration => {
            let prefs = preferences(&cli.config)?;
            finish(workflow::reset_generation(&prefs)?)
        }
        Commands::Status => {
            let engine = system_engine(preferences(&cli.config)?)?;
            finish(workflow::status_report(&engine)?)
        }
        Commands::Decide { username } => {
            let engine = system_engine(preferences(&cli.config)?)?;
            let (decision, report) = workflow::dry_run_decision(&engine, &username)?;
            debug!("dry-run decision for {username}: {decision:?}");
            finish(report)
        }
        Commands::Login { username } => {
            let engine = system_engine(preferences(&cli.config)?)?;
            let password = prompt(&username)?;
            let mut attempt = LoginAttempt::new(username, password.as_str());
            finish(workflow::login_drill(&engine, &mut attempt))
        }
        Commands::Rotate { username } => {
            let engine = system_engine(preferences(&cli.config)?)?;
            let credentials = Credentials {
                password: prompt(&username)?,
                username,
            };
            let report = workflow::rotate_recovery_key(&engine, &credentials)
                .context("recovery key rotation failed")?;
            finish(report)
        }
        Commands::Import { from } => {
            let engine = system_engine(preferences(&cli.config)?)?;
            let report = workflow::import_recovery_document(&engine, &from)
                .with_context(|| format!("failed to import {}", from.display()))?;
            finish(report)
        }
    }
}

/// Resolve the effective configuration file, bootstrapping it when missing.
fn preferences(path: &Path) -> Result<FilePreferences> {
    let cfg = FdegateConfig::load_or_bootstrap(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))?;
    if cfg.path != path {
        println!(
            "Using bootstrap configuration at {} (set FDEGATE_CONFIG to replace).",
            cfg.path.display()
        );
    }
    Ok(FilePreferences::new(cfg.path))
}

fn prompt(username: &str) -> Result<Zeroizing<String>> {
    let password = prompt_password(format!("Password for {username}: "))
        .context("failed to read password")?;
    if password.is_empty() {
        bail!("an empty password cannot unlock the disk");
    }
    Ok(Zeroizing::new(password))
}

fn init_config(target: &Path, force: bool) -> Result<()> {
    if target.exists() && !force {
        bail!(
            "{} already exists; pass --force to overwrite",
            target.display()
        );
    }
    if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(target, bootstrap_template())
        .with_context(|| format!("failed to write {}", target.display()))?;
    println!("Configuration template written to {}", target.display());
    Ok(())
}

fn finish(report: WorkflowReport) -> Result<()> {
    let failed = report.has_errors();
    print_report(report);
    if failed {
        std::process::exit(1);
    }
    Ok(())
}

fn print_report(report: WorkflowReport) {
    println!("{}", report.title);
    for event in report.events {
        println!("  [{}] {}", level_tag(event.level), event.message);
    }
}

fn level_tag(level: WorkflowLevel) -> &'static str {
    match level {
        WorkflowLevel::Info => "INFO",
        WorkflowLevel::Success => "OK",
        WorkflowLevel::Warn => "WARN",
        WorkflowLevel::Error => "ERR",
        WorkflowLevel::Security => "SEC",
    }
}
