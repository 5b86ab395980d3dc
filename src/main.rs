//! torgw - Tor gateway reconciler
//!
//! Drives a Linux access point to the configured Tor transparent-proxy state:
//! the managed block in `torrc`, the NAT redirects of the access-point
//! interface, and their persistence across reboots. Every command is safe to
//! run again.
//!
//! # Usage
//!
//! ```bash
//! torgw apply                      # Reconcile torrc and the live rules
//! torgw apply --json               # ... and print the run result as JSON
//! torgw plan                       # Show what apply would change
//! torgw status                     # Compare torrc and live rules with the config
//! torgw restore                    # Restore torrc from the newest good backup
//! torgw restore --backup PATH      # Restore a specific backup
//! torgw export --format restore    # Print rules for iptables-restore
//! torgw init-config                # Write the default configuration
//! torgw --config /etc/torgw/config.json -vv apply
//! ```

use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use torgw::audit::{self, AuditLog};
use torgw::config::{self, GatewayConfig};
use torgw::core::applier::{RuleSetApplier, render_diff};
use torgw::core::backup::{BackupStore, list_backups};
use torgw::core::block::{ConfigDocument, ManagedBlockEditor};
use torgw::core::error::{ErrorKind, IptablesErrorPattern};
use torgw::core::iptables::IptablesCommand;
use torgw::core::preflight::SystemPrivileges;
use torgw::core::runner::{ReconcileResult, ReconcileRunner};
use torgw::gateway;

shadow_rs::shadow!(build);

#[derive(Parser)]
#[command(name = "torgw")]
#[command(about = "Tor gateway reconciler - torrc managed block and NAT redirects", long_about = None)]
struct Cli {
    /// Configuration file (default: ~/.config/torgw/config.json)
    #[arg(short, long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// More log output (-v info, -vv debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconcile torrc and the live rule table with the configuration
    Apply {
        /// Print the run result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the changes apply would make, without making them
    Plan,
    /// Compare torrc and the live rules against the configuration
    Status,
    /// Restore torrc from a backup
    Restore {
        /// Backup to restore (default: newest backup whose checksum verifies)
        #[arg(short, long, value_name = "PATH")]
        backup: Option<PathBuf>,
    },
    /// Print the desired rule set
    Export {
        #[arg(short, long, value_enum, default_value_t = ExportFormat::Restore)]
        format: ExportFormat,
    },
    /// Write the default configuration file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Show version and build information
    Version,
}

#[derive(Clone, Copy, ValueEnum)]
enum ExportFormat {
    /// iptables-restore input
    Restore,
    Json,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        _ => tracing::Level::DEBUG,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to create Tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(handle_cli(cli.command, cli.config.as_deref())) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn load(explicit: Option<&Path>) -> Result<GatewayConfig, config::ConfigError> {
    let path = config::config_path(explicit)?;
    config::load_config(&path).await
}

async fn handle_cli(
    command: Commands,
    config_path: Option<&Path>,
) -> Result<ExitCode, Box<dyn std::error::Error>> {
    match command {
        Commands::Apply { json } => {
            let config = load(config_path).await?;
            let result = apply(&config).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print_result(&result);
            }
            Ok(ExitCode::from(result.exit_code()))
        }
        Commands::Plan => {
            let config = load(config_path).await?;
            plan(&config).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Status => {
            let config = load(config_path).await?;
            status(&config).await
        }
        Commands::Restore { backup } => {
            let config = load(config_path).await?;
            restore(&config, backup.as_deref()).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Export { format } => {
            let config = load(config_path).await?;
            let rules = gateway::redirect_rules(&config);
            match format {
                ExportFormat::Restore => print!("{}", rules.to_restore_text()),
                ExportFormat::Json => println!("{}", serde_json::to_string_pretty(&rules)?),
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::InitConfig { force } => {
            let path = config::config_path(config_path)?;
            if path.exists() && !force {
                return Err(format!(
                    "{} already exists (use --force to overwrite)",
                    path.display()
                )
                .into());
            }
            config::save_config(&GatewayConfig::default(), &path).await?;
            println!("Wrote default configuration to {}", path.display());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Version => {
            println!("torgw {}", build::PKG_VERSION);
            if !build::SHORT_COMMIT.is_empty() {
                let dirty = if build::GIT_CLEAN { "" } else { " (dirty)" };
                println!("commit {}{dirty}", build::SHORT_COMMIT);
            }
            println!("built {} with {}", build::BUILD_TIME, build::RUST_VERSION);
            println!("torrc default: {}", torgw::SYSTEM_TORRC_PATH);
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn apply(config: &GatewayConfig) -> Result<ReconcileResult, torgw::Error> {
    let plan = gateway::plan(config)?;
    let table = IptablesCommand::new(&config.iptables_command);
    let persistence = config.persistence.gateway(&config.iptables_save_command);
    let privileges = SystemPrivileges::new().with_interface(&config.interface);

    if !torgw::elevation::is_root() {
        println!("Note: Not running as root. Firewall commands will be elevated.");
    }

    let mut runner = ReconcileRunner::new(plan, Box::new(table), persistence, Box::new(privileges))
        .with_backup_retention(config.backup_retention);
    if torgw::utils::ensure_dirs().is_ok()
        && let Ok(audit) = AuditLog::new()
    {
        runner = runner.with_audit(audit);
    }

    Ok(runner.run().await)
}

fn print_result(result: &ReconcileResult) {
    if let Some(backup) = &result.backup_location {
        println!("Backup: {}", backup.display());
    }

    if result.is_done() {
        let torrc = if result.config_changed {
            "updated"
        } else {
            "unchanged"
        };
        println!("✓ torrc {torrc}, {} rule(s) applied.", result.rules_applied);
        for warning in result.warnings() {
            println!("⚠ {} ({}): {}", warning.kind, warning.stage, warning.message);
        }
        return;
    }

    if let Some(fatal) = result.fatal() {
        eprintln!("✗ Failed during {}: {}", fatal.stage, fatal.message);
        if fatal.kind == ErrorKind::PartialApply {
            let translation = IptablesErrorPattern::match_error(&fatal.message);
            eprintln!("  {}", translation.user_message);
            for suggestion in &translation.suggestions {
                eprintln!("  - {suggestion}");
            }
            if let Some(url) = &translation.help_url {
                eprintln!("  See {url}");
            }
            eprintln!(
                "  {} rule(s) are live; torrc edits are kept. Run `torgw restore` to undo them.",
                result.rules_applied
            );
        }
    }
    eprintln!("Run {}", result.run_id);
}

async fn read_document(path: &Path) -> std::io::Result<String> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => Ok(text),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(e),
    }
}

async fn plan(config: &GatewayConfig) -> Result<(), torgw::Error> {
    let plan = gateway::plan(config)?;
    let original = read_document(&plan.document).await?;
    let editor = ManagedBlockEditor::new(plan.marker.clone());
    let edited = editor
        .apply(&ConfigDocument::parse(&original), &plan.block)?
        .render();

    println!("# {}", plan.document.display());
    if edited == original {
        println!("(no changes)");
    } else {
        print!("{}", render_diff(&original, &edited));
    }

    println!();
    println!("# Rules (flush and repopulate)");
    print!("{}", plan.rules.to_restore_text());
    println!();
    let persistence = config.persistence.gateway(&config.iptables_save_command);
    println!("# Persistence: {}", persistence.describe());
    Ok(())
}

async fn status(config: &GatewayConfig) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let plan = gateway::plan(config)?;
    let mut in_sync = true;

    let text = read_document(&plan.document).await?;
    let editor = ManagedBlockEditor::new(plan.marker.clone());
    match editor.extract(&ConfigDocument::parse(&text)) {
        Ok(Some(block)) if block == plan.block => {
            println!("✓ torrc block `{}` is up to date", plan.marker.tag());
        }
        Ok(Some(_)) => {
            in_sync = false;
            println!("✗ torrc block `{}` differs from the configuration", plan.marker.tag());
        }
        Ok(None) => {
            in_sync = false;
            println!("✗ torrc has no `{}` block", plan.marker.tag());
        }
        Err(e) => {
            in_sync = false;
            println!("✗ torrc: {e}");
        }
    }

    let applier = RuleSetApplier::new(Box::new(IptablesCommand::new(&config.iptables_command)))
        .with_managed_chains(plan.managed_chains.iter().copied());
    match applier.verify(&plan.rules).await {
        Ok(v) if v.matches => println!("✓ {} live rule(s) match", v.actual.len()),
        Ok(v) => {
            in_sync = false;
            println!("✗ Live rules differ:");
            print!("{}", v.diff());
        }
        Err(e) => {
            in_sync = false;
            println!("✗ Could not read live rules: {e}");
        }
    }

    let backups = list_backups(&plan.document).await?;
    match backups.first() {
        Some(newest) => println!("Backups: {} (newest {})", backups.len(), newest.display()),
        None => println!("Backups: none"),
    }

    Ok(if in_sync {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn restore(config: &GatewayConfig, backup: Option<&Path>) -> Result<(), torgw::Error> {
    let store = BackupStore::new(config.backup_retention);
    let document = &config.torrc_path;

    let result = match backup {
        Some(path) => store.restore(path, document).await.map(|()| path.to_path_buf()),
        None => store.restore_latest(document).await,
    };

    match result {
        Ok(restored) => {
            audit::log_restore(document, Some(&restored), true, None).await;
            println!("✓ Restored {} from {}", document.display(), restored.display());
            println!("Live rules are unchanged; run `torgw apply` to reconcile them.");
            Ok(())
        }
        Err(e) => {
            audit::log_restore(document, backup, false, Some(e.to_string())).await;
            Err(e.into())
        }
    }
}
