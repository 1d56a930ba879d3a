// src/main.rs

use anyhow::Result;
use catalog_sync::config::SyncConfig;
use catalog_sync::sync::{Orchestrator, SyncOutcome};
use catalog_sync::IntegrityValidator;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "catalog-sync")]
#[command(author, version, about = "Keep a local catalog database in sync with its remote source", long_about = None)]
struct Cli {
    /// Configuration file (defaults plus environment when omitted)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Default log level when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the regular check and update if the remote changed
    Check,
    /// Update now, ignoring the check interval
    Update,
    /// Print the sync status as JSON
    Status,
    /// Run the integrity checks against a file
    Validate {
        /// Candidate database file
        file: PathBuf,
    },
    /// Serve the manual trigger over HTTP
    #[cfg(feature = "server")]
    Serve {
        /// Listen address (overrides trigger.bind)
        #[arg(short, long)]
        bind: Option<String>,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<SyncConfig> {
    match path {
        Some(path) => SyncConfig::load(path),
        None => SyncConfig::from_env(),
    }
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;
    catalog_sync::logging::init(&config.logging, &cli.log_level)?;

    match cli.command {
        Commands::Check => {
            let (orchestrator, _store) = Orchestrator::from_config(&config)?;
            Ok(report(orchestrator.evaluate_and_sync()))
        }
        Commands::Update => {
            let (orchestrator, _store) = Orchestrator::from_config(&config)?;
            Ok(report(orchestrator.force_sync()))
        }
        Commands::Status => {
            let (orchestrator, _store) = Orchestrator::from_config(&config)?;
            let status = orchestrator.status()?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Validate { file } => {
            let validator = IntegrityValidator::new((&config.artifact).into());
            match validator.check(&file) {
                Ok(report) => {
                    println!(
                        "{}: ok ({} bytes, sha256 {})",
                        file.display(),
                        report.size,
                        report.sha256
                    );
                    Ok(ExitCode::SUCCESS)
                }
                Err(e) => {
                    println!("{}: rejected: {}", file.display(), e);
                    Ok(ExitCode::FAILURE)
                }
            }
        }
        #[cfg(feature = "server")]
        Commands::Serve { bind } => {
            use anyhow::Context;

            let bind_addr = match bind {
                Some(addr) => addr
                    .parse()
                    .with_context(|| format!("Invalid bind address: {}", addr))?,
                None => config.bind_addr()?,
            };

            // Blocking HTTP clients must be built and dropped outside the runtime
            let state = std::sync::Arc::new(catalog_sync::server::TriggerState::from_config(&config)?);

            let rt = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            rt.block_on(catalog_sync::server::run_server(state.clone(), bind_addr))?;
            tracing::info!("Trigger server stopped");
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Print the outcome; failures exit non-zero
fn report(outcome: SyncOutcome) -> ExitCode {
    println!("{}", outcome.message());
    if outcome.is_failed() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
