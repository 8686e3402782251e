//! quarantine-gate CLI - scan-before-deliver file transfer

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use quarantine_gate::core::fsio;
use quarantine_gate::orchestrator::{Orchestrator, EXIT_STARTUP};
use quarantine_gate::routing::open_hazard_artifact;
use quarantine_gate::{DailyUsageTracker, GateConfig};

#[derive(Parser)]
#[command(name = "quarantine-gate")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Log level used when RUST_LOG is not set
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process the source directory once
    Run {
        /// Configuration file
        #[arg(short, long)]
        config: PathBuf,
        /// Override the worker count
        #[arg(long)]
        workers: Option<usize>,
        /// Validate and print the configuration, then exit
        #[arg(long)]
        dry_run_config: bool,
    },
    /// Show the daily usage ledger entry for a date
    Usage {
        /// Configuration file
        #[arg(short, long)]
        config: PathBuf,
        /// Date as YYYY-MM-DD; today when omitted
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Recover the plaintext of a hazard artifact
    Decrypt {
        /// Configuration file
        #[arg(short, long)]
        config: PathBuf,
        /// Hazard artifact
        artifact: PathBuf,
        /// Where to write the plaintext
        output: PathBuf,
    },
}

fn init_logging(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.log_json);

    let code = match cli.command {
        Commands::Run {
            config,
            workers,
            dry_run_config,
        } => run(config, workers, dry_run_config).await,
        Commands::Usage { config, date } => usage(config, date).map(|()| 0),
        Commands::Decrypt {
            config,
            artifact,
            output,
        } => decrypt(config, artifact, output).map(|()| 0),
    };

    match code {
        Ok(code) => ExitCode::from(code as u8),
        Err(e) => {
            tracing::error!("{e:#}");
            eprintln!("error: {e:#}");
            ExitCode::from(EXIT_STARTUP as u8)
        }
    }
}

async fn run(path: PathBuf, workers: Option<usize>, dry_run: bool) -> Result<i32> {
    let mut config = GateConfig::from_toml_file(&path)?;
    if let Some(workers) = workers {
        config = config.with_workers(workers);
        config.validate()?;
    }
    if dry_run {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(0);
    }

    let policy = config.policy.clone();
    let orchestrator = Orchestrator::new(config);
    let stop = orchestrator.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, finishing in-flight files");
            stop.stop();
        }
    });

    let summary = orchestrator.run().await?;
    println!("{summary}");
    Ok(summary.exit_code(&policy))
}

fn usage(path: PathBuf, date: Option<NaiveDate>) -> Result<()> {
    let config = GateConfig::from_toml_file(&path)?;
    let tracker = DailyUsageTracker::open(config.paths.usage_ledger())?;
    let date = date.unwrap_or_else(|| tracker.today());
    let usage = tracker.get(date)?;
    println!(
        "{date}: {} files, {} bytes",
        usage.files_processed, usage.bytes_processed
    );
    Ok(())
}

fn decrypt(path: PathBuf, artifact: PathBuf, output: PathBuf) -> Result<()> {
    let config = GateConfig::from_toml_file(&path)?;
    let key = config.hazard_key()?;
    let plaintext = open_hazard_artifact(&artifact, key.as_deref())
        .with_context(|| format!("cannot open {}", artifact.display()))?;
    fsio::write_atomic(&output, &plaintext)
        .with_context(|| format!("cannot write {}", output.display()))?;
    println!("{} bytes written to {}", plaintext.len(), output.display());
    Ok(())
}
