//! Sentinel command line.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info};

use sentinel::config::DEFAULT_CONFIG_PATH;
use sentinel::storage::inspect;
use sentinel::{telemetry, Sentinel, SentinelConfig};

#[derive(Parser)]
#[command(name = "sentinel")]
#[command(about = "Data-logging appliance for the energy-harvesting rig", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Acquire, compute and store until Ctrl+C
    Run {
        /// Configuration file (JSON)
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },

    /// Validate a configuration file and print what it defines
    Check {
        /// Configuration file (JSON)
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },

    /// Summarize recorded databases
    Inspect {
        /// A database directory, or a directory containing databases
        base: PathBuf,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => run(config).await,
        Commands::Check { config } => check(config),
        Commands::Inspect { base, json } => inspect_databases(base, json),
    }
}

async fn run(path: PathBuf) -> Result<()> {
    let config = SentinelConfig::load_from(&path)
        .with_context(|| format!("loading {}", path.display()))?;
    telemetry::init_from_config(&config)?;
    info!(config = %path.display(), "Configuration loaded");

    let sentinel = Sentinel::start(config).await?;

    tokio::select! {
        result = signal::ctrl_c() => {
            result.context("installing Ctrl+C handler")?;
            info!("Shutdown signal received");
        }
        _ = sentinel.faulted() => {
            error!("Automatic switching failed; shutting down");
        }
    }

    let report = sentinel.shutdown().await?;
    info!(
        rows = report.storage.flush.rows,
        databases = report.storage.flush.rotations + 1,
        switches = report.automatic_switches,
        "Shutdown complete"
    );
    Ok(())
}

fn check(path: PathBuf) -> Result<()> {
    let config = SentinelConfig::load_from(&path)
        .with_context(|| format!("loading {}", path.display()))?;
    let configurations = config.measurement_configurations()?;

    println!("{}: OK", path.display());
    println!(
        "Database '{}' in {}",
        config.database_config.name,
        config.database_config.directory.display()
    );
    for configuration in &configurations {
        println!(
            "  [{}] {} at {} S/s, channels {}, poll {:?}, relay {}",
            configuration.index,
            configuration.name,
            configuration.scan_rate_hz,
            configuration.tags().join(","),
            configuration.poll_interval,
            if configuration.output_state { "forward" } else { "reverse" }
        );
        for table in configuration.table_names() {
            println!("      -> {table}");
        }
    }
    Ok(())
}

fn inspect_databases(base: PathBuf, json: bool) -> Result<()> {
    let summaries = inspect(&base).with_context(|| format!("inspecting {}", base.display()))?;
    if json {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
    } else if summaries.is_empty() {
        println!("No databases under {}", base.display());
    } else {
        for summary in &summaries {
            print!("{summary}");
        }
    }
    Ok(())
}
