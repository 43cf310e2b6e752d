use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use vmusage_core::Config;

mod commands;

#[derive(Parser)]
#[command(name = "vmusage")]
#[command(about = "Per-VM usage telemetry tooling", long_about = None)]
struct Cli {
    /// Config file (defaults to $VMUSAGE_CONFIG, then /etc/vmusage/config.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Collect usage once and print it as JSON lines
    GetUsage {
        /// Only print this VM
        uuid: Option<String>,

        /// Print a table instead of JSON lines
        #[arg(short, long)]
        table: bool,
    },

    /// Print the valid records of a usage log (.log or .log.gz)
    Cat {
        /// Log file
        file: PathBuf,

        /// Only print summary records
        #[arg(short, long)]
        summary: bool,
    },

    /// Compact closed hourly logs now
    Compact {
        /// Log directory (defaults to usageLogDirectory from the config)
        dir: Option<PathBuf>,
    },

    /// Print the hourly log file name for a time
    Bucket {
        /// RFC 3339 timestamp (defaults to now)
        timestamp: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    vmusage_core::init_observability(&config.log_level, None)
        .map_err(|e| anyhow!("initializing logging: {}", e))?;

    match cli.command {
        Commands::GetUsage { uuid, table } => {
            commands::get_usage(&config, uuid.as_deref(), table).await?;
        }

        Commands::Cat { file, summary } => {
            commands::cat(&file, summary)?;
        }

        Commands::Compact { dir } => {
            let dir = dir.unwrap_or_else(|| config.usage_log_directory.clone());
            commands::compact(&dir).await?;
        }

        Commands::Bucket { timestamp } => {
            commands::bucket(timestamp.as_deref())?;
        }
    }

    Ok(())
}
