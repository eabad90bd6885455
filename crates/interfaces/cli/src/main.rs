mod commands;
mod supervisor;

use std::fs;
use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use filebox_config::{AppConfig, DEFAULT_CONFIG_PATH, TelemetryConfig};

#[derive(Debug, Parser)]
#[command(
    name = "filebox",
    version,
    about = "Watch a directory and deduplicate files by content hash"
)]
struct Cli {
    /// Configuration file.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the watcher and the consumer together (default).
    Run,
    /// Run only the watcher, publishing events to the broker.
    Watch,
    /// Run only the consumer, processing events from the broker.
    Consume,
    /// Print every stored file record.
    Records {
        #[arg(long)]
        json: bool,
    },
    /// Print and remove the messages parked on the dead-letter queue.
    DeadLetters,
    /// Print the content hash of a file.
    Hash { file: PathBuf },
    /// Print the effective configuration.
    #[command(visible_alias = "configuration")]
    Config,
}

fn init_logging(telemetry: &TelemetryConfig) -> Result<WorkerGuard> {
    fs::create_dir_all(&telemetry.log_dir)
        .with_context(|| format!("failed to create log directory {}", telemetry.log_dir))?;
    let appender = tracing_appender::rolling::daily(&telemetry.log_dir, &telemetry.log_file_prefix);
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&telemetry.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(io::stderr))
        .with(fmt::layer().with_ansi(false).with_writer(file_writer))
        .init();
    Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config)?;
    let _log_guard = init_logging(&config.telemetry)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => supervisor::run_all(config).await?,
        Commands::Watch => supervisor::run_watch(config).await?,
        Commands::Consume => supervisor::run_consume(config).await?,
        Commands::Records { json } => commands::print_records(&config, json)?,
        Commands::DeadLetters => commands::print_dead_letters(&config).await?,
        Commands::Hash { file } => commands::print_hash(&config, &file).await?,
        Commands::Config => print!("{}", config.to_toml()?),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_run_with_default_config() {
        let cli = Cli::try_parse_from(["filebox"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_PATH));
    }

    #[test]
    fn parses_subcommands_and_global_config() {
        let cli = Cli::try_parse_from(["filebox", "records", "--json", "--config", "alt.toml"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Records { json: true })));
        assert_eq!(cli.config, PathBuf::from("alt.toml"));

        let cli = Cli::try_parse_from(["filebox", "hash", "a.txt"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Hash { ref file }) if file == &PathBuf::from("a.txt")));
    }

    #[test]
    fn parses_dead_letters() {
        let cli = Cli::try_parse_from(["filebox", "dead-letters"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::DeadLetters)));
    }

    #[test]
    fn hash_requires_a_file() {
        assert!(Cli::try_parse_from(["filebox", "hash"]).is_err());
    }
}
