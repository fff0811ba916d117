//! Kafka Runner
//!
//! Claims a free broker id in ZooKeeper and keeps a Kafka broker running under it.

use std::convert::Infallible;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use kafka_runner::config::{parse_ports, RunnerConfig};
use kafka_runner::coordination::ZooKeeperCoordinator;
use kafka_runner::error::Result;
use kafka_runner::runner::{self, RunOptions};

/// Kafka Runner - claim a broker id and supervise the broker
#[derive(Parser)]
#[command(name = "kafka-runner")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Broker heap size in megabytes
    heap_size: u64,

    /// Number of broker slots in the cluster
    #[arg(value_parser = clap::value_parser!(u32).range(1..))]
    broker_count: u32,

    /// Comma separated broker ports; the second one is the JMX port
    ports: String,

    /// Path to configuration file
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Seed for the broker id pick (defaults to the clock)
    #[arg(long)]
    seed: Option<u64>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(&cli.log_level);

    match run(cli).await {
        Ok(never) => match never {},
        Err(e) => {
            tracing::error!(exit_code = e.exit_code(), "Kafka runner stopped: {}", e);
            ExitCode::from(e.exit_code())
        }
    }
}

/// Initialize logging. Everything goes to stdout; errors are repeated on stderr.
fn init_logging(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stdout))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(LevelFilter::ERROR),
        )
        .init();
}

/// Load configuration and hand over to the runner
async fn run(cli: Cli) -> Result<Infallible> {
    tracing::info!("Starting Kafka runner...");

    let config = match RunnerConfig::from_file(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load configuration from {:?}: {}", cli.config, e);
            tracing::error!("Please check that the config file exists and is valid TOML");
            return Err(e);
        }
    };
    tracing::info!(cluster = %config.cluster, "Loaded configuration");

    let ports = parse_ports(&cli.ports)?;
    let hostname = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".into());

    let options = RunOptions {
        config,
        broker_count: cli.broker_count,
        heap_mb: cli.heap_size,
        ports,
        seed: cli.seed,
        hostname,
    };

    runner::run(Box::new(ZooKeeperCoordinator), options).await
}
