//! RingNode - overlay simulator
//!
//! Builds an in-process overlay, routes random lookups through it and reports
//! how they fared.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use ringnode::{sim, Config};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "ringnode")]
#[command(about = "Prefix-routing overlay simulator")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "RINGNODE_CONFIG")]
    config: Option<PathBuf>,

    /// Write a default configuration and exit
    #[arg(long)]
    init: bool,

    /// Override the number of simulated nodes
    #[arg(short, long)]
    nodes: Option<usize>,

    /// Override the random seed
    #[arg(long)]
    seed: Option<u64>,

    /// Override the log level
    #[arg(short, long)]
    log_level: Option<String>,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.init {
        let config = Config::create_default(args.config)?;
        println!("Configuration written to {}", config.config_path().display());
        return Ok(());
    }

    let mut config = Config::load(args.config)?;
    if let Some(nodes) = args.nodes {
        config.simulation.nodes = nodes;
    }
    if let Some(seed) = args.seed {
        config.simulation.seed = seed;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    config.validate()?;

    init_logging(&config);
    info!(config = %config.config_path().display(), "Starting RingNode simulation");

    let report = sim::run(&config.overlay, &config.simulation).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report);
    }

    if !report.is_clean() {
        anyhow::bail!("Simulation finished with lost or misrouted lookups");
    }
    Ok(())
}

fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    // Logs go to stderr so a JSON report on stdout stays parseable
    if config.logging.json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(filter)
            .init();
    }
}
