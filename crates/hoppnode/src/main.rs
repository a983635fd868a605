use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use hoppnode::config::Config;
use hoppnode::node::HoppNode;

#[derive(Parser, Debug)]
#[command(name = "hoppnode")]
#[command(version, about = "HoppMesh delay-tolerant mesh node")]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, env = "HOPPNODE_CONFIG")]
    config: Option<PathBuf>,

    /// Directory for the outbox and learned path history
    #[arg(short, long, env = "HOPPNODE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Write a fresh default configuration before starting
    #[arg(long)]
    init: bool,

    /// Log filter, overrides the configured level
    #[arg(long, env = "HOPPNODE_LOG_LEVEL")]
    log_level: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Run as a relay bot regardless of configuration
    #[arg(long)]
    relay_bot: bool,
}

fn init_logging(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = if cli.init {
        Config::create_default(cli.config, cli.data_dir)?
    } else {
        Config::load(cli.config, cli.data_dir)?
    };
    if cli.relay_bot {
        config.node.relay_bot = true;
    }

    let level = cli.log_level.as_deref().unwrap_or(&config.logging.level);
    init_logging(level, cli.json_logs || config.logging.json);

    if cli.init {
        info!("Created configuration at {}", config.config_path().display());
    }
    info!("Starting HoppNode v{}", env!("CARGO_PKG_VERSION"));

    let mut node = HoppNode::new(config).await?;
    node.run().await
}
