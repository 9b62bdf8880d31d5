//! CLI argument parsing and daemon startup.

pub mod args;

use anyhow::{Context, Result};
use args::Cli;
use clap::Parser;
use rbldns_srv::ServerConfig;
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// Run rbldnsd until it is told to stop.
pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level());

    let mut config = match &cli.config {
        Some(path) => ServerConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => ServerConfig::default(),
    };
    cli.apply(&mut config);
    debug!(?config, "effective configuration");

    rbldns_srv::server::serve(&config).await?;
    Ok(())
}

/// Log to stderr; `RUST_LOG` wins over `-v`.
fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
