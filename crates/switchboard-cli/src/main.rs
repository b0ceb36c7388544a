mod cli;
mod commands;
mod config;
mod output;
mod scenario;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};
use config::CliConfig;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so stdout stays the event transcript
    let filter = match cli.log_level.as_deref() {
        Some(level) => EnvFilter::try_new(level)?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_level(true)
        .init();

    let config = match cli.config {
        Some(path) => CliConfig::load_from_path(Some(path)),
        None => CliConfig::load(),
    };

    match cli.command {
        Commands::Simulate(args) => commands::simulate::run(args, &config, cli.format).await,
        Commands::Config => commands::config::run(&config, cli.format),
    }
}
