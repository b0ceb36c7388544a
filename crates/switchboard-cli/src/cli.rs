use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::output::OutputFormat;

#[derive(Parser)]
#[command(name = "switchboard")]
#[command(version, about = "Switchboard - channel dispatch simulator")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (defaults to ~/.config/switchboard/config.toml)
    #[arg(long, global = true, env = "SWITCHBOARD_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log filter, e.g. `debug` or `switchboard_core=trace` (overrides RUST_LOG)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Output format
    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Replay a scenario against the loopback middleware
    Simulate(SimulateArgs),

    /// Print the effective configuration
    Config,
}

#[derive(Args)]
pub struct SimulateArgs {
    /// Scenario file (TOML)
    pub scenario: PathBuf,

    /// Do not approve filtered channels or process filtered tubes
    #[arg(long)]
    pub no_approve: bool,

    /// Do not claim dispatched channels
    #[arg(long)]
    pub no_claim: bool,
}
