// CLI - Command line interface for quorum-node
// Principle: file config gives defaults, flags and env vars override

pub mod config;
pub mod runner;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// In-process BFT consensus network
#[derive(Parser, Debug)]
#[command(name = "quorum-node")]
#[command(author = "Quorum Contributors")]
#[command(version)]
#[command(about = "Round-robin BFT consensus over an in-process network", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info", env = "QUORUM_LOG")]
    pub log_level: String,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Launch a committee of nodes and run rounds
    Run(RunCmd),

    /// Print the certificate thresholds for a committee weight
    Threshold(ThresholdCmd),
}

/// Run the consensus network
#[derive(Parser, Debug)]
pub struct RunCmd {
    /// JSON configuration file
    #[arg(short, long, env = "QUORUM_CONFIG")]
    pub config: Option<PathBuf>,

    /// Number of consensus nodes
    #[arg(short, long, env = "QUORUM_NODES")]
    pub nodes: Option<usize>,

    /// Stop once this height is finalized (runs until Ctrl-C otherwise)
    #[arg(long)]
    pub target_height: Option<u64>,

    /// Minimum interval between blocks in milliseconds
    #[arg(long, env = "QUORUM_ROUND_INTERVAL_MS")]
    pub interval_ms: Option<u64>,

    /// Fixed round timeout in milliseconds (disables adaptive timeouts)
    #[arg(long, env = "QUORUM_TIMEOUT_MS")]
    pub timeout_ms: Option<u64>,

    /// Base path for safety data
    #[arg(short = 'd', long, env = "QUORUM_BASE_PATH")]
    pub base_path: Option<PathBuf>,
}

/// Show thresholds
#[derive(Parser, Debug)]
pub struct ThresholdCmd {
    /// Total committee weight
    pub total_weight: u64,

    /// Output format (text, json)
    #[arg(long, default_value = "text")]
    pub format: String,
}
