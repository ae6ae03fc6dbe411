// Quorum Node - Entry point
// Principle: parse, configure logging, hand off to the runner

use clap::Parser;
use quorum_consensus::cli::config::ConsensusConfig;
use quorum_consensus::cli::runner::{run_network, ThresholdReport};
use quorum_consensus::cli::{Cli, Commands};
use tracing::error;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over the command line
    let log_filter = if cli.verbose { "debug" } else { &cli.log_level };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_filter)))
        .init();

    match cli.command {
        Commands::Run(cmd) => {
            print_banner();

            let config = ConsensusConfig::from_run_cmd(&cmd).map_err(|e| {
                error!("Configuration error: {}", e);
                anyhow::anyhow!("Configuration error: {}", e)
            })?;

            if let Err(e) = run_network(config, cmd.target_height).await {
                error!("Network error: {}", e);
                return Err(anyhow::anyhow!("Network error: {}", e));
            }
        }

        Commands::Threshold(cmd) => {
            let report = ThresholdReport::new(cmd.total_weight);
            println!("{}", report.render(&cmd.format)?);
        }
    }

    Ok(())
}

fn print_banner() {
    println!(
        r#"
    ╔═══════════════════════════════════════════╗
    ║                                           ║
    ║              Q U O R U M                  ║
    ║                                           ║
    ║      Round-robin BFT consensus node       ║
    ║                                           ║
    ╚═══════════════════════════════════════════╝
    "#
    );
    println!("    Version: {}", env!("CARGO_PKG_VERSION"));
    println!();
}
