use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

#[derive(Parser)]
#[command(name = "discovery")]
#[command(about = "Service discovery - check and exercise registration config")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true, default_value = "discovery.yaml")]
    config: PathBuf,

    /// Log at DEBUG regardless of the configured level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate configuration file
    Check,

    /// Register and resolve the configured services against an in-memory cluster
    Simulate {
        /// How long to run, in seconds
        #[arg(short, long, default_value = "10")]
        duration: u64,

        /// Seconds between picks
        #[arg(short, long, default_value = "1")]
        interval: u64,
    },
}

fn main() -> Result<()> {
    smol::block_on(async {
        let cli = Cli::parse();

        match cli.command {
            Commands::Check => commands::check::run(&cli.config, cli.verbose).await,
            Commands::Simulate { duration, interval } => {
                commands::simulate::run(&cli.config, cli.verbose, duration, interval).await
            }
        }
    })
}
