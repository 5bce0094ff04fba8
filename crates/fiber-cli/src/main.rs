//! Fiber command-line driver
//!
//! Runs stress workloads against the dispatch engine and shows the effective
//! configuration.

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fiber")]
#[command(about = "Exclusive/concurrent job dispatch engine", long_about = None)]
#[command(version)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an interleaved workload and check the dispatch invariants
    Stress {
        /// Number of exclusive jobs
        #[arg(short, long, default_value_t = 1000)]
        exclusive: usize,
        /// Number of concurrent jobs
        #[arg(short, long, default_value_t = 10000)]
        concurrent: usize,
        /// Worker pool size (overrides the config file)
        #[arg(short, long)]
        workers: Option<usize>,
        /// Path to a fiber.toml
        #[arg(long)]
        config: Option<PathBuf>,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration as TOML
    Config {
        /// Path to a fiber.toml
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Stress {
            exclusive,
            concurrent,
            workers,
            config,
            json,
        } => commands::stress::execute(commands::stress::StressArgs {
            exclusive,
            concurrent,
            workers,
            config,
            json,
        }),

        Commands::Config { config } => commands::config::execute(config.as_deref()),
    }
}
