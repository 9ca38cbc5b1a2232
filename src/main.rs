//! # sharetree
//!
//! Command-line entry point: sets up logging, parses arguments and hands off
//! to the matching command in [`sharetree::cli`].

use anyhow::Result;
use clap::Parser;
use colored::*;
use sharetree::cli::{self, Cli, Commands};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sharetree=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    if let Err(e) = match cli.command {
        Commands::Init { root, profile } => cli::init(root, profile).await,
        Commands::Id => cli::show_id().await,
        Commands::Hash { path } => cli::hash(path).await,
        Commands::Snapshot { path, output } => cli::snapshot(path, output).await,
        Commands::Diff { path, snapshot } => cli::diff(path, snapshot).await,
        Commands::Demo => cli::run_demo().await,
    } {
        eprintln!(
            "{} {}\n{}",
            "Error:".red().bold(),
            e.to_string().red(),
            "Tip: Run with --help for usage information.".yellow()
        );
        std::process::exit(1);
    }
    Ok(())
}
