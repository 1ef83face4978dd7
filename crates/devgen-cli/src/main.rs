//! DevGen CLI entry point.
//!
//! Binary name: `devgen`
//!
//! Parses CLI arguments, initializes tracing, then dispatches to the
//! appropriate command handler.

mod agents;
mod cli;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Set up tracing based on verbosity
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info,devgen=debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(false)
        .init();

    match cli.command {
        Commands::Run { file, vars } => {
            cli::run::run_playbook(&file, &vars, cli.json, cli.quiet).await?;
        }

        Commands::Validate { file } => {
            cli::validate::validate_file(&file, cli.json)?;
        }

        Commands::List { dir } => {
            cli::list::list_playbooks(&dir, cli.json)?;
        }
    }

    Ok(())
}
