//! fixclawctl - command-line control for the fixclaw watchdog

mod cli;
mod commands;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let code = match cli.command {
        Commands::Init { force } => commands::init(&cli.config, force)?,
        Commands::Check { json } => commands::check(&cli.config, json).await?,
        Commands::Repair { force, json } => commands::repair(&cli.config, force, json).await?,
        Commands::Monitor => commands::monitor(&cli.config).await?,
        Commands::Up => commands::up(&cli.config).await?,
        Commands::Status { json, limit } => commands::status(&cli.config, json, limit)?,
    };

    std::process::exit(code)
}
