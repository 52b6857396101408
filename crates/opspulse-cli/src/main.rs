//! OpsPulse CLI - runs the metrics dashboard server

mod cli;
mod commands;
mod logging;
mod settings;

use clap::Parser;
use cli::{Cli, Commands, ConfigCommands};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run_command_async(cli))
}

async fn run_command_async(cli: Cli) -> anyhow::Result<()> {
    let config = cli.config.as_deref();

    match cli.command {
        Commands::Serve { host, port } => {
            commands::serve::run(config, cli.verbose, host, port).await?;
        }

        Commands::Config { action } => match action {
            ConfigCommands::Show { format } => commands::config::run_show(config, format)?,
            ConfigCommands::Validate => commands::config::run_validate(config)?,
        },
    }

    Ok(())
}
