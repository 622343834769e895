// src/main.rs

mod cli;
mod commands;

use anyhow::Result;
use clap::Parser;
use cli::{CheckpointCommands, Cli, Commands};
use commands::{GlobalArgs, RunArgs};

fn main() -> Result<()> {
    // Initialize tracing subscriber for logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let global = GlobalArgs {
        config: cli.config,
        simulate: cli.simulate,
        state_dir: cli.state_dir,
        catalog: cli.catalog,
    };

    let success = match cli.command {
        Commands::Run {
            image,
            index,
            modules,
            critical,
            format,
            json,
            no_recover,
        } => commands::cmd_run(
            &global,
            RunArgs {
                image,
                index,
                modules,
                critical,
                format,
                json,
                no_recover,
            },
        )?,
        Commands::Plan { modules } => {
            commands::cmd_plan(&global, &modules)?;
            true
        }
        Commands::Modules => {
            commands::cmd_modules(&global)?;
            true
        }
        Commands::Recover => {
            commands::cmd_recover(&global)?;
            true
        }
        Commands::Checkpoint(cmd) => match cmd {
            CheckpointCommands::List { pending } => {
                commands::cmd_checkpoint_list(&global, pending)?;
                true
            }
            CheckpointCommands::Show { run_id } => {
                commands::cmd_checkpoint_show(&global, &run_id)?;
                true
            }
            CheckpointCommands::Verify { run_id } => {
                commands::cmd_checkpoint_verify(&global, &run_id)?
            }
            CheckpointCommands::Prune { days } => {
                commands::cmd_checkpoint_prune(&global, days)?;
                true
            }
        },
    };

    if !success {
        std::process::exit(1);
    }
    Ok(())
}
