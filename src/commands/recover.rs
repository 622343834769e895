// src/commands/recover.rs
//! Stale mount recovery command

use super::GlobalArgs;
use anyhow::{Context, Result};
use tracing::info;
use wimsmith::{Orchestrator, RecoveryOutcome};

pub fn cmd_recover(global: &GlobalArgs) -> Result<()> {
    let config = global.engine_config()?;
    let orchestrator = Orchestrator::new(&config, Default::default());

    info!("Reconciling mounts under {}", config.mount_root().display());
    let outcomes = orchestrator.recover().context("Recovery failed")?;
    if outcomes.is_empty() {
        println!("Nothing to recover.");
        return Ok(());
    }

    for outcome in &outcomes {
        match outcome {
            RecoveryOutcome::Discarded {
                mount_dir,
                image_path,
                run_id,
            } => println!(
                "discarded   {} ({}, run {})",
                mount_dir.display(),
                image_path.display(),
                run_id.as_deref().unwrap_or("unknown")
            ),
            RecoveryOutcome::LiveOwner {
                mount_dir,
                run_id,
                pid,
            } => println!(
                "in use      {} (run {}, pid {})",
                mount_dir.display(),
                run_id,
                pid
            ),
            RecoveryOutcome::Foreign {
                mount_dir,
                image_path,
            } => println!(
                "foreign     {} ({}), left alone",
                mount_dir.display(),
                image_path.display()
            ),
            RecoveryOutcome::Failed { mount_dir, error } => {
                println!("failed      {}: {}", mount_dir.display(), error)
            }
            RecoveryOutcome::OwnerRecordRemoved { run_id } => {
                println!("removed     owner record of run {}", run_id)
            }
            RecoveryOutcome::CheckpointAbandoned { run_id, verified } => println!(
                "abandoned   checkpoint {} (image {})",
                run_id,
                if *verified { "unchanged" } else { "CHANGED" }
            ),
        }
    }
    Ok(())
}
