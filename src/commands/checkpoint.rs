// src/commands/checkpoint.rs
//! Checkpoint inspection commands

use super::GlobalArgs;
use anyhow::{Context, Result};
use tracing::info;
use wimsmith::{CheckpointStatus, CheckpointStore};

fn store(global: &GlobalArgs) -> Result<(CheckpointStore, wimsmith::EngineConfig)> {
    let config = global.engine_config()?;
    Ok((CheckpointStore::from_config(&config), config))
}

fn describe(status: &CheckpointStatus) -> String {
    match status {
        CheckpointStatus::Pending => "pending".to_string(),
        CheckpointStatus::Finalized { outcome, at } => {
            format!("{} at {}", outcome, at.format("%Y-%m-%d %H:%M:%S"))
        }
        CheckpointStatus::Abandoned { reason, at } => {
            format!("abandoned at {}: {}", at.format("%Y-%m-%d %H:%M:%S"), reason)
        }
    }
}

pub fn cmd_checkpoint_list(global: &GlobalArgs, pending_only: bool) -> Result<()> {
    let (store, _) = store(global)?;
    let entries = if pending_only {
        store.pending()?
    } else {
        store.list()?
    };

    if entries.is_empty() {
        println!("No checkpoints recorded.");
        return Ok(());
    }

    println!("{:36}  {:19}  {:>5}  STATUS", "RUN", "CREATED", "INDEX");
    println!("{}", "-".repeat(90));
    for entry in &entries {
        println!(
            "{:36}  {:19}  {:>5}  {}",
            entry.checkpoint.run_id,
            entry.checkpoint.created_at.format("%Y-%m-%d %H:%M:%S"),
            entry.checkpoint.index,
            describe(&entry.status)
        );
    }
    println!("\nTotal: {} checkpoint(s)", entries.len());
    Ok(())
}

pub fn cmd_checkpoint_show(global: &GlobalArgs, run_id: &str) -> Result<()> {
    let (store, _) = store(global)?;
    let entry = store
        .load(run_id)
        .with_context(|| format!("Cannot load checkpoint {}", run_id))?;
    let checkpoint = &entry.checkpoint;

    println!("Run:       {}", checkpoint.run_id);
    println!("Image:     {}", checkpoint.image_path.display());
    println!("Index:     {}", checkpoint.index);
    println!("Size:      {} bytes", checkpoint.size);
    println!("Hash:      {}:{}", checkpoint.algorithm.name(), checkpoint.hash);
    println!("Created:   {}", checkpoint.created_at.format("%Y-%m-%d %H:%M:%S"));
    println!("Status:    {}", describe(&entry.status));
    Ok(())
}

/// Returns whether the image still matches
pub fn cmd_checkpoint_verify(global: &GlobalArgs, run_id: &str) -> Result<bool> {
    let (store, _) = store(global)?;
    let entry = store
        .load(run_id)
        .with_context(|| format!("Cannot load checkpoint {}", run_id))?;

    info!("Hashing {}", entry.checkpoint.image_path.display());
    let matches = store
        .verify(&entry.checkpoint)
        .context("Cannot re-hash image")?;
    if matches {
        println!("{} matches checkpoint {}", entry.checkpoint.image_path.display(), run_id);
    } else {
        println!(
            "{} has changed since checkpoint {}",
            entry.checkpoint.image_path.display(),
            run_id
        );
    }
    Ok(matches)
}

pub fn cmd_checkpoint_prune(global: &GlobalArgs, days: Option<u32>) -> Result<()> {
    let (store, config) = store(global)?;
    let retention = match days {
        Some(days) => chrono::Duration::days(i64::from(days)),
        None => config.retention(),
    };
    let removed = store.prune_expired(retention)?;
    println!("Pruned {} checkpoint(s)", removed.len());
    Ok(())
}
