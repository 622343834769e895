// src/cli/checkpoint.rs
//! Checkpoint commands

use clap::Subcommand;

#[derive(Subcommand)]
pub enum CheckpointCommands {
    /// List checkpoints, newest last
    List {
        /// Only pending checkpoints
        #[arg(long)]
        pending: bool,
    },

    /// Show one checkpoint
    Show {
        /// Run id
        run_id: String,
    },

    /// Re-hash the image and compare with the checkpoint
    Verify {
        /// Run id
        run_id: String,
    },

    /// Remove finalized checkpoints older than the retention window
    Prune {
        /// Retention in days (default: from configuration)
        #[arg(long)]
        days: Option<u32>,
    },
}
