// src/cli/mod.rs
//! CLI definitions for wimsmith
//!
//! This module contains all command-line interface definitions using clap.
//! The actual command implementations are in the `commands` module.
//!
//! - `run` - Customize an image with the selected modules
//! - `plan` - Show the module order a run would use
//! - `modules` - List registered modules
//! - `recover` - Discard stale mounts left by crashed runs
//! - `checkpoint` - Inspect, verify and prune checkpoints

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod checkpoint;

pub use checkpoint::CheckpointCommands;

#[derive(Parser)]
#[command(name = "wimsmith")]
#[command(author = "wimsmith Contributors")]
#[command(version)]
#[command(
    about = "Offline Windows image customizer with checkpoints and rollback",
    long_about = None
)]
pub struct Cli {
    /// Configuration file (default: <config dir>/wimsmith/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Use the simulated backend instead of DISM
    #[arg(long, global = true)]
    pub simulate: bool,

    /// Override the state directory from the configuration
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,

    /// Module catalog (default: <config dir>/wimsmith/modules.toml)
    #[arg(long, global = true)]
    pub catalog: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Customize an image with the selected modules
    Run {
        /// Image file (WIM, ESD, VHD, VHDX)
        image: PathBuf,

        /// Image index inside the file
        #[arg(short, long, default_value_t = 1)]
        index: u32,

        /// Module ids to enable (comma-separated or repeated)
        #[arg(short, long = "module", value_delimiter = ',')]
        modules: Vec<String>,

        /// Treat exactly these module ids as critical
        #[arg(long, value_delimiter = ',')]
        critical: Option<Vec<String>>,

        /// Image format, if the extension is misleading (wim, esd, vhd, vhdx)
        #[arg(long)]
        format: Option<String>,

        /// Print the run result as JSON instead of a summary
        #[arg(long)]
        json: bool,

        /// Skip stale mount recovery before the run
        #[arg(long)]
        no_recover: bool,
    },

    /// Show the module order a run would use
    Plan {
        /// Module ids to enable (comma-separated or repeated)
        #[arg(short, long = "module", value_delimiter = ',')]
        modules: Vec<String>,
    },

    /// List registered modules
    Modules,

    /// Discard stale mounts and abandon checkpoints of crashed runs
    Recover,

    /// Checkpoint management
    #[command(subcommand)]
    Checkpoint(CheckpointCommands),
}
