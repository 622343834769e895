// src/commands/mod.rs
//! Command handlers for the wimsmith CLI

mod checkpoint;
mod plan;
mod progress;
mod recover;
mod run;

pub use checkpoint::{
    cmd_checkpoint_list, cmd_checkpoint_prune, cmd_checkpoint_show, cmd_checkpoint_verify,
};
pub use plan::{cmd_modules, cmd_plan};
pub use recover::cmd_recover;
pub use run::{RunArgs, cmd_run};

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::debug;
use wimsmith::{BackendKind, Catalog, EngineConfig, ModuleRegistry};

/// Default catalog file name in the user config directory
const CATALOG_FILE_NAME: &str = "modules.toml";

/// Global options shared by every command
pub struct GlobalArgs {
    pub config: Option<PathBuf>,
    pub simulate: bool,
    pub state_dir: Option<PathBuf>,
    pub catalog: Option<PathBuf>,
}

impl GlobalArgs {
    /// Resolve the engine configuration from the config file and flags
    pub fn engine_config(&self) -> Result<EngineConfig> {
        let mut config = EngineConfig::discover(self.config.as_deref())
            .context("Failed to load configuration")?;
        if let Some(state_dir) = &self.state_dir {
            config.state_dir = state_dir.clone();
        }
        if self.simulate {
            config = config.with_backend(BackendKind::Simulated);
        }
        debug!("Using state directory {}", config.state_dir.display());
        Ok(config)
    }

    /// Load the module catalog into a registry
    ///
    /// Without `--catalog`, the user catalog is used if it exists; otherwise
    /// the registry is empty.
    pub fn registry(&self) -> Result<ModuleRegistry> {
        let mut registry = ModuleRegistry::new();
        let path = match &self.catalog {
            Some(path) => Some(path.clone()),
            None => default_catalog().filter(|p| p.is_file()),
        };
        if let Some(path) = path {
            load_catalog(&path, &mut registry)?;
        }
        Ok(registry)
    }
}

fn default_catalog() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("wimsmith").join(CATALOG_FILE_NAME))
}

fn load_catalog(path: &Path, registry: &mut ModuleRegistry) -> Result<()> {
    let catalog = Catalog::load(path)
        .with_context(|| format!("Failed to load module catalog {}", path.display()))?;
    catalog
        .register_into(registry)
        .with_context(|| format!("Invalid module catalog {}", path.display()))?;
    debug!("Loaded {} module(s) from {}", registry.len(), path.display());
    Ok(())
}
