// src/modules/catalog.rs

//! Declarative modules loaded from a TOML catalog
//!
//! ```toml
//! [[module]]
//! id = "disable_telemetry"
//! label = "Disable telemetry"
//! priority = 10
//! critical = true
//!
//! [[module.registry]]
//! hive = "software"
//! key = 'Policies\Microsoft\Windows\DataCollection'
//! name = "AllowTelemetry"
//! value = { type = "dword", data = 0 }
//!
//! [[module]]
//! id = "remove_smb1"
//! label = "Remove SMB1"
//! priority = 20
//!
//! [[module.feature]]
//! name = "SMB1Protocol"
//! enable = false
//! ```
//!
//! A registry action either sets `value` or has `delete = true`; a delete
//! without `name` removes the whole key. A module holds registry actions or
//! feature actions, never both.

use super::{
    Capability, CustomizationModule, Enablement, ModuleDescriptor, ModuleOutcome, ModuleRegistry,
    ModuleResult,
};
use crate::engine::ModuleContext;
use crate::native::RegValue;
use crate::session::HiveName;
use crate::{Error, Result};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct RegistryActionSpec {
    hive: HiveName,
    key: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    value: Option<RegValue>,
    #[serde(default)]
    delete: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct FeatureActionSpec {
    name: String,
    enable: bool,
}

/// One `[[module]]` table
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CatalogEntry {
    pub id: String,
    pub label: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub critical: bool,
    /// Run in every plan
    #[serde(default)]
    pub always: bool,
    /// Also enable when any of these ids is selected
    #[serde(default)]
    pub enabled_with: Vec<String>,
    /// Overrides the capability inferred from the actions
    #[serde(default)]
    pub capability: Option<Capability>,
    #[serde(default)]
    registry: Vec<RegistryActionSpec>,
    #[serde(default)]
    feature: Vec<FeatureActionSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CatalogFile {
    #[serde(default, rename = "module")]
    modules: Vec<CatalogEntry>,
}

/// A single edit performed by a catalog module
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogAction {
    SetValue {
        hive: HiveName,
        key: String,
        name: String,
        value: RegValue,
    },
    DeleteValue {
        hive: HiveName,
        key: String,
        name: String,
    },
    DeleteKey {
        hive: HiveName,
        key: String,
    },
    Feature {
        name: String,
        enable: bool,
    },
}

impl CatalogAction {
    fn hive(&self) -> Option<HiveName> {
        match self {
            Self::SetValue { hive, .. }
            | Self::DeleteValue { hive, .. }
            | Self::DeleteKey { hive, .. } => Some(*hive),
            Self::Feature { .. } => None,
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::SetValue {
                hive,
                key,
                name,
                value,
            } => format!("set {}\\{}\\{} = {}", hive, key, name, value),
            Self::DeleteValue { hive, key, name } => format!("delete {}\\{}\\{}", hive, key, name),
            Self::DeleteKey { hive, key } => format!("delete key {}\\{}", hive, key),
            Self::Feature { name, enable } => {
                format!("{} feature {}", if *enable { "enable" } else { "disable" }, name)
            }
        }
    }
}

impl CatalogEntry {
    fn actions(&self) -> Result<Vec<CatalogAction>> {
        if !self.registry.is_empty() && !self.feature.is_empty() {
            return Err(Error::Catalog(format!(
                "module {} mixes registry and feature actions; split it into two modules",
                self.id
            )));
        }

        let mut actions = Vec::new();
        for spec in &self.registry {
            let action = match (&spec.value, spec.delete, &spec.name) {
                (Some(value), false, name) => CatalogAction::SetValue {
                    hive: spec.hive,
                    key: spec.key.clone(),
                    name: name.clone().unwrap_or_default(),
                    value: value.clone(),
                },
                (None, true, Some(name)) => CatalogAction::DeleteValue {
                    hive: spec.hive,
                    key: spec.key.clone(),
                    name: name.clone(),
                },
                (None, true, None) => CatalogAction::DeleteKey {
                    hive: spec.hive,
                    key: spec.key.clone(),
                },
                _ => {
                    return Err(Error::Catalog(format!(
                        "module {}: registry action on {} needs either value or delete = true",
                        self.id, spec.key
                    )));
                }
            };
            actions.push(action);
        }
        actions.extend(self.feature.iter().map(|f| CatalogAction::Feature {
            name: f.name.clone(),
            enable: f.enable,
        }));

        if actions.is_empty() {
            return Err(Error::Catalog(format!("module {} has no actions", self.id)));
        }
        Ok(actions)
    }

    fn inferred_capability(&self) -> Capability {
        if let Some(capability) = self.capability {
            capability
        } else if !self.feature.is_empty() {
            Capability::FeatureToggle
        } else {
            Capability::Registry
        }
    }

    fn enablement(&self) -> Enablement {
        if self.always {
            Enablement::Always
        } else if !self.enabled_with.is_empty() {
            Enablement::WhenAnySelected(self.enabled_with.clone())
        } else {
            Enablement::Selected
        }
    }

    /// Build the registry descriptor for this entry
    pub fn descriptor(&self) -> Result<ModuleDescriptor> {
        let module = CatalogModule::new(self.actions()?);
        Ok(ModuleDescriptor::new(
            self.id.clone(),
            self.label.clone(),
            self.priority,
            self.inferred_capability(),
            Arc::new(module),
        )
        .critical(self.critical)
        .enablement(self.enablement()))
    }
}

/// Parsed module catalog
#[derive(Debug, Clone)]
pub struct Catalog {
    entries: Vec<CatalogEntry>,
}

impl Catalog {
    pub fn parse(content: &str) -> Result<Self> {
        let file: CatalogFile =
            toml::from_str(content).map_err(|e| Error::Catalog(e.to_string()))?;
        let catalog = Self {
            entries: file.modules,
        };
        for entry in &catalog.entries {
            entry.actions()?;
        }
        Ok(catalog)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Catalog(format!("failed to read {}: {}", path.display(), e)))?;
        Self::parse(&content)
    }

    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    /// Register every entry, in file order
    pub fn register_into(&self, registry: &mut ModuleRegistry) -> Result<()> {
        for entry in &self.entries {
            registry.register(entry.descriptor()?)?;
        }
        Ok(())
    }
}

/// Module that applies a fixed list of catalog actions
#[derive(Debug, Clone)]
pub struct CatalogModule {
    actions: Vec<CatalogAction>,
}

impl CatalogModule {
    pub fn new(actions: Vec<CatalogAction>) -> Self {
        Self { actions }
    }

    pub fn actions(&self) -> &[CatalogAction] {
        &self.actions
    }
}

impl CustomizationModule for CatalogModule {
    fn run(&self, ctx: &mut ModuleContext<'_>) -> ModuleResult<ModuleOutcome> {
        let total = self.actions.len();
        let mut done = 0;

        // Registry actions grouped per hive so each hive loads once
        let mut hives: Vec<HiveName> = Vec::new();
        for hive in self.actions.iter().filter_map(CatalogAction::hive) {
            if !hives.contains(&hive) {
                hives.push(hive);
            }
        }
        for hive in hives {
            let lease = ctx.open_hive(hive)?;
            for action in self.actions.iter().filter(|a| a.hive() == Some(hive)) {
                let result = match action {
                    CatalogAction::SetValue {
                        key, name, value, ..
                    } => lease.set_value(key, name, value),
                    CatalogAction::DeleteValue { key, name, .. } => lease.delete_value(key, name),
                    CatalogAction::DeleteKey { key, .. } => lease.delete_key(key),
                    CatalogAction::Feature { .. } => continue,
                };
                result.map_err(super::ModuleError::Hive)?;
                done += 1;
                ctx.log(action.describe());
                ctx.report_progress(percent(done, total), &action.describe());
            }
            lease.release();
        }

        for action in &self.actions {
            if let CatalogAction::Feature { name, enable } = action {
                ctx.set_feature(name, *enable)?;
                done += 1;
                ctx.log(action.describe());
                ctx.report_progress(percent(done, total), &action.describe());
            }
        }

        Ok(ModuleOutcome::Applied)
    }
}

fn percent(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    u8::try_from(done * 100 / total).unwrap_or(100)
}
