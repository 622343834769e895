// src/modules/mod.rs

//! Customization modules and the priority scheduler
//!
//! A module is one self-contained customization (disable telemetry,
//! install a package, toggle a feature). Modules are registered once, at
//! startup, each with a descriptor:
//!
//! - `id`: unique key used by run requests
//! - `priority`: lower runs first; ties run in registration order
//! - `capability`: what the host must provide for the module to be eligible
//! - `critical`: a failure rolls the whole run back
//! - `enablement`: when the module joins a plan
//!
//! ```ignore
//! let mut registry = ModuleRegistry::new();
//! registry.register(
//!     ModuleDescriptor::new("disable_telemetry", "Disable telemetry", 10,
//!                           Capability::Registry, Arc::new(DisableTelemetry)),
//! )?;
//! let plan = registry.plan(&["disable_telemetry".into()], &Environment::all())?;
//! ```

mod capability;
mod catalog;
mod error;

pub use capability::{Capability, Environment};
pub use catalog::{Catalog, CatalogAction, CatalogEntry, CatalogModule};
pub use error::{ModuleError, ModuleResult};

use crate::engine::ModuleContext;
use crate::{Error, Result};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::info;

/// What a module did when it returned normally
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleOutcome {
    Applied,
    /// The module decided there was nothing to do
    Skipped { reason: String },
}

/// A customization applied to a mounted image
pub trait CustomizationModule: Send + Sync {
    fn run(&self, ctx: &mut ModuleContext<'_>) -> ModuleResult<ModuleOutcome>;
}

struct FnModule<F>(F);

impl<F> CustomizationModule for FnModule<F>
where
    F: Fn(&mut ModuleContext<'_>) -> ModuleResult<ModuleOutcome> + Send + Sync,
{
    fn run(&self, ctx: &mut ModuleContext<'_>) -> ModuleResult<ModuleOutcome> {
        (self.0)(ctx)
    }
}

/// Wrap a closure as a module
pub fn module_fn<F>(f: F) -> Arc<dyn CustomizationModule>
where
    F: Fn(&mut ModuleContext<'_>) -> ModuleResult<ModuleOutcome> + Send + Sync + 'static,
{
    Arc::new(FnModule(f))
}

/// When a registered module joins a plan
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Enablement {
    /// Only when its id is selected
    #[default]
    Selected,
    /// In every plan
    Always,
    /// When its id or any of these ids is selected
    WhenAnySelected(Vec<String>),
}

impl Enablement {
    pub fn is_enabled(&self, id: &str, selected: &BTreeSet<String>) -> bool {
        match self {
            Self::Selected => selected.contains(id),
            Self::Always => true,
            Self::WhenAnySelected(ids) => {
                selected.contains(id) || ids.iter().any(|other| selected.contains(other))
            }
        }
    }
}

/// Registration record of one module
#[derive(Clone)]
pub struct ModuleDescriptor {
    pub id: String,
    pub label: String,
    pub priority: i32,
    pub capability: Capability,
    pub critical: bool,
    pub enablement: Enablement,
    pub module: Arc<dyn CustomizationModule>,
}

impl ModuleDescriptor {
    pub fn new(
        id: impl Into<String>,
        label: impl Into<String>,
        priority: i32,
        capability: Capability,
        module: Arc<dyn CustomizationModule>,
    ) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            priority,
            capability,
            critical: false,
            enablement: Enablement::Selected,
            module,
        }
    }

    pub fn critical(mut self, critical: bool) -> Self {
        self.critical = critical;
        self
    }

    pub fn enablement(mut self, enablement: Enablement) -> Self {
        self.enablement = enablement;
        self
    }
}

impl fmt::Debug for ModuleDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleDescriptor")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("priority", &self.priority)
            .field("capability", &self.capability)
            .field("critical", &self.critical)
            .field("enablement", &self.enablement)
            .finish()
    }
}

/// A module that was enabled but will not run
#[derive(Debug, Clone)]
pub struct ExcludedModule {
    pub descriptor: Arc<ModuleDescriptor>,
    pub reason: String,
}

/// Modules of one run in execution order
#[derive(Debug, Clone, Default)]
pub struct ScheduledPlan {
    modules: Vec<Arc<ModuleDescriptor>>,
    excluded: Vec<ExcludedModule>,
}

impl ScheduledPlan {
    /// Module ids in the order they run
    pub fn order(&self) -> Vec<&str> {
        self.modules.iter().map(|d| d.id.as_str()).collect()
    }

    pub fn modules(&self) -> &[Arc<ModuleDescriptor>] {
        &self.modules
    }

    pub fn excluded(&self) -> &[ExcludedModule] {
        &self.excluded
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

/// Registry of available modules
#[derive(Debug, Default)]
pub struct ModuleRegistry {
    modules: Vec<Arc<ModuleDescriptor>>,
    by_id: HashMap<String, usize>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module; ids must be unique
    pub fn register(&mut self, descriptor: ModuleDescriptor) -> Result<()> {
        if self.by_id.contains_key(&descriptor.id) {
            return Err(Error::DuplicateModule(descriptor.id));
        }
        self.by_id.insert(descriptor.id.clone(), self.modules.len());
        self.modules.push(Arc::new(descriptor));
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Arc<ModuleDescriptor>> {
        self.by_id.get(id).map(|&i| &self.modules[i])
    }

    pub fn has(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    /// Registered descriptors in registration order
    pub fn descriptors(&self) -> &[Arc<ModuleDescriptor>] {
        &self.modules
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Resolve the modules of a run
    ///
    /// Every id in `enabled_ids` must be registered. Enabled modules whose
    /// capability the environment lacks are listed as excluded. The result
    /// depends only on the registry, the ids and the environment.
    pub fn plan(&self, enabled_ids: &[String], env: &Environment) -> Result<ScheduledPlan> {
        let selected: BTreeSet<String> = enabled_ids.iter().cloned().collect();
        if let Some(unknown) = selected.iter().find(|id| !self.has(id)) {
            return Err(Error::UnknownModule(unknown.clone()));
        }

        let mut scheduled: Vec<(usize, &Arc<ModuleDescriptor>)> = Vec::new();
        let mut excluded = Vec::new();
        for (index, descriptor) in self.modules.iter().enumerate() {
            if !descriptor.enablement.is_enabled(&descriptor.id, &selected) {
                continue;
            }
            match env.exclusion_reason(descriptor.capability) {
                None => scheduled.push((index, descriptor)),
                Some(reason) => excluded.push(ExcludedModule {
                    descriptor: descriptor.clone(),
                    reason,
                }),
            }
        }
        scheduled.sort_by_key(|(index, d)| (d.priority, *index));

        let plan = ScheduledPlan {
            modules: scheduled.into_iter().map(|(_, d)| d.clone()).collect(),
            excluded,
        };
        info!(
            "Resolved plan: [{}] ({} excluded)",
            plan.order().join(", "),
            plan.excluded.len()
        );
        Ok(plan)
    }
}
