// src/commands/plan.rs
//! Plan and module listing commands

use super::GlobalArgs;
use anyhow::{Context, Result};
use wimsmith::{Enablement, Environment};

/// Show the order a run with these modules would use
pub fn cmd_plan(global: &GlobalArgs, modules: &[String]) -> Result<()> {
    let config = global.engine_config()?;
    let registry = global.registry()?;
    let environment = Environment::detect(&config);

    let plan = registry
        .plan(modules, &environment)
        .context("Cannot resolve plan")?;

    if plan.is_empty() && plan.excluded().is_empty() {
        println!("No modules enabled.");
        return Ok(());
    }

    println!("{:>4}  {:24}  {:>8}  {:16}  LABEL", "#", "MODULE", "PRIORITY", "CAPABILITY");
    for (position, descriptor) in plan.modules().iter().enumerate() {
        println!(
            "{:>4}  {:24}  {:>8}  {:16}  {}{}",
            position + 1,
            descriptor.id,
            descriptor.priority,
            descriptor.capability.to_string(),
            descriptor.label,
            if descriptor.critical { " (critical)" } else { "" }
        );
    }
    for excluded in plan.excluded() {
        println!(
            "{:>4}  {:24}  {:>8}  {:16}  excluded: {}",
            "-",
            excluded.descriptor.id,
            excluded.descriptor.priority,
            excluded.descriptor.capability.to_string(),
            excluded.reason
        );
    }
    Ok(())
}

/// List every registered module
pub fn cmd_modules(global: &GlobalArgs) -> Result<()> {
    let config = global.engine_config()?;
    let registry = global.registry()?;
    let environment = Environment::detect(&config);

    if registry.is_empty() {
        println!("No modules registered.");
        println!("\nAdd [[module]] entries to a catalog and pass it with --catalog.");
        return Ok(());
    }

    println!("{:24}  {:>8}  {:16}  {:9}  ENABLED", "MODULE", "PRIORITY", "CAPABILITY", "AVAILABLE");
    for descriptor in registry.descriptors() {
        let enablement = match &descriptor.enablement {
            Enablement::Selected => "when selected".to_string(),
            Enablement::Always => "always".to_string(),
            Enablement::WhenAnySelected(ids) => format!("with {}", ids.join(", ")),
        };
        println!(
            "{:24}  {:>8}  {:16}  {:9}  {}",
            descriptor.id,
            descriptor.priority,
            descriptor.capability.to_string(),
            if environment.supports(descriptor.capability) { "yes" } else { "no" },
            enablement
        );
    }
    println!("\nTotal: {} module(s)", registry.len());
    Ok(())
}
