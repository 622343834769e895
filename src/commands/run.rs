// src/commands/run.rs
//! The `run` command

use super::GlobalArgs;
use super::progress::RunProgress;
use anyhow::{Context, Result, bail};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use wimsmith::{
    ImageFormat, ModuleStatus, Orchestrator, RecoveryOutcome, RunOutcome, RunRequest, RunResult,
    SilentObserver,
};

pub struct RunArgs {
    pub image: PathBuf,
    pub index: u32,
    pub modules: Vec<String>,
    pub critical: Option<Vec<String>>,
    pub format: Option<String>,
    pub json: bool,
    pub no_recover: bool,
}

/// Run one customization request; returns whether the run committed
pub fn cmd_run(global: &GlobalArgs, args: RunArgs) -> Result<bool> {
    let config = global.engine_config()?;
    let registry = global.registry()?;

    let mut request = RunRequest::new(&args.image, args.index).with_modules(args.modules);
    if let Some(format) = &args.format {
        let format: ImageFormat = format
            .parse()
            .with_context(|| format!("Unknown image format '{}'", format))?;
        request = request.with_format(format);
    }
    if let Some(critical) = args.critical {
        request = request.with_critical_override(critical);
    }

    let orchestrator = Orchestrator::new(&config, registry);
    if !args.no_recover {
        let outcomes = orchestrator
            .recover()
            .context("Stale mount recovery failed")?;
        report_recovery(&outcomes);
    }

    // Fail before hashing a multi-gigabyte image
    if let Err(e) = orchestrator.plan(&request) {
        bail!("Invalid module selection: {}", e);
    }

    let orchestrator = if args.json {
        orchestrator.with_observer(Arc::new(SilentObserver))
    } else {
        orchestrator.with_observer(Arc::new(RunProgress::new()))
    };

    info!("Customizing {} (index {})", args.image.display(), args.index);
    let result = orchestrator.run(&request);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_summary(&result);
    }
    Ok(result.outcome == RunOutcome::Committed)
}

fn report_recovery(outcomes: &[RecoveryOutcome]) {
    for outcome in outcomes {
        if let RecoveryOutcome::Discarded { mount_dir, .. } = outcome {
            println!("Discarded stale mount at {}", mount_dir.display());
        }
    }
}

fn print_summary(result: &RunResult) {
    println!();
    println!("Run {}", result.run_id);
    println!("{:24}  {:8}  {:>8}  STATUS", "MODULE", "CRITICAL", "TIME");
    println!("{}", "-".repeat(70));
    for module in &result.modules {
        let status = match &module.status {
            ModuleStatus::Succeeded => "succeeded".to_string(),
            other => other.to_string(),
        };
        println!(
            "{:24}  {:8}  {:>7.1}s  {}",
            module.id,
            if module.critical { "yes" } else { "" },
            module.elapsed.as_secs_f64(),
            status
        );
    }
    println!();
    match result.abort_reason {
        Some(reason) => println!("Outcome: {} ({})", result.outcome, reason),
        None => println!("Outcome: {}", result.outcome),
    }
    if let Some(error) = &result.error {
        println!("Error: {}", error);
    }
    println!("Integrity: {}", result.integrity);
    println!("Elapsed: {:.1}s", result.elapsed.as_secs_f64());
}
