// src/commands/progress.rs
//! Terminal rendering of run events
//!
//! An overall bar counts finished modules; the status line below shows the
//! current module and its latest progress message.

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::time::Duration;
use wimsmith::{ModuleStatus, RunEvent, RunEventKind, RunObserver};

pub struct RunProgress {
    multi: MultiProgress,
    overall: ProgressBar,
    status: ProgressBar,
}

impl RunProgress {
    pub fn new() -> Self {
        let multi = MultiProgress::new();

        let overall = ProgressBar::new(0);
        overall.set_style(
            ProgressStyle::default_bar()
                .template("{msg} ({pos}/{len}) [{bar:40.green/dim}] {percent}%")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("##-"),
        );
        overall.set_message("Preparing");

        let status = ProgressBar::new_spinner();
        status.set_style(
            ProgressStyle::default_spinner()
                .template("  {spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        status.enable_steady_tick(Duration::from_millis(100));

        let overall = multi.add(overall);
        let status = multi.add(status);
        Self {
            multi,
            overall,
            status,
        }
    }

    fn println(&self, line: String) {
        let _ = self.multi.println(line);
    }
}

impl RunObserver for RunProgress {
    fn on_event(&self, event: &RunEvent) {
        match &event.kind {
            RunEventKind::RunStarted { image } => {
                self.status.set_message(format!("Checkpointing {}", image));
            }
            RunEventKind::PlanResolved { order, excluded } => {
                self.overall.set_length(order.len() as u64);
                self.overall.set_message("Customizing");
                for (id, reason) in excluded {
                    self.println(format!("  [skip] {} ({})", id, reason));
                }
            }
            RunEventKind::ModuleStarting { label, .. } => {
                self.status.set_message(label.clone());
            }
            RunEventKind::Progress {
                module_id,
                percent,
                message,
            } => {
                self.status
                    .set_message(format!("{} {:>3}% {}", module_id, percent, message));
            }
            RunEventKind::Log { .. } | RunEventKind::State { .. } => {}
            RunEventKind::ModuleFinished {
                module_id,
                status,
                elapsed,
            } => {
                let marker = match status {
                    ModuleStatus::Succeeded => "  [ok]",
                    ModuleStatus::Failed { .. } => "[fail]",
                    ModuleStatus::Skipped { .. } => "[skip]",
                };
                self.println(format!(
                    "{} {} ({:.1}s) {}",
                    marker,
                    module_id,
                    elapsed.as_secs_f64(),
                    match status {
                        ModuleStatus::Succeeded => String::new(),
                        other => other.to_string(),
                    }
                ));
                self.overall.inc(1);
            }
            RunEventKind::IntegrityWarning { check } => {
                self.println(format!("warning: integrity check after discard: {}", check));
            }
            RunEventKind::RunFinished { outcome, .. } => {
                self.status.finish_and_clear();
                self.overall.finish_with_message(format!("Run {}", outcome));
            }
        }
    }
}
