// src/progress.rs

//! Run observers
//!
//! The engine reports everything a run does as a stream of [`RunEvent`]s.
//! Observers decide what to do with them. Implementations include:
//! - `SilentObserver`: no-op for scripted/quiet modes
//! - `LogObserver`: mirrors events into tracing
//! - `CallbackObserver`: calls a user-provided function
//! - `ChannelObserver`: forwards events over a tokio channel (async front ends)
//! - `CollectingObserver`: keeps every event in memory
//!
//! Observers are called synchronously from the run's thread, so every event
//! of module N has been delivered before module N+1 starts.
//!
//! # Example
//!
//! ```ignore
//! use wimsmith::progress::{CallbackObserver, RunEventKind};
//!
//! let observer = CallbackObserver::new(|event| {
//!     if let RunEventKind::Progress { module_id, percent, .. } = &event.kind {
//!         println!("{}: {}%", module_id, percent);
//!     }
//! });
//! let orchestrator = orchestrator.with_observer(Arc::new(observer));
//! ```

use crate::checkpoint::RunOutcome;
use crate::engine::{AbortReason, EngineState, IntegrityCheck, ModuleStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// One thing that happened during a run
#[derive(Debug, Clone, Serialize)]
pub struct RunEvent {
    pub run_id: String,
    pub at: DateTime<Utc>,
    pub kind: RunEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEventKind {
    RunStarted {
        image: String,
    },
    /// The engine moved to a new state
    State {
        state: EngineState,
    },
    PlanResolved {
        order: Vec<String>,
        excluded: Vec<(String, String)>,
    },
    ModuleStarting {
        module_id: String,
        label: String,
        position: usize,
        total: usize,
    },
    Progress {
        module_id: String,
        percent: u8,
        message: String,
    },
    Log {
        module_id: String,
        line: String,
    },
    ModuleFinished {
        module_id: String,
        status: ModuleStatus,
        elapsed: Duration,
    },
    /// The image no longer matches its checkpoint after a discard
    IntegrityWarning {
        check: IntegrityCheck,
    },
    RunFinished {
        outcome: RunOutcome,
        abort_reason: Option<AbortReason>,
    },
}

/// Receives run events
///
/// Implementations should be thread-safe (Send + Sync): batch runs call one
/// observer from several threads.
pub trait RunObserver: Send + Sync {
    fn on_event(&self, event: &RunEvent);
}

/// Observer that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentObserver;

impl RunObserver for SilentObserver {
    fn on_event(&self, _event: &RunEvent) {}
}

/// Observer that logs events to tracing
///
/// Lifecycle events at info level, module output at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl RunObserver for LogObserver {
    fn on_event(&self, event: &RunEvent) {
        let run = &event.run_id;
        match &event.kind {
            RunEventKind::RunStarted { image } => info!("[{}] run started for {}", run, image),
            RunEventKind::State { state } => debug!("[{}] state: {}", run, state),
            RunEventKind::PlanResolved { order, excluded } => {
                info!("[{}] plan: [{}]", run, order.join(", "));
                for (id, reason) in excluded {
                    info!("[{}] excluded {}: {}", run, id, reason);
                }
            }
            RunEventKind::ModuleStarting {
                module_id,
                position,
                total,
                ..
            } => info!("[{}] ({}/{}) {}", run, position, total, module_id),
            RunEventKind::Progress {
                module_id,
                percent,
                message,
            } => debug!("[{}] {}: {}% {}", run, module_id, percent, message),
            RunEventKind::Log { module_id, line } => debug!("[{}] {}: {}", run, module_id, line),
            RunEventKind::ModuleFinished {
                module_id, status, ..
            } => info!("[{}] {}: {}", run, module_id, status),
            RunEventKind::IntegrityWarning { check } => {
                warn!("[{}] integrity check after discard: {}", run, check)
            }
            RunEventKind::RunFinished {
                outcome,
                abort_reason,
            } => match abort_reason {
                Some(reason) => info!("[{}] finished: {} ({})", run, outcome, reason),
                None => info!("[{}] finished: {}", run, outcome),
            },
        }
    }
}

/// Callback-based observer
///
/// Useful for custom rendering or GUI integration.
pub struct CallbackObserver<F>
where
    F: Fn(&RunEvent) + Send + Sync,
{
    callback: F,
}

impl<F> CallbackObserver<F>
where
    F: Fn(&RunEvent) + Send + Sync,
{
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

impl<F> RunObserver for CallbackObserver<F>
where
    F: Fn(&RunEvent) + Send + Sync,
{
    fn on_event(&self, event: &RunEvent) {
        (self.callback)(event);
    }
}

/// Forwards events to an unbounded tokio channel
///
/// Sending never blocks; events are enqueued in order. A dropped receiver
/// is not an error for the run.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    sender: mpsc::UnboundedSender<RunEvent>,
}

impl ChannelObserver {
    pub fn new(sender: mpsc::UnboundedSender<RunEvent>) -> Self {
        Self { sender }
    }

    /// Observer plus the receiving end
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<RunEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self::new(sender), receiver)
    }
}

impl RunObserver for ChannelObserver {
    fn on_event(&self, event: &RunEvent) {
        let _ = self.sender.send(event.clone());
    }
}

/// Keeps every event in memory
#[derive(Debug, Default)]
pub struct CollectingObserver {
    events: Mutex<Vec<RunEvent>>,
}

impl CollectingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<RunEvent>> {
        self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn events(&self) -> Vec<RunEvent> {
        self.lock().clone()
    }

    pub fn kinds(&self) -> Vec<RunEventKind> {
        self.lock().iter().map(|e| e.kind.clone()).collect()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

impl RunObserver for CollectingObserver {
    fn on_event(&self, event: &RunEvent) {
        self.lock().push(event.clone());
    }
}

/// Fans one event out to several observers
pub(crate) struct EventSink<'a> {
    run_id: &'a str,
    observers: Vec<&'a dyn RunObserver>,
}

impl<'a> EventSink<'a> {
    pub(crate) fn new(run_id: &'a str, observers: Vec<&'a dyn RunObserver>) -> Self {
        Self { run_id, observers }
    }

    pub(crate) fn emit(&self, kind: RunEventKind) {
        let event = RunEvent {
            run_id: self.run_id.to_string(),
            at: Utc::now(),
            kind,
        };
        for observer in &self.observers {
            observer.on_event(&event);
        }
    }
}
