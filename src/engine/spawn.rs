// src/engine/spawn.rs

//! Running requests off the caller's thread
//!
//! Native tools block for minutes, so async callers hand the run to tokio's
//! blocking pool and consume events from a channel. Batches of requests for
//! different images run in parallel on rayon's pool; requests naming the
//! same image serialize through the image lease (the loser is aborted with
//! `ResourceBusy`).

use super::{CancellationToken, Orchestrator, RunRequest, RunResult};
use crate::progress::{ChannelObserver, RunEvent};
use rayon::prelude::*;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};

/// A run in progress on the blocking pool
pub struct RunHandle {
    events: mpsc::UnboundedReceiver<RunEvent>,
    join: JoinHandle<RunResult>,
    cancel: CancellationToken,
}

impl RunHandle {
    /// Next event; `None` once the run has finished and the queue is drained
    pub async fn next_event(&mut self) -> Option<RunEvent> {
        self.events.recv().await
    }

    /// Ask the run to stop before its next module
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Wait for the result, dropping any events not yet consumed
    ///
    /// Fails only if the run's thread panicked outside module code.
    pub async fn wait(self) -> Result<RunResult, JoinError> {
        self.join.await
    }

    /// Wait for the result, returning every remaining event with it
    pub async fn collect(mut self) -> Result<(Vec<RunEvent>, RunResult), JoinError> {
        let mut events = Vec::new();
        while let Some(event) = self.events.recv().await {
            events.push(event);
        }
        let result = self.join.await?;
        Ok((events, result))
    }
}

/// Start a run on tokio's blocking pool
///
/// Must be called from within a tokio runtime.
pub fn spawn_run(orchestrator: Arc<Orchestrator>, request: RunRequest) -> RunHandle {
    let (observer, events) = ChannelObserver::channel();
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let join = tokio::task::spawn_blocking(move || {
        orchestrator.execute(&request, &token, Some(&observer))
    });
    RunHandle {
        events,
        join,
        cancel,
    }
}

/// Run several requests concurrently, results in request order
pub fn run_batch(orchestrator: &Orchestrator, requests: &[RunRequest]) -> Vec<RunResult> {
    requests
        .par_iter()
        .map(|request| orchestrator.run(request))
        .collect()
}
