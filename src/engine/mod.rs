// src/engine/mod.rs

//! Orchestration engine
//!
//! Drives one run end to end:
//!
//! ```text
//! Idle -> CheckpointCreated -> SessionOpen -> Running(0..n) -> Finalizing -> Done(outcome)
//! ```
//!
//! - **Checkpoint first**: the image is hashed before it is mounted. If it
//!   cannot be hashed the run is aborted and nothing else happens.
//! - **Sequential modules**: modules of one run execute one after another in
//!   plan order. Hive leases a module leaves open are force-released at the
//!   module boundary.
//! - **Partial failure policy**: a failing non-critical module is recorded
//!   and the run carries on; a failing critical module stops the plan and
//!   the mount is discarded.
//! - **Cancellation**: checked between modules; a cancelled run is
//!   discarded like a critical failure.
//! - **Finalizing**: commit when nothing critical failed and the run was not
//!   cancelled. Otherwise discard and re-hash the image against its
//!   checkpoint; a mismatch is reported, never fatal.
//!
//! [`Orchestrator::run`] always returns a complete [`RunResult`].

mod cancel;
mod context;
mod spawn;

pub use crate::checkpoint::RunOutcome;
pub use cancel::CancellationToken;
pub use context::ModuleContext;
pub use spawn::{RunHandle, run_batch, spawn_run};

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::config::EngineConfig;
use crate::image::{ImageFormat, ImageReference};
use crate::lease::ResourceScopeManager;
use crate::modules::{
    Environment, ModuleDescriptor, ModuleError, ModuleOutcome, ModuleRegistry, ScheduledPlan,
};
use crate::native::NativeBackend;
use crate::progress::{EventSink, LogObserver, RunEventKind, RunObserver};
use crate::session::{MountSession, RecoveryOutcome, SessionContext, recover_stale_mounts};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Engine lifecycle of one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "value", rename_all = "snake_case")]
pub enum EngineState {
    Idle,
    CheckpointCreated,
    SessionOpen,
    /// Running the module at this plan position
    Running(usize),
    Finalizing,
    Done(RunOutcome),
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::CheckpointCreated => write!(f, "checkpoint_created"),
            Self::SessionOpen => write!(f, "session_open"),
            Self::Running(position) => write!(f, "running({})", position),
            Self::Finalizing => write!(f, "finalizing"),
            Self::Done(outcome) => write!(f, "done({})", outcome),
        }
    }
}

/// Per-module result
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ModuleStatus {
    Succeeded,
    Failed { reason: String },
    Skipped { reason: String },
}

impl ModuleStatus {
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped { .. })
    }
}

impl fmt::Display for ModuleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed { reason } => write!(f, "failed: {}", reason),
            Self::Skipped { reason } => write!(f, "skipped: {}", reason),
        }
    }
}

/// Why a run was aborted
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AbortReason {
    /// Bad image reference or unknown module id
    InvalidRequest,
    /// The image could not be hashed
    ChecksumUnavailable,
    /// The checkpoint record could not be written
    CheckpointStore,
    /// Another session holds the image
    ResourceBusy,
    /// Lock file or mount directory could not be set up
    ResourceUnavailable,
    NativeTool,
    MountVerification,
    /// Commit failed; the mount was discarded instead
    CommitFailed,
}

impl AbortReason {
    /// Classify an error from opening the session
    pub fn from_error(err: &Error) -> Self {
        match err {
            Error::ChecksumUnavailable { .. } => Self::ChecksumUnavailable,
            Error::Checkpoint(_) | Error::CheckpointNotFound(_) => Self::CheckpointStore,
            Error::ResourceBusy { .. } => Self::ResourceBusy,
            Error::ResourceUnavailable { .. } | Error::Io(_) => Self::ResourceUnavailable,
            Error::NativeTool(_) => Self::NativeTool,
            Error::MountVerification { .. } => Self::MountVerification,
            _ => Self::InvalidRequest,
        }
    }
}

/// Result of re-hashing the image after a discard
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum IntegrityCheck {
    /// The image was committed, or never mounted
    NotChecked,
    Verified,
    Mismatch { expected: String, actual: String },
    /// The image could not be re-hashed
    Unavailable { reason: String },
}

impl fmt::Display for IntegrityCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotChecked => write!(f, "not checked"),
            Self::Verified => write!(f, "verified"),
            Self::Mismatch { expected, actual } => {
                write!(f, "mismatch (expected {}, found {})", expected, actual)
            }
            Self::Unavailable { reason } => write!(f, "unavailable: {}", reason),
        }
    }
}

/// What to do with one image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRequest {
    pub image_path: PathBuf,
    pub index: u32,
    #[serde(default)]
    pub format: Option<ImageFormat>,
    #[serde(default)]
    pub enabled_module_ids: Vec<String>,
    /// When set, exactly these modules are critical
    #[serde(default)]
    pub critical_override: Option<BTreeSet<String>>,
}

impl RunRequest {
    pub fn new(image_path: impl Into<PathBuf>, index: u32) -> Self {
        Self {
            image_path: image_path.into(),
            index,
            format: None,
            enabled_module_ids: Vec::new(),
            critical_override: None,
        }
    }

    pub fn with_format(mut self, format: ImageFormat) -> Self {
        self.format = Some(format);
        self
    }

    pub fn with_modules<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.enabled_module_ids = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_critical_override<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.critical_override = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    /// Effective criticality of a module in this run
    pub fn is_critical(&self, descriptor: &ModuleDescriptor) -> bool {
        match &self.critical_override {
            Some(ids) => ids.contains(&descriptor.id),
            None => descriptor.critical,
        }
    }
}

/// Outcome of one module in a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleReport {
    pub id: String,
    pub label: String,
    pub critical: bool,
    pub status: ModuleStatus,
    pub elapsed: Duration,
}

/// Everything a caller learns about a finished run
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub run_id: String,
    pub image_path: PathBuf,
    pub index: u32,
    /// Resolved module order
    pub plan: Vec<String>,
    /// Scheduled modules in plan order, then excluded ones
    pub modules: Vec<ModuleReport>,
    pub outcome: RunOutcome,
    pub abort_reason: Option<AbortReason>,
    pub error: Option<String>,
    pub integrity: IntegrityCheck,
    pub elapsed: Duration,
}

impl RunResult {
    pub fn module(&self, id: &str) -> Option<&ModuleReport> {
        self.modules.iter().find(|m| m.id == id)
    }

    pub fn status_of(&self, id: &str) -> Option<&ModuleStatus> {
        self.module(id).map(|m| &m.status)
    }
}

/// Accumulates the result of one run
struct RunRecorder<'a> {
    run_id: &'a str,
    request: &'a RunRequest,
    sink: &'a EventSink<'a>,
    started: Instant,
    plan: Vec<String>,
    planned: Vec<(String, String, bool)>,
    modules: Vec<ModuleReport>,
    excluded: Vec<ModuleReport>,
    integrity: IntegrityCheck,
}

impl<'a> RunRecorder<'a> {
    fn new(run_id: &'a str, request: &'a RunRequest, sink: &'a EventSink<'a>) -> Self {
        Self {
            run_id,
            request,
            sink,
            started: Instant::now(),
            plan: Vec::new(),
            planned: Vec::new(),
            modules: Vec::new(),
            excluded: Vec::new(),
            integrity: IntegrityCheck::NotChecked,
        }
    }

    fn set_state(&self, state: EngineState) {
        debug!("Run {} -> {}", self.run_id, state);
        self.sink.emit(RunEventKind::State { state });
    }

    fn record_plan(&mut self, plan: &ScheduledPlan) {
        self.plan = plan.order().into_iter().map(String::from).collect();
        self.planned = plan
            .modules()
            .iter()
            .map(|d| (d.id.clone(), d.label.clone(), self.request.is_critical(d)))
            .collect();
        self.excluded = plan
            .excluded()
            .iter()
            .map(|e| ModuleReport {
                id: e.descriptor.id.clone(),
                label: e.descriptor.label.clone(),
                critical: self.request.is_critical(&e.descriptor),
                status: ModuleStatus::Skipped {
                    reason: e.reason.clone(),
                },
                elapsed: Duration::ZERO,
            })
            .collect();
        self.sink.emit(RunEventKind::PlanResolved {
            order: self.plan.clone(),
            excluded: self
                .excluded
                .iter()
                .map(|r| (r.id.clone(), r.status.to_string()))
                .collect(),
        });
    }

    fn push(&mut self, report: ModuleReport) {
        self.modules.push(report);
    }

    /// Record a planned module that will not run
    fn skip(&mut self, descriptor: &ModuleDescriptor, reason: &str) {
        let status = ModuleStatus::Skipped {
            reason: reason.to_string(),
        };
        self.sink.emit(RunEventKind::ModuleFinished {
            module_id: descriptor.id.clone(),
            status: status.clone(),
            elapsed: Duration::ZERO,
        });
        self.modules.push(ModuleReport {
            id: descriptor.id.clone(),
            label: descriptor.label.clone(),
            critical: self.request.is_critical(descriptor),
            status,
            elapsed: Duration::ZERO,
        });
    }

    fn abort(mut self, reason: AbortReason, err: &Error) -> RunResult {
        warn!("Run {} aborted ({}): {}", self.run_id, reason, err);
        for (id, label, critical) in std::mem::take(&mut self.planned) {
            self.modules.push(ModuleReport {
                id,
                label,
                critical,
                status: ModuleStatus::Skipped {
                    reason: format!("run aborted: {}", reason),
                },
                elapsed: Duration::ZERO,
            });
        }
        self.finish(RunOutcome::Aborted, Some(reason), Some(err.to_string()))
    }

    fn finish(
        mut self,
        outcome: RunOutcome,
        abort_reason: Option<AbortReason>,
        error: Option<String>,
    ) -> RunResult {
        self.set_state(EngineState::Done(outcome));
        self.sink.emit(RunEventKind::RunFinished {
            outcome,
            abort_reason,
        });
        let elapsed = self.started.elapsed();
        info!("Run {} finished: {} in {:?}", self.run_id, outcome, elapsed);

        let mut modules = std::mem::take(&mut self.modules);
        modules.append(&mut self.excluded);
        RunResult {
            run_id: self.run_id.to_string(),
            image_path: self.request.image_path.clone(),
            index: self.request.index,
            plan: self.plan,
            modules,
            outcome,
            abort_reason,
            error,
            integrity: self.integrity,
            elapsed,
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Runs customization requests against images
#[derive(Clone)]
pub struct Orchestrator {
    registry: Arc<ModuleRegistry>,
    environment: Environment,
    checkpoints: CheckpointStore,
    retention: chrono::Duration,
    sessions: SessionContext,
    observer: Arc<dyn RunObserver>,
}

impl Orchestrator {
    /// Build from config with the configured native backend
    pub fn new(config: &EngineConfig, registry: ModuleRegistry) -> Self {
        Self::with_backend(config, registry, NativeBackend::from_config(config))
    }

    pub fn with_backend(
        config: &EngineConfig,
        registry: ModuleRegistry,
        backend: NativeBackend,
    ) -> Self {
        Self {
            registry: Arc::new(registry),
            environment: Environment::detect(config),
            checkpoints: CheckpointStore::from_config(config),
            retention: config.retention(),
            sessions: SessionContext::from_config(config, backend, ResourceScopeManager::global()),
            observer: Arc::new(LogObserver),
        }
    }

    pub fn with_environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    /// Use a separate lease table instead of the process-wide one
    pub fn with_leases(mut self, leases: ResourceScopeManager) -> Self {
        self.sessions.leases = leases;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn RunObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    pub fn session_context(&self) -> &SessionContext {
        &self.sessions
    }

    /// Resolve the plan a request would run, without touching the image
    pub fn plan(&self, request: &RunRequest) -> Result<ScheduledPlan> {
        self.registry.plan(&request.enabled_module_ids, &self.environment)
    }

    /// Reconcile stale mounts and checkpoints left by dead runs
    ///
    /// Expired checkpoints are pruned before pending ones are reconciled.
    pub fn recover(&self) -> Result<Vec<RecoveryOutcome>> {
        self.prune_checkpoints();
        recover_stale_mounts(&self.sessions, Some(&self.checkpoints))
    }

    pub fn run(&self, request: &RunRequest) -> RunResult {
        self.run_with_cancel(request, &CancellationToken::new())
    }

    pub fn run_with_cancel(&self, request: &RunRequest, cancel: &CancellationToken) -> RunResult {
        self.execute(request, cancel, None)
    }

    pub(crate) fn execute(
        &self,
        request: &RunRequest,
        cancel: &CancellationToken,
        extra: Option<&dyn RunObserver>,
    ) -> RunResult {
        let run_id = Uuid::new_v4().to_string();
        let mut observers: Vec<&dyn RunObserver> = vec![self.observer.as_ref()];
        observers.extend(extra);
        let sink = EventSink::new(&run_id, observers);
        let mut run = RunRecorder::new(&run_id, request, &sink);

        sink.emit(RunEventKind::RunStarted {
            image: format!("{}:{}", request.image_path.display(), request.index),
        });
        run.set_state(EngineState::Idle);

        let image = match ImageReference::new(&request.image_path, request.index, request.format)
        {
            Ok(image) => image,
            Err(e) => return run.abort(AbortReason::InvalidRequest, &e),
        };
        let plan = match self.plan(request) {
            Ok(plan) => plan,
            Err(e) => return run.abort(AbortReason::InvalidRequest, &e),
        };
        run.record_plan(&plan);

        let checkpoint = match self.checkpoints.create(&image, &run_id) {
            Ok(checkpoint) => checkpoint,
            Err(e) => {
                let reason = match e {
                    Error::ChecksumUnavailable { .. } => AbortReason::ChecksumUnavailable,
                    _ => AbortReason::CheckpointStore,
                };
                return run.abort(reason, &e);
            }
        };
        run.set_state(EngineState::CheckpointCreated);

        let session = MountSession::new(image, &run_id, &self.sessions).and_then(|mut session| {
            session.mount()?;
            Ok(session)
        });
        let mut session = match session {
            Ok(session) => session,
            Err(e) => {
                self.finalize_checkpoint(&run_id, RunOutcome::Aborted);
                return run.abort(AbortReason::from_error(&e), &e);
            }
        };
        run.set_state(EngineState::SessionOpen);

        let total = plan.len();
        let mut stop_reason: Option<String> = None;
        let mut critical_failure = None;
        for (position, descriptor) in plan.modules().iter().enumerate() {
            if let Some(reason) = &stop_reason {
                run.skip(descriptor, reason);
                continue;
            }
            if cancel.is_cancelled() {
                info!("Run {} cancelled before {}", run_id, descriptor.id);
                let reason = "run cancelled".to_string();
                run.skip(descriptor, &reason);
                stop_reason = Some(reason);
                continue;
            }

            run.set_state(EngineState::Running(position));
            let report =
                self.run_module(&session, descriptor, position, total, cancel, &sink, request);
            if report.critical && report.status.is_failed() {
                warn!(
                    "Critical module {} failed; skipping the rest of run {}",
                    descriptor.id, run_id
                );
                stop_reason = Some(format!("critical module {} failed", descriptor.id));
                critical_failure = Some(format!(
                    "critical module {} failed: {}",
                    descriptor.id, report.status
                ));
            }
            run.push(report);
        }

        run.set_state(EngineState::Finalizing);
        let cancelled = cancel.is_cancelled();
        let mut abort_reason = None;
        let mut error = critical_failure.clone();
        let outcome = if critical_failure.is_some() || cancelled {
            info!("Rolling back run {}", run_id);
            if let Err(e) = session.discard() {
                warn!("Discard of run {} failed: {}", run_id, e);
                error = Some(e.to_string());
            }
            run.integrity = self.check_integrity(&checkpoint, &sink);
            RunOutcome::RolledBack
        } else {
            match session.commit() {
                Ok(_) => RunOutcome::Committed,
                Err(e) => {
                    abort_reason = Some(AbortReason::CommitFailed);
                    error = Some(e.to_string());
                    run.integrity = self.check_integrity(&checkpoint, &sink);
                    RunOutcome::Aborted
                }
            }
        };
        drop(session);

        self.finalize_checkpoint(&run_id, outcome);
        run.finish(outcome, abort_reason, error)
    }

    #[allow(clippy::too_many_arguments)]
    fn run_module(
        &self,
        session: &MountSession,
        descriptor: &ModuleDescriptor,
        position: usize,
        total: usize,
        cancel: &CancellationToken,
        sink: &EventSink<'_>,
        request: &RunRequest,
    ) -> ModuleReport {
        sink.emit(RunEventKind::ModuleStarting {
            module_id: descriptor.id.clone(),
            label: descriptor.label.clone(),
            position: position + 1,
            total,
        });
        let started = Instant::now();

        let result = {
            let mut ctx = ModuleContext::new(
                session,
                &descriptor.id,
                sink,
                cancel,
                self.environment.installers(),
            );
            panic::catch_unwind(AssertUnwindSafe(|| descriptor.module.run(&mut ctx)))
                .unwrap_or_else(|payload| Err(ModuleError::Panicked(panic_message(&*payload))))
        };

        let leaked = session.release_all_hives();
        if !leaked.is_empty() {
            debug!("{} left {} hive(s) loaded", descriptor.id, leaked.len());
        }

        let status = match result {
            Ok(ModuleOutcome::Applied) => ModuleStatus::Succeeded,
            Ok(ModuleOutcome::Skipped { reason }) => ModuleStatus::Skipped { reason },
            Err(e) => {
                warn!("Module {} failed: {}", descriptor.id, e);
                ModuleStatus::Failed {
                    reason: e.to_string(),
                }
            }
        };
        let elapsed = started.elapsed();
        sink.emit(RunEventKind::ModuleFinished {
            module_id: descriptor.id.clone(),
            status: status.clone(),
            elapsed,
        });

        ModuleReport {
            id: descriptor.id.clone(),
            label: descriptor.label.clone(),
            critical: request.is_critical(descriptor),
            status,
            elapsed,
        }
    }

    fn check_integrity(&self, checkpoint: &Checkpoint, sink: &EventSink<'_>) -> IntegrityCheck {
        let check = match self.checkpoints.verify_strict(checkpoint) {
            Ok(()) => IntegrityCheck::Verified,
            Err(Error::Integrity {
                expected, actual, ..
            }) => IntegrityCheck::Mismatch { expected, actual },
            Err(e) => IntegrityCheck::Unavailable {
                reason: e.to_string(),
            },
        };
        if check == IntegrityCheck::Verified {
            debug!("Image {} matches its checkpoint", checkpoint.image_path.display());
        } else {
            warn!(
                "Integrity check of {} after discard: {}",
                checkpoint.image_path.display(),
                check
            );
            sink.emit(RunEventKind::IntegrityWarning {
                check: check.clone(),
            });
        }
        check
    }

    fn finalize_checkpoint(&self, run_id: &str, outcome: RunOutcome) {
        if let Err(e) = self.checkpoints.finalize(run_id, outcome) {
            warn!("Could not finalize checkpoint of run {}: {}", run_id, e);
        }
        self.prune_checkpoints();
    }

    fn prune_checkpoints(&self) {
        if let Err(e) = self.checkpoints.prune_expired(self.retention) {
            warn!("Could not prune expired checkpoints: {}", e);
        }
    }
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("modules", &self.registry.len())
            .field("environment", &self.environment)
            .field("checkpoints", &self.checkpoints)
            .field("sessions", &self.sessions)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NativeOperation;
    use crate::config::BackendKind;
    use crate::hash::{HashAlgorithm, hash_file};
    use crate::modules::{Capability, ModuleResult, module_fn};
    use crate::native::{RegValue, SimulatedBackend, SimulatedImage};
    use crate::progress::CollectingObserver;
    use crate::session::HiveName;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct Fixture {
        _temp_dir: TempDir,
        sim: Arc<SimulatedBackend>,
        config: EngineConfig,
        image: PathBuf,
    }

    fn fixture() -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let state = temp_dir.path().join("state");
        let image = temp_dir.path().join("A.wim");
        SimulatedImage::single("Pro", SimulatedImage::windows_skeleton())
            .write(&image)
            .unwrap();
        let mut config = EngineConfig::new(&state).with_backend(BackendKind::Simulated);
        config.native.retry_backoff_ms = 0;
        Fixture {
            sim: Arc::new(SimulatedBackend::new(&state)),
            _temp_dir: temp_dir,
            config,
            image,
        }
    }

    impl Fixture {
        fn orchestrator(&self, registry: ModuleRegistry) -> Orchestrator {
            Orchestrator::with_backend(
                &self.config,
                registry,
                NativeBackend::simulated(self.sim.clone()),
            )
            .with_leases(ResourceScopeManager::isolated())
        }

        fn hash(&self) -> String {
            hash_file(HashAlgorithm::Sha256, &self.image).unwrap().hash
        }
    }

    fn telemetry(ctx: &mut ModuleContext<'_>) -> ModuleResult<ModuleOutcome> {
        let hive = ctx.open_hive(HiveName::Software)?;
        hive.set_value(
            r"Policies\Microsoft\Windows\DataCollection",
            "AllowTelemetry",
            &RegValue::Dword(0),
        )
        .map_err(ModuleError::Hive)?;
        ctx.report_progress(100, "telemetry disabled");
        Ok(ModuleOutcome::Applied)
    }

    fn registry(critical_telemetry: bool) -> ModuleRegistry {
        let mut registry = ModuleRegistry::new();
        registry
            .register(
                ModuleDescriptor::new(
                    "telemetry",
                    "Disable telemetry",
                    10,
                    Capability::Registry,
                    module_fn(telemetry),
                )
                .critical(critical_telemetry),
            )
            .unwrap();
        registry
            .register(ModuleDescriptor::new(
                "steam",
                "Install Steam",
                90,
                Capability::PackageInstall,
                module_fn(|_ctx| Err(ModuleError::other("installer exited with 1603"))),
            ))
            .unwrap();
        registry
    }

    #[test]
    fn test_zero_modules_commits_unchanged_image() {
        let f = fixture();
        let before = f.hash();
        let result = f.orchestrator(registry(false)).run(&RunRequest::new(&f.image, 1));

        assert_eq!(result.outcome, RunOutcome::Committed);
        assert!(result.modules.is_empty());
        assert_eq!(f.hash(), before);
        assert_eq!(f.sim.call_count(NativeOperation::Commit), 1);
    }

    #[test]
    fn test_non_critical_failure_still_commits() {
        let f = fixture();
        let orchestrator = f.orchestrator(registry(false));
        let result =
            orchestrator.run(&RunRequest::new(&f.image, 1).with_modules(["steam", "telemetry"]));

        assert_eq!(result.outcome, RunOutcome::Committed);
        assert_eq!(result.plan, vec!["telemetry", "steam"]);
        assert_eq!(result.status_of("telemetry"), Some(&ModuleStatus::Succeeded));
        assert!(result.status_of("steam").unwrap().is_failed());
        assert!(orchestrator.checkpoints().pending().unwrap().is_empty());
    }

    #[test]
    fn test_critical_failure_rolls_back() {
        let f = fixture();
        let mut registry = ModuleRegistry::new();
        registry
            .register(
                ModuleDescriptor::new(
                    "telemetry",
                    "Disable telemetry",
                    10,
                    Capability::Registry,
                    module_fn(|_ctx| Err(ModuleError::other("policy key is protected"))),
                )
                .critical(true),
            )
            .unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        registry
            .register(ModuleDescriptor::new(
                "steam",
                "Install Steam",
                90,
                Capability::PackageInstall,
                module_fn(move |_ctx| {
                    counter.fetch_add(1, Ordering::Relaxed);
                    Ok(ModuleOutcome::Applied)
                }),
            ))
            .unwrap();

        let before = f.hash();
        let result = f
            .orchestrator(registry)
            .run(&RunRequest::new(&f.image, 1).with_modules(["telemetry", "steam"]));

        assert_eq!(result.outcome, RunOutcome::RolledBack);
        assert!(result.status_of("steam").unwrap().is_skipped());
        assert_eq!(ran.load(Ordering::Relaxed), 0);
        assert_eq!(result.integrity, IntegrityCheck::Verified);
        assert_eq!(f.hash(), before);
    }

    #[test]
    fn test_critical_override_replaces_declared_criticality() {
        let f = fixture();
        let result = f.orchestrator(registry(false)).run(
            &RunRequest::new(&f.image, 1)
                .with_modules(["telemetry", "steam"])
                .with_critical_override(["steam"]),
        );
        assert_eq!(result.outcome, RunOutcome::RolledBack);
        assert!(result.module("steam").unwrap().critical);
        assert!(!result.module("telemetry").unwrap().critical);
    }

    #[test]
    fn test_cancel_before_first_module() {
        let f = fixture();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = f.orchestrator(registry(false)).run_with_cancel(
            &RunRequest::new(&f.image, 1).with_modules(["telemetry"]),
            &cancel,
        );
        assert_eq!(result.outcome, RunOutcome::RolledBack);
        assert_eq!(
            result.status_of("telemetry"),
            Some(&ModuleStatus::Skipped {
                reason: "run cancelled".to_string()
            })
        );
        assert_eq!(f.sim.call_count(NativeOperation::Discard), 1);
    }

    #[test]
    fn test_cancel_from_module_stops_the_plan() {
        let f = fixture();
        let mut registry = ModuleRegistry::new();
        registry
            .register(ModuleDescriptor::new(
                "first",
                "First",
                1,
                Capability::FileSystem,
                module_fn(|ctx| {
                    ctx.cancellation().cancel();
                    Ok(ModuleOutcome::Applied)
                }),
            ))
            .unwrap();
        registry
            .register(ModuleDescriptor::new(
                "second",
                "Second",
                2,
                Capability::FileSystem,
                module_fn(|_ctx| Ok(ModuleOutcome::Applied)),
            ))
            .unwrap();

        let result = f
            .orchestrator(registry)
            .run(&RunRequest::new(&f.image, 1).with_modules(["first", "second"]));
        assert_eq!(result.outcome, RunOutcome::RolledBack);
        assert_eq!(result.status_of("first"), Some(&ModuleStatus::Succeeded));
        assert!(result.status_of("second").unwrap().is_skipped());
    }

    #[test]
    fn test_unknown_module_aborts_before_checkpoint() {
        let f = fixture();
        let orchestrator = f.orchestrator(registry(false));
        let result = orchestrator.run(&RunRequest::new(&f.image, 1).with_modules(["bloat"]));
        assert_eq!(result.outcome, RunOutcome::Aborted);
        assert_eq!(result.abort_reason, Some(AbortReason::InvalidRequest));
        assert!(orchestrator.checkpoints().list().unwrap().is_empty());
        assert_eq!(f.sim.call_count(NativeOperation::Mount), 0);
    }

    #[test]
    fn test_corrupted_image_aborts_without_pending_checkpoint() {
        let f = fixture();
        std::fs::write(&f.image, b"MSWIM\0\0\0garbage").unwrap();
        let orchestrator = f.orchestrator(registry(false));
        let result = orchestrator.run(&RunRequest::new(&f.image, 1).with_modules(["telemetry"]));

        assert_eq!(result.outcome, RunOutcome::Aborted);
        assert_eq!(result.abort_reason, Some(AbortReason::MountVerification));
        assert!(result.status_of("telemetry").unwrap().is_skipped());
        assert!(orchestrator.checkpoints().pending().unwrap().is_empty());
        assert_eq!(orchestrator.checkpoints().list().unwrap().len(), 1);
    }

    #[test]
    fn test_commit_failure_aborts_and_verifies() {
        let f = fixture();
        f.sim.fail_next(NativeOperation::Commit, Some(5));
        let result = f
            .orchestrator(registry(false))
            .run(&RunRequest::new(&f.image, 1).with_modules(["telemetry"]));
        assert_eq!(result.outcome, RunOutcome::Aborted);
        assert_eq!(result.abort_reason, Some(AbortReason::CommitFailed));
        assert_eq!(result.integrity, IntegrityCheck::Verified);
    }

    #[test]
    fn test_panicking_module_is_a_failure() {
        let f = fixture();
        let mut registry = ModuleRegistry::new();
        registry
            .register(ModuleDescriptor::new(
                "boom",
                "Boom",
                1,
                Capability::FileSystem,
                module_fn(|_ctx| panic!("module bug")),
            ))
            .unwrap();
        let result = f
            .orchestrator(registry)
            .run(&RunRequest::new(&f.image, 1).with_modules(["boom"]));
        assert_eq!(result.outcome, RunOutcome::Committed);
        assert_eq!(
            result.status_of("boom"),
            Some(&ModuleStatus::Failed {
                reason: "module panicked: module bug".to_string()
            })
        );
    }

    #[test]
    fn test_leaked_hive_released_at_module_boundary() {
        let f = fixture();
        let mut registry = ModuleRegistry::new();
        registry
            .register(ModuleDescriptor::new(
                "leaky",
                "Leaky",
                1,
                Capability::Registry,
                module_fn(|ctx| {
                    std::mem::forget(ctx.open_hive(HiveName::System)?);
                    Ok(ModuleOutcome::Applied)
                }),
            ))
            .unwrap();
        registry
            .register(ModuleDescriptor::new(
                "next",
                "Next",
                2,
                Capability::Registry,
                module_fn(|ctx| {
                    ctx.open_hive(HiveName::System)?;
                    Ok(ModuleOutcome::Applied)
                }),
            ))
            .unwrap();
        let result = f
            .orchestrator(registry)
            .run(&RunRequest::new(&f.image, 1).with_modules(["leaky", "next"]));
        assert_eq!(result.status_of("next"), Some(&ModuleStatus::Succeeded));
        assert!(f.sim.loaded_hives().is_empty());
    }

    #[test]
    fn test_events_follow_state_machine() {
        let f = fixture();
        let observer = Arc::new(CollectingObserver::new());
        let orchestrator = f.orchestrator(registry(false)).with_observer(observer.clone());
        orchestrator.run(&RunRequest::new(&f.image, 1).with_modules(["telemetry"]));

        let states: Vec<EngineState> = observer
            .kinds()
            .into_iter()
            .filter_map(|k| match k {
                RunEventKind::State { state } => Some(state),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![
                EngineState::Idle,
                EngineState::CheckpointCreated,
                EngineState::SessionOpen,
                EngineState::Running(0),
                EngineState::Finalizing,
                EngineState::Done(RunOutcome::Committed),
            ]
        );
        assert!(observer.kinds().iter().any(|k| matches!(
            k,
            RunEventKind::Progress { percent: 100, .. }
        )));
    }

    #[test]
    fn test_excluded_module_reported_as_skipped() {
        let f = fixture();
        let orchestrator = f
            .orchestrator(registry(false))
            .with_environment(Environment::with_capabilities([Capability::Registry]));
        let result =
            orchestrator.run(&RunRequest::new(&f.image, 1).with_modules(["telemetry", "steam"]));
        assert_eq!(result.outcome, RunOutcome::Committed);
        assert_eq!(result.plan, vec!["telemetry"]);
        assert!(result.status_of("steam").unwrap().is_skipped());
    }
}
