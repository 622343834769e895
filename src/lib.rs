// src/lib.rs

//! wimsmith: offline Windows image customizer
//!
//! Mounts a Windows image (WIM, ESD, VHD, VHDX), runs a prioritized plan of
//! customization modules against it, and either commits the changes or
//! discards them and verifies the image against a pre-run checkpoint.
//!
//! # Architecture
//!
//! - Leases: every image, mount directory and loaded hive is held through
//!   an RAII lease, released in reverse acquisition order on every path
//! - Sessions: one mount per image, with a strict state machine and crash
//!   recovery from owner records
//! - Checkpoints: content hash taken before mounting, re-checked after any
//!   discard
//! - Modules: registered once with a priority, a capability and a
//!   criticality; scheduled deterministically per run
//! - Native layer: DISM and `reg.exe` behind traits, with a simulated
//!   backend for tests and non-Windows hosts

pub mod checkpoint;
pub mod config;
pub mod engine;
mod error;
pub mod hash;
pub mod image;
pub mod lease;
pub mod modules;
pub mod native;
pub mod progress;
pub mod session;

pub use checkpoint::{Checkpoint, CheckpointEntry, CheckpointStatus, CheckpointStore};
pub use config::{BackendKind, EngineConfig};
pub use engine::{
    AbortReason, CancellationToken, EngineState, IntegrityCheck, ModuleContext, ModuleReport,
    ModuleStatus, Orchestrator, RunHandle, RunOutcome, RunRequest, RunResult, run_batch,
    spawn_run,
};
pub use error::{Error, NativeOperation, NativeToolError, Result};
pub use hash::{HashAlgorithm, Hasher};
pub use image::{ImageFormat, ImageReference};
pub use lease::{AcquirePolicy, Lease, ReleaseStatus, ResourceKey, ResourceScopeManager};
pub use modules::{
    Capability, Catalog, CustomizationModule, Enablement, Environment, ModuleDescriptor,
    ModuleError, ModuleOutcome, ModuleRegistry, ScheduledPlan, module_fn,
};
pub use native::{NativeBackend, RegValue, RetryPolicy};
pub use progress::{
    CallbackObserver, ChannelObserver, CollectingObserver, LogObserver, RunEvent, RunEventKind,
    RunObserver, SilentObserver,
};
pub use session::{
    HiveLease, HiveName, MountSession, RecoveryOutcome, SessionContext, SessionOutcome,
    SessionState,
};
