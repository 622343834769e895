// src/session/mod.rs

//! Mount session
//!
//! One `MountSession` owns one mounted image (path + index) from the moment
//! its leases are acquired until it is closed.
//!
//! # State machine
//!
//! ```text
//! Unmounted ──mount()──► Mounting ──native ok + verified──► Mounted
//!                           │                                 │
//!                           └── failure (cleanup, logged) ──► Closed
//!
//! Mounted ──commit()──► Committing ──► Closed
//! Mounted ──discard()─► Discarding ──► Closed
//! ```
//!
//! Hive leases are side leases of a `Mounted` session, not state changes.
//!
//! # Resources held
//!
//! Base scope (released last, in reverse):
//! 1. image lease (in-process) carrying the cross-process [`ImageLock`]
//! 2. mount directory lease; its release removes the owner record and the
//!    (empty) mount directory
//!
//! Hive scope: one lease per loaded hive, whose release unloads the hive.
//! Closing the session releases the hive scope before the native unmount.

mod hive;
mod owner;
mod recovery;

pub use hive::{HiveLease, HiveName};
pub use owner::{OwnerRecord, process_alive};
pub use recovery::{RecoveryOutcome, recover_stale_mounts};

use crate::config::EngineConfig;
use crate::image::ImageReference;
use crate::lease::{
    AcquirePolicy, ImageLock, ReleaseStatus, ResourceKey, ResourceScopeManager, ScopeStack,
};
use crate::native::{self, NativeBackend, RetryPolicy};
use crate::{Error, Result};
use chrono::Utc;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Mount session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub enum SessionState {
    Unmounted,
    Mounting,
    Mounted,
    Committing,
    Discarding,
    Closed,
}

/// Terminal result of a session, returned again by repeated close calls
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Committed,
    Discarded,
    /// Commit failed; a discard was attempted in its place
    CommitFailed { error: String },
    /// Native discard failed; resources were released anyway
    DiscardFailed { error: String },
    /// The session never reached `Mounted`
    MountFailed { error: String },
}

/// Everything a session needs from its surroundings
#[derive(Clone)]
pub struct SessionContext {
    pub backend: NativeBackend,
    pub leases: ResourceScopeManager,
    pub retry: RetryPolicy,
    pub acquire: AcquirePolicy,
    pub mount_root: PathBuf,
    pub owner_dir: PathBuf,
    pub lock_dir: PathBuf,
    /// Top-level entries a mounted image must contain
    pub expected_entries: Vec<String>,
}

impl SessionContext {
    pub fn from_config(
        config: &EngineConfig,
        backend: NativeBackend,
        leases: ResourceScopeManager,
    ) -> Self {
        Self {
            backend,
            leases,
            retry: config.retry_policy(),
            acquire: config.acquire_policy(),
            mount_root: config.mount_root(),
            owner_dir: config.owner_dir(),
            lock_dir: config.lock_dir(),
            expected_entries: config.native.expected_mount_entries.clone(),
        }
    }
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("backend", &self.backend)
            .field("mount_root", &self.mount_root)
            .finish()
    }
}

#[derive(Default)]
struct HiveScope {
    stack: ScopeStack,
    loaded: Vec<(HiveName, String)>,
}

/// One mounted image
pub struct MountSession {
    run_id: String,
    image: ImageReference,
    mount_dir: PathBuf,
    state: SessionState,
    ctx: SessionContext,
    base: ScopeStack,
    hives: Mutex<HiveScope>,
    outcome: Option<SessionOutcome>,
}

impl MountSession {
    /// Acquire the image and mount directory without mounting
    ///
    /// Fails with `ResourceBusy` if another session (in this or another
    /// process) holds the image. A stale native mount of the same file left
    /// by a dead process is force-discarded here.
    pub fn new(image: ImageReference, run_id: &str, ctx: &SessionContext) -> Result<Self> {
        if !image.path().is_file() {
            return Err(Error::InvalidImage(format!(
                "{} does not exist",
                image.path().display()
            )));
        }
        if !ctx.backend.servicer.supports(image.format()) {
            return Err(native::unsupported(ctx.backend.servicer.as_ref(), image.format()));
        }

        let lease_path = image.lease_path();
        let mut base = ScopeStack::new();

        let mut image_lease =
            ctx.leases
                .acquire(ResourceKey::image(&lease_path), run_id, ctx.acquire)?;
        let lock = ImageLock::acquire(&ctx.lock_dir, &lease_path)?;
        image_lease.on_release(Box::new(move || {
            drop(lock);
            Ok(())
        }));
        base.push(image_lease);

        recovery::discard_stale_image(ctx, &lease_path)?;

        let mount_dir = ctx.mount_root.join(run_id);
        let mut dir_lease = ctx.leases.acquire(
            ResourceKey::mount_dir(&mount_dir),
            run_id,
            AcquirePolicy::FailFast,
        )?;
        prepare_mount_dir(&mount_dir)?;
        {
            let mount_dir = mount_dir.clone();
            let owner_dir = ctx.owner_dir.clone();
            let run_id = run_id.to_string();
            dir_lease.on_release(Box::new(move || {
                OwnerRecord::remove(&owner_dir, &run_id)?;
                remove_mount_dir(&mount_dir)
            }));
        }
        base.push(dir_lease);

        OwnerRecord {
            run_id: run_id.to_string(),
            pid: std::process::id(),
            image_path: lease_path,
            index: image.index(),
            mount_dir: mount_dir.clone(),
            started_at: Utc::now(),
        }
        .save(&ctx.owner_dir)?;

        debug!("Session {} prepared for {} at {}", run_id, image, mount_dir.display());
        Ok(Self {
            run_id: run_id.to_string(),
            image,
            mount_dir,
            state: SessionState::Unmounted,
            ctx: ctx.clone(),
            base,
            hives: Mutex::new(HiveScope::default()),
            outcome: None,
        })
    }

    /// Acquire and mount in one step, returning only a `Mounted` session
    pub fn open(image: ImageReference, run_id: &str, ctx: &SessionContext) -> Result<Self> {
        let mut session = Self::new(image, run_id, ctx)?;
        session.mount()?;
        Ok(session)
    }

    /// Run the native mount and verify the result
    ///
    /// On any failure the session ends `Closed`: a discard is attempted
    /// (its result is logged) and every lease is released.
    pub fn mount(&mut self) -> Result<()> {
        if self.state != SessionState::Unmounted {
            return Err(Error::invalid_state("mount", self.state));
        }
        self.state = SessionState::Mounting;
        info!("Mounting {} at {}", self.image, self.mount_dir.display());

        let servicer = &self.ctx.backend.servicer;
        let result = self
            .ctx
            .retry
            .run("mount", || servicer.mount(&self.image, &self.mount_dir))
            .and_then(|()| verify_mount(&self.mount_dir, &self.ctx.expected_entries));

        match result {
            Ok(()) => {
                self.state = SessionState::Mounted;
                info!("Mounted {} ({})", self.image, self.run_id);
                Ok(())
            }
            Err(e) => {
                warn!("Mount of {} failed: {}", self.image, e);
                match servicer.unmount(&self.mount_dir, false) {
                    Ok(()) => info!("Cleanup discard after failed mount succeeded"),
                    Err(cleanup) => warn!("Cleanup discard after failed mount: {}", cleanup),
                }
                self.close(SessionOutcome::MountFailed {
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn image(&self) -> &ImageReference {
        &self.image
    }

    pub fn mount_dir(&self) -> &Path {
        &self.mount_dir
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn outcome(&self) -> Option<&SessionOutcome> {
        self.outcome.as_ref()
    }

    pub(crate) fn backend(&self) -> &NativeBackend {
        &self.ctx.backend
    }

    fn hive_scope(&self) -> MutexGuard<'_, HiveScope> {
        self.hives.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Temporary `HKLM` key for a hive of this session
    ///
    /// Carries the whole run id, so a UUID run id appears in simple form.
    fn load_key(&self, hive: HiveName) -> String {
        let tag: String = self
            .run_id
            .chars()
            .filter(char::is_ascii_alphanumeric)
            .collect();
        format!("WIMSMITH_{}_{}", tag.to_ascii_uppercase(), hive.key_suffix())
    }

    /// Load an offline hive as a nested lease
    ///
    /// Loading a hive that is already loaded in this session fails with
    /// `HiveAlreadyLoaded`. Native load failures are not retried.
    pub fn open_hive(&self, hive: HiveName) -> Result<HiveLease<'_>> {
        if self.state != SessionState::Mounted {
            return Err(Error::invalid_state("open hive", self.state));
        }

        let mut scope = self.hive_scope();
        if scope.loaded.iter().any(|(h, _)| *h == hive) {
            return Err(Error::HiveAlreadyLoaded(hive.to_string()));
        }

        let backing = hive.backing_path(&self.mount_dir);
        if !backing.is_file() {
            return Err(Error::ResourceUnavailable {
                resource: format!("hive {}", hive),
                reason: format!("{} not found in image", hive.relative_path()),
            });
        }

        let load_key = self.load_key(hive);
        let mut lease = self.ctx.leases.acquire(
            ResourceKey::hive(&load_key),
            &self.run_id,
            AcquirePolicy::FailFast,
        )?;

        let loader = &self.ctx.backend.hives;
        loader
            .load(&load_key, &backing)
            .map_err(|e| Error::ResourceUnavailable {
                resource: format!("hive {}", hive),
                reason: e.to_string(),
            })?;

        {
            let loader = loader.clone();
            let retry = self.ctx.retry;
            let key = load_key.clone();
            lease.on_release(Box::new(move || {
                retry.run("hive unload", || loader.unload(&key))
            }));
        }
        scope.stack.push(lease);
        scope.loaded.push((hive, load_key.clone()));
        debug!("Loaded {} as HKLM\\{}", hive, load_key);

        Ok(HiveLease::new(self, hive, load_key, backing))
    }

    pub(crate) fn hive_loaded(&self, hive: HiveName) -> bool {
        self.hive_scope().loaded.iter().any(|(h, _)| *h == hive)
    }

    /// Hives currently loaded, in load order
    pub fn open_hives(&self) -> Vec<HiveName> {
        self.hive_scope().loaded.iter().map(|(h, _)| *h).collect()
    }

    pub(crate) fn release_hive(&self, hive: HiveName) -> ReleaseStatus {
        let mut scope = self.hive_scope();
        let Some(position) = scope.loaded.iter().position(|(h, _)| *h == hive) else {
            return ReleaseStatus::AlreadyReleased;
        };
        let (_, load_key) = scope.loaded.remove(position);
        let status = scope
            .stack
            .release_key(&ResourceKey::hive(&load_key))
            .unwrap_or(ReleaseStatus::AlreadyReleased);
        debug!("Released hive {} ({:?})", hive, status);
        status
    }

    /// Force-release every outstanding hive lease, newest first
    pub fn release_all_hives(&self) -> Vec<(HiveName, ReleaseStatus)> {
        let mut scope = self.hive_scope();
        let mut released = Vec::new();
        while let Some((hive, load_key)) = scope.loaded.pop() {
            warn!("Force-releasing hive {} still held at scope exit", hive);
            let status = scope
                .stack
                .release_key(&ResourceKey::hive(&load_key))
                .unwrap_or(ReleaseStatus::AlreadyReleased);
            released.push((hive, status));
        }
        released
    }

    /// Enable or disable an optional feature in the mounted image
    pub fn set_feature(&self, feature: &str, enable: bool) -> Result<()> {
        if self.state != SessionState::Mounted {
            return Err(Error::invalid_state("toggle feature", self.state));
        }
        let servicer = &self.ctx.backend.servicer;
        self.ctx.retry.run("feature toggle", || {
            servicer.set_feature(&self.mount_dir, feature, enable)
        })
    }

    /// Save changes into the image and close the session
    ///
    /// Idempotent: a closed session returns its recorded outcome without
    /// touching the native tool. If the commit fails, the mount is
    /// discarded instead and the error is returned.
    pub fn commit(&mut self) -> Result<SessionOutcome> {
        if let Some(outcome) = &self.outcome {
            return Ok(outcome.clone());
        }
        if self.state != SessionState::Mounted {
            return Err(Error::invalid_state("commit", self.state));
        }

        self.release_all_hives();
        self.state = SessionState::Committing;
        info!("Committing {}", self.image);

        let servicer = &self.ctx.backend.servicer;
        match self
            .ctx
            .retry
            .run("commit", || servicer.unmount(&self.mount_dir, true))
        {
            Ok(()) => {
                self.close(SessionOutcome::Committed);
                Ok(SessionOutcome::Committed)
            }
            Err(e) => {
                warn!("Commit of {} failed: {}; discarding instead", self.image, e);
                if let Err(discard) = self
                    .ctx
                    .retry
                    .run("discard", || servicer.unmount(&self.mount_dir, false))
                {
                    warn!("Fallback discard of {} failed: {}", self.image, discard);
                }
                self.close(SessionOutcome::CommitFailed {
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Throw away changes and close the session
    ///
    /// Idempotent like [`commit`](Self::commit). A session that was never
    /// mounted just releases its leases.
    pub fn discard(&mut self) -> Result<SessionOutcome> {
        if let Some(outcome) = &self.outcome {
            return Ok(outcome.clone());
        }
        match self.state {
            SessionState::Unmounted => {
                self.close(SessionOutcome::Discarded);
                return Ok(SessionOutcome::Discarded);
            }
            SessionState::Mounted => {}
            state => return Err(Error::invalid_state("discard", state)),
        }

        self.release_all_hives();
        self.state = SessionState::Discarding;
        info!("Discarding {}", self.image);

        let servicer = &self.ctx.backend.servicer;
        match self
            .ctx
            .retry
            .run("discard", || servicer.unmount(&self.mount_dir, false))
        {
            Ok(()) => {
                self.close(SessionOutcome::Discarded);
                Ok(SessionOutcome::Discarded)
            }
            Err(e) => {
                warn!("Discard of {} failed: {}", self.image, e);
                self.close(SessionOutcome::DiscardFailed {
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    fn close(&mut self, outcome: SessionOutcome) {
        self.release_all_hives();
        for (key, status) in self.base.release_all() {
            if let ReleaseStatus::ReleasedWithError(e) = status {
                warn!("Releasing {} for {}: {}", key, self.run_id, e);
            }
        }
        self.state = SessionState::Closed;
        self.outcome = Some(outcome);
        debug!("Session {} closed", self.run_id);
    }
}

impl Drop for MountSession {
    fn drop(&mut self) {
        match self.state {
            SessionState::Mounted => {
                warn!("Session {} dropped while mounted; discarding", self.run_id);
                if let Err(e) = self.discard() {
                    warn!("Discard on drop failed: {}", e);
                }
            }
            SessionState::Closed => {}
            state => {
                warn!("Session {} dropped in state {}", self.run_id, state);
                self.close(SessionOutcome::Discarded);
            }
        }
    }
}

impl std::fmt::Debug for MountSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountSession")
            .field("run_id", &self.run_id)
            .field("image", &self.image)
            .field("mount_dir", &self.mount_dir)
            .field("state", &self.state)
            .finish()
    }
}

/// Create an empty mount directory, refusing one with leftovers
fn prepare_mount_dir(mount_dir: &Path) -> Result<()> {
    fs::create_dir_all(mount_dir)?;
    if fs::read_dir(mount_dir)?.next().is_some() {
        return Err(Error::ResourceUnavailable {
            resource: mount_dir.display().to_string(),
            reason: "mount directory is not empty".to_string(),
        });
    }
    Ok(())
}

/// Remove the mount directory if the unmount left it empty
fn remove_mount_dir(mount_dir: &Path) -> Result<()> {
    match fs::remove_dir(mount_dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::ResourceUnavailable {
            resource: mount_dir.display().to_string(),
            reason: format!("could not remove mount directory: {}", e),
        }),
    }
}

/// Check a freshly mounted directory actually holds an image
///
/// Some tools report success on malformed images and leave the directory
/// empty, so success is judged by the contents.
pub fn verify_mount(mount_dir: &Path, expected_entries: &[String]) -> Result<()> {
    let names: Vec<String> = fs::read_dir(mount_dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().to_lowercase())
        .collect();

    if names.is_empty() {
        return Err(Error::MountVerification {
            mount_dir: mount_dir.to_path_buf(),
            reason: "mount directory is empty".to_string(),
        });
    }
    for expected in expected_entries {
        if !names.contains(&expected.to_lowercase()) {
            return Err(Error::MountVerification {
                mount_dir: mount_dir.to_path_buf(),
                reason: format!("expected top-level entry '{}' is missing", expected),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NativeOperation;
    use crate::native::{ImageServicer, RegValue, SimulatedBackend, SimulatedImage};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _temp_dir: TempDir,
        sim: Arc<SimulatedBackend>,
        ctx: SessionContext,
        image: ImageReference,
    }

    fn fixture() -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let state = temp_dir.path().join("state");
        let path = temp_dir.path().join("A.wim");
        SimulatedImage::single("Pro", SimulatedImage::windows_skeleton())
            .write(&path)
            .unwrap();

        let sim = Arc::new(SimulatedBackend::new(&state));
        let mut config = EngineConfig::new(&state);
        config.native.retry_backoff_ms = 0;
        let ctx = SessionContext::from_config(
            &config,
            NativeBackend::simulated(sim.clone()),
            ResourceScopeManager::isolated(),
        );
        let image = ImageReference::new(&path, 1, None).unwrap();
        Fixture {
            _temp_dir: temp_dir,
            sim,
            ctx,
            image,
        }
    }

    #[test]
    fn test_mount_commit_is_idempotent() {
        let f = fixture();
        let mut session = MountSession::open(f.image.clone(), "run-1", &f.ctx).unwrap();
        assert_eq!(session.state(), SessionState::Mounted);
        let mount_dir = session.mount_dir().to_path_buf();
        assert!(mount_dir.join("Windows").is_dir());

        assert_eq!(session.commit().unwrap(), SessionOutcome::Committed);
        assert_eq!(session.commit().unwrap(), SessionOutcome::Committed);
        assert_eq!(session.discard().unwrap(), SessionOutcome::Committed);
        assert_eq!(f.sim.call_count(NativeOperation::Commit), 1);
        assert_eq!(f.sim.call_count(NativeOperation::Discard), 0);

        assert_eq!(session.state(), SessionState::Closed);
        assert!(!mount_dir.exists());
        assert!(f.ctx.leases.held().is_empty());
        assert!(OwnerRecord::list(&f.ctx.owner_dir).unwrap().is_empty());
    }

    #[test]
    fn test_second_session_on_same_image_is_busy() {
        let f = fixture();
        let mut first = MountSession::open(f.image.clone(), "run-1", &f.ctx).unwrap();
        let second = MountSession::new(f.image.clone(), "run-2", &f.ctx);
        assert!(matches!(second, Err(Error::ResourceBusy { .. })));

        first.discard().unwrap();
        let mut second = MountSession::open(f.image.clone(), "run-2", &f.ctx).unwrap();
        second.discard().unwrap();
    }

    #[test]
    fn test_spurious_mount_success_closes_session() {
        let f = fixture();
        fs::write(f.image.path(), b"MSWIM\0\0\0corrupt").unwrap();

        let mut session = MountSession::new(f.image.clone(), "run-1", &f.ctx).unwrap();
        let err = session.mount().unwrap_err();
        assert!(matches!(err, Error::MountVerification { .. }));
        assert_eq!(session.state(), SessionState::Closed);
        assert!(matches!(session.outcome(), Some(SessionOutcome::MountFailed { .. })));
        assert!(f.sim.mounted_images().unwrap().is_empty());
        assert!(f.ctx.leases.held().is_empty());
    }

    #[test]
    fn test_transient_mount_failure_is_retried() {
        let f = fixture();
        f.sim.fail_next(NativeOperation::Mount, Some(170));
        let mut session = MountSession::open(f.image.clone(), "run-1", &f.ctx).unwrap();
        assert_eq!(f.sim.call_count(NativeOperation::Mount), 2);
        session.discard().unwrap();
    }

    #[test]
    fn test_hive_double_load_rejected() {
        let f = fixture();
        let mut session = MountSession::open(f.image.clone(), "run-1", &f.ctx).unwrap();
        {
            let hive = session.open_hive(HiveName::Software).unwrap();
            assert!(matches!(
                session.open_hive(HiveName::Software),
                Err(Error::HiveAlreadyLoaded(_))
            ));
            hive.set_value("Policies", "AllowTelemetry", &RegValue::Dword(0))
                .unwrap();
        }
        assert!(session.open_hives().is_empty());
        let again = session.open_hive(HiveName::Software).unwrap();
        assert_eq!(again.release(), ReleaseStatus::Released);
        session.discard().unwrap();
    }

    #[test]
    fn test_hive_load_key_carries_full_run_id() {
        let f = fixture();
        let run_id = "0b6f8c1e-92d4-4a57-b1c3-5e7d9f2a4b60";
        let mut session = MountSession::open(f.image.clone(), run_id, &f.ctx).unwrap();
        {
            let hive = session.open_hive(HiveName::Software).unwrap();
            assert_eq!(
                hive.load_key(),
                "WIMSMITH_0B6F8C1E92D44A57B1C35E7D9F2A4B60_SOFTWARE"
            );
        }
        session.discard().unwrap();
    }

    #[test]
    fn test_commit_force_releases_leaked_hives() {
        let f = fixture();
        let mut session = MountSession::open(f.image.clone(), "run-1", &f.ctx).unwrap();
        let hive = session.open_hive(HiveName::System).unwrap();
        std::mem::forget(hive);

        assert_eq!(session.open_hives(), vec![HiveName::System]);
        session.commit().unwrap();
        assert!(f.sim.loaded_hives().is_empty());
    }

    #[test]
    fn test_unload_failure_still_frees_lease() {
        let f = fixture();
        let mut session = MountSession::open(f.image.clone(), "run-1", &f.ctx).unwrap();
        let hive = session.open_hive(HiveName::Software).unwrap();

        for _ in 0..f.ctx.retry.max_attempts() {
            f.sim.fail_next(NativeOperation::HiveUnload, Some(32));
        }
        assert!(matches!(hive.release(), ReleaseStatus::ReleasedWithError(_)));
        assert!(session.open_hives().is_empty());
        assert!(
            !f.ctx
                .leases
                .held()
                .iter()
                .any(|(k, _)| matches!(k, ResourceKey::Hive(_)))
        );
        session.discard().unwrap();
    }

    #[test]
    fn test_drop_while_mounted_discards() {
        let f = fixture();
        {
            let _session = MountSession::open(f.image.clone(), "run-1", &f.ctx).unwrap();
        }
        assert_eq!(f.sim.call_count(NativeOperation::Discard), 1);
        assert!(f.ctx.leases.held().is_empty());
    }

    #[test]
    fn test_commit_failure_falls_back_to_discard() {
        let f = fixture();
        let mut session = MountSession::open(f.image.clone(), "run-1", &f.ctx).unwrap();
        f.sim.fail_next(NativeOperation::Commit, Some(5));

        assert!(session.commit().is_err());
        assert!(matches!(
            session.commit().unwrap(),
            SessionOutcome::CommitFailed { .. }
        ));
        assert_eq!(f.sim.call_count(NativeOperation::Discard), 1);
    }

    #[test]
    fn test_wait_policy_on_busy_image() {
        let mut f = fixture();
        f.ctx.acquire = AcquirePolicy::Wait(Duration::from_millis(50));
        let mut first = MountSession::open(f.image.clone(), "run-1", &f.ctx).unwrap();
        assert!(matches!(
            MountSession::new(f.image.clone(), "run-2", &f.ctx),
            Err(Error::ResourceBusy { .. })
        ));
        first.discard().unwrap();
    }

    #[test]
    fn test_verify_mount() {
        let temp_dir = TempDir::new().unwrap();
        let expected = vec!["Windows".to_string()];
        assert!(verify_mount(temp_dir.path(), &expected).is_err());

        fs::create_dir(temp_dir.path().join("Users")).unwrap();
        assert!(verify_mount(temp_dir.path(), &expected).is_err());

        fs::create_dir(temp_dir.path().join("WINDOWS")).unwrap();
        assert!(verify_mount(temp_dir.path(), &expected).is_ok());
    }
}
