// src/lease/mod.rs

//! Resource scope manager
//!
//! Every exclusive resource a run touches (the image file, its mount
//! directory, each loaded offline hive) is represented by a [`Lease`].
//! The [`LeaseArbiter`] behind a [`ResourceScopeManager`] is the single
//! authority on who holds what.
//!
//! # Release semantics
//!
//! - `Lease::release()` is idempotent.
//! - A lease may carry a release hook (native unload, unmount cleanup). A
//!   failing hook is logged and the key is freed anyway, so a stuck native
//!   resource cannot deadlock later runs.
//! - Dropping a lease releases it, which covers early returns and unwinds.
//!
//! ```text
//! acquire(key) ──► Lease ──► release() ──► hook() ──► arbiter.release(key)
//!                    │                        │
//!                    └── drop ────────────────┘ (errors logged, key freed)
//! ```

mod lockfile;
mod scope;
mod table;

pub use lockfile::ImageLock;
pub use scope::ScopeStack;
pub use table::ProcessLeaseTable;

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Identity of a leasable resource
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKey {
    /// An image file (all indexes share one key)
    Image(String),
    /// A mount directory
    MountDir(String),
    /// An offline hive load key (`HKLM\<key>`)
    Hive(String),
}

impl ResourceKey {
    pub fn image(path: &Path) -> Self {
        Self::Image(normalize_path(path))
    }

    pub fn mount_dir(path: &Path) -> Self {
        Self::MountDir(normalize_path(path))
    }

    pub fn hive(load_key: &str) -> Self {
        Self::Hive(load_key.to_ascii_uppercase())
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Image(p) => write!(f, "image:{}", p),
            Self::MountDir(p) => write!(f, "mount:{}", p),
            Self::Hive(k) => write!(f, "hive:{}", k),
        }
    }
}

/// Normalized string form of a path for use as a key
///
/// Windows paths compare case-insensitively, so they are folded.
pub(crate) fn normalize_path(path: &Path) -> String {
    let text = path.to_string_lossy().replace('\\', "/");
    if cfg!(windows) {
        text.to_lowercase()
    } else {
        text
    }
}

/// Who holds a lease
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseHolder {
    pub lease_id: Uuid,
    /// Free-form owner label (usually the run id)
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
}

/// How `acquire` behaves when the key is already leased
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AcquirePolicy {
    /// Return `ResourceBusy` immediately
    #[default]
    FailFast,
    /// Block up to the given duration, then return `ResourceBusy`
    Wait(Duration),
}

/// Backend that arbitrates lease ownership
///
/// The default is the in-process [`ProcessLeaseTable`]; a distributed lock
/// service can implement this trait without touching callers.
pub trait LeaseArbiter: Send + Sync {
    /// Claim `key` for `holder` if it is free
    fn try_claim(&self, key: &ResourceKey, holder: &LeaseHolder) -> bool;

    /// Claim `key`, waiting up to `timeout` for the current holder to release
    fn claim_wait(&self, key: &ResourceKey, holder: &LeaseHolder, timeout: Duration) -> bool;

    /// Release `key` if it is held by `lease_id`; returns whether it was
    fn release(&self, key: &ResourceKey, lease_id: Uuid) -> bool;

    /// Current holder of `key`
    fn holder(&self, key: &ResourceKey) -> Option<LeaseHolder>;

    /// Snapshot of all held leases
    fn held(&self) -> Vec<(ResourceKey, LeaseHolder)>;
}

/// Native cleanup attached to a lease
pub type ReleaseHook = Box<dyn FnOnce() -> Result<()> + Send>;

/// What happened when a lease was released
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseStatus {
    /// Key freed, hook (if any) succeeded
    Released,
    /// Was already released; nothing done
    AlreadyReleased,
    /// Key freed, but the hook failed with this message
    ReleasedWithError(String),
}

/// An exclusive claim on a resource
pub struct Lease {
    key: ResourceKey,
    holder: LeaseHolder,
    arbiter: Arc<dyn LeaseArbiter>,
    hook: Option<ReleaseHook>,
    released: bool,
}

impl Lease {
    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    pub fn id(&self) -> Uuid {
        self.holder.lease_id
    }

    pub fn owner(&self) -> &str {
        &self.holder.owner
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Attach the native release action, replacing any previous one
    pub fn on_release(&mut self, hook: ReleaseHook) {
        self.hook = Some(hook);
    }

    /// Detach the release hook without running it
    pub fn disarm(&mut self) -> Option<ReleaseHook> {
        self.hook.take()
    }

    /// Release the lease
    ///
    /// Runs the hook, then frees the key regardless of the hook's result.
    pub fn release(&mut self) -> ReleaseStatus {
        if self.released {
            return ReleaseStatus::AlreadyReleased;
        }
        self.released = true;

        let status = match self.hook.take().map(|hook| hook()) {
            Some(Err(e)) => {
                warn!("Release hook for {} failed: {} (freeing key anyway)", self.key, e);
                ReleaseStatus::ReleasedWithError(e.to_string())
            }
            _ => ReleaseStatus::Released,
        };

        if !self.arbiter.release(&self.key, self.holder.lease_id) {
            warn!("Lease {} for {} was not held at release", self.holder.lease_id, self.key);
        }
        debug!("Released {}", self.key);
        status
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("key", &self.key)
            .field("holder", &self.holder)
            .field("has_hook", &self.hook.is_some())
            .field("released", &self.released)
            .finish()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if !self.released {
            self.release();
        }
    }
}

/// Acquire/release front end over a [`LeaseArbiter`]
#[derive(Clone)]
pub struct ResourceScopeManager {
    arbiter: Arc<dyn LeaseArbiter>,
}

impl ResourceScopeManager {
    pub fn new(arbiter: Arc<dyn LeaseArbiter>) -> Self {
        Self { arbiter }
    }

    /// Manager over the process-wide lease table
    pub fn global() -> Self {
        Self::new(ProcessLeaseTable::global())
    }

    /// Manager over a fresh, private lease table
    pub fn isolated() -> Self {
        Self::new(Arc::new(ProcessLeaseTable::new()))
    }

    /// Acquire an exclusive lease on `key`
    pub fn acquire(&self, key: ResourceKey, owner: &str, policy: AcquirePolicy) -> Result<Lease> {
        let holder = LeaseHolder {
            lease_id: Uuid::new_v4(),
            owner: owner.to_string(),
            acquired_at: Utc::now(),
        };

        let claimed = match policy {
            AcquirePolicy::FailFast => self.arbiter.try_claim(&key, &holder),
            AcquirePolicy::Wait(timeout) => self.arbiter.claim_wait(&key, &holder, timeout),
        };

        if !claimed {
            let current = self
                .arbiter
                .holder(&key)
                .map(|h| h.owner)
                .unwrap_or_else(|| "unknown".to_string());
            debug!("{} is busy (held by {})", key, current);
            return Err(Error::busy(&key));
        }

        debug!("Acquired {} for {}", key, owner);
        Ok(Lease {
            key,
            holder,
            arbiter: Arc::clone(&self.arbiter),
            hook: None,
            released: false,
        })
    }

    /// Run `f` while holding a lease on `key`
    ///
    /// The lease is released on every exit path: normal return, error, and
    /// panic unwind (through `Drop`).
    pub fn scoped<R>(
        &self,
        key: ResourceKey,
        owner: &str,
        policy: AcquirePolicy,
        f: impl FnOnce(&mut Lease) -> Result<R>,
    ) -> Result<R> {
        let mut lease = self.acquire(key, owner, policy)?;
        let result = f(&mut lease);
        lease.release();
        result
    }

    pub fn holder(&self, key: &ResourceKey) -> Option<LeaseHolder> {
        self.arbiter.holder(key)
    }

    pub fn is_held(&self, key: &ResourceKey) -> bool {
        self.arbiter.holder(key).is_some()
    }

    pub fn held(&self) -> Vec<(ResourceKey, LeaseHolder)> {
        self.arbiter.held()
    }
}

impl fmt::Debug for ResourceScopeManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceScopeManager")
            .field("held", &self.arbiter.held().len())
            .finish()
    }
}
