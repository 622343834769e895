// src/session/recovery.rs

//! Stale mount recovery
//!
//! Run at startup, before any new session. The native tool's list of
//! mounted images is reconciled against owner records:
//!
//! | Mount | Owner record | Action |
//! |-------|--------------|--------|
//! | any | live process | leave alone |
//! | under our mount root | dead process or none | force discard |
//! | elsewhere | none | leave alone (not ours) |
//! | none | dead process | remove record and empty mount dir |
//!
//! Pending checkpoints of runs that are no longer alive are verified and
//! marked abandoned. Finally the native cleanup command is run.

use super::owner::{OwnerRecord, process_alive};
use super::{SessionContext, remove_mount_dir};
use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::lease::{ResourceKey, normalize_path};
use crate::native::MountedImageInfo;
use crate::{Error, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// What recovery did for one item
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// A stale mount was force-discarded
    Discarded {
        mount_dir: PathBuf,
        image_path: PathBuf,
        run_id: Option<String>,
    },
    /// The mount belongs to a live session
    LiveOwner {
        mount_dir: PathBuf,
        run_id: String,
        pid: u32,
    },
    /// A mount outside our mount root with no owner record
    Foreign { mount_dir: PathBuf, image_path: PathBuf },
    /// A stale mount could not be discarded
    Failed { mount_dir: PathBuf, error: String },
    /// Owner record of a dead run with nothing mounted
    OwnerRecordRemoved { run_id: String },
    /// Pending checkpoint of a dead run
    CheckpointAbandoned { run_id: String, verified: bool },
}

fn canonical_key(path: &Path) -> String {
    normalize_path(&path.canonicalize().unwrap_or_else(|_| path.to_path_buf()))
}

fn owner_alive(ctx: &SessionContext, owner: &OwnerRecord) -> bool {
    if owner.pid == std::process::id() {
        // Our own process: alive only if a session here still holds the dir
        return ctx.leases.is_held(&ResourceKey::mount_dir(&owner.mount_dir));
    }
    process_alive(owner.pid)
}

fn is_under(path: &Path, root: &Path) -> bool {
    let path = canonical_key(path);
    let root = canonical_key(root);
    path.starts_with(&format!("{}/", root.trim_end_matches('/')))
}

fn force_discard(ctx: &SessionContext, mount: &MountedImageInfo) -> Result<()> {
    let servicer = &ctx.backend.servicer;
    ctx.retry.run("stale discard", || servicer.unmount(&mount.mount_dir, false))?;
    remove_mount_dir(&mount.mount_dir)
}

/// Reconcile native mount state with owner records and checkpoints
pub fn recover_stale_mounts(
    ctx: &SessionContext,
    checkpoints: Option<&CheckpointStore>,
) -> Result<Vec<RecoveryOutcome>> {
    let mounts = ctx.backend.servicer.mounted_images()?;
    let owners = OwnerRecord::list(&ctx.owner_dir)?;
    let mut outcomes = Vec::new();
    let mut live_runs = HashSet::new();
    let mut handled_runs = HashSet::new();

    for mount in &mounts {
        let dir_key = canonical_key(&mount.mount_dir);
        let owner = owners
            .iter()
            .find(|o| canonical_key(&o.mount_dir) == dir_key);

        if let Some(owner) = owner {
            handled_runs.insert(owner.run_id.clone());
            if owner_alive(ctx, owner) {
                live_runs.insert(owner.run_id.clone());
                outcomes.push(RecoveryOutcome::LiveOwner {
                    mount_dir: mount.mount_dir.clone(),
                    run_id: owner.run_id.clone(),
                    pid: owner.pid,
                });
                continue;
            }
        } else if !is_under(&mount.mount_dir, &ctx.mount_root) {
            outcomes.push(RecoveryOutcome::Foreign {
                mount_dir: mount.mount_dir.clone(),
                image_path: mount.image_path.clone(),
            });
            continue;
        }

        let run_id = owner.map(|o| o.run_id.clone());
        info!(
            "Discarding stale mount of {} at {} (run {})",
            mount.image_path.display(),
            mount.mount_dir.display(),
            run_id.as_deref().unwrap_or("unknown")
        );
        match force_discard(ctx, mount) {
            Ok(()) => {
                if let Some(run_id) = &run_id {
                    OwnerRecord::remove(&ctx.owner_dir, run_id)?;
                }
                outcomes.push(RecoveryOutcome::Discarded {
                    mount_dir: mount.mount_dir.clone(),
                    image_path: mount.image_path.clone(),
                    run_id,
                });
            }
            Err(e) => {
                warn!("Could not discard stale mount {}: {}", mount.mount_dir.display(), e);
                outcomes.push(RecoveryOutcome::Failed {
                    mount_dir: mount.mount_dir.clone(),
                    error: e.to_string(),
                });
            }
        }
    }

    for owner in &owners {
        if handled_runs.contains(&owner.run_id) {
            continue;
        }
        if owner_alive(ctx, owner) {
            live_runs.insert(owner.run_id.clone());
            continue;
        }
        if let Err(e) = remove_mount_dir(&owner.mount_dir) {
            warn!("Leaving mount directory of run {}: {}", owner.run_id, e);
        }
        OwnerRecord::remove(&ctx.owner_dir, &owner.run_id)?;
        outcomes.push(RecoveryOutcome::OwnerRecordRemoved {
            run_id: owner.run_id.clone(),
        });
    }

    if let Some(store) = checkpoints {
        for entry in store.pending()? {
            let run_id = entry.checkpoint.run_id.clone();
            if live_runs.contains(&run_id) || held_in_process(ctx, &run_id) {
                continue;
            }
            if checkpoint_owner_alive(&entry.checkpoint) {
                debug!(
                    "Checkpoint {} belongs to live process {:?}; leaving it pending",
                    run_id, entry.checkpoint.pid
                );
                continue;
            }
            let verified = match store.verify(&entry.checkpoint) {
                Ok(matches) => matches,
                Err(e) => {
                    warn!("Cannot verify checkpoint {}: {}", run_id, e);
                    false
                }
            };
            if !verified {
                warn!(
                    "Image {} no longer matches checkpoint {}",
                    entry.checkpoint.image_path.display(),
                    run_id
                );
            }
            store.abandon(&run_id, "run did not finish; recovered at startup")?;
            outcomes.push(RecoveryOutcome::CheckpointAbandoned { run_id, verified });
        }
    }

    if let Err(e) = ctx.backend.servicer.cleanup() {
        warn!("Native mount cleanup failed: {}", e);
    }

    info!("Recovery finished: {} actions", outcomes.len());
    Ok(outcomes)
}

/// Whether the process that created a pending checkpoint is still running
///
/// A run of this process always finalizes its own checkpoint, and one in
/// another process may not have written its owner record yet.
fn checkpoint_owner_alive(checkpoint: &Checkpoint) -> bool {
    match checkpoint.pid {
        Some(pid) if pid == std::process::id() => true,
        Some(pid) => process_alive(pid),
        None => false,
    }
}

/// Whether a run of this process still holds any lease
fn held_in_process(ctx: &SessionContext, run_id: &str) -> bool {
    ctx.leases.held().iter().any(|(_, holder)| holder.owner == run_id)
}

/// Force-discard a stale native mount of `image_path` before a new session
///
/// The caller holds the image lease and lock, so no live session can own
/// such a mount.
pub(super) fn discard_stale_image(ctx: &SessionContext, image_path: &Path) -> Result<()> {
    let mounts = match ctx.backend.servicer.mounted_images() {
        Ok(mounts) => mounts,
        Err(e) => {
            warn!("Cannot list mounted images: {}", e);
            return Ok(());
        }
    };

    let image_key = canonical_key(image_path);
    for mount in mounts
        .iter()
        .filter(|m| canonical_key(&m.image_path) == image_key)
    {
        warn!(
            "{} is still mounted at {}; discarding stale mount",
            image_path.display(),
            mount.mount_dir.display()
        );
        force_discard(ctx, mount).map_err(|e| Error::ResourceUnavailable {
            resource: image_path.display().to_string(),
            reason: format!(
                "stale mount at {} could not be discarded: {}",
                mount.mount_dir.display(),
                e
            ),
        })?;
    }
    Ok(())
}
