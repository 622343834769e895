// src/checkpoint/mod.rs

//! Checkpoint store
//!
//! A checkpoint is the content hash and size of an image file taken before
//! it is mounted. After a discard the file is re-hashed and compared, which
//! catches native side effects that leaked through despite the discard.
//!
//! Each run gets one record file, `<run_id>.ckpt`, written append-only with
//! one CRC-framed line per event:
//!
//! ```text
//! 3a1f09c2|{"type":"Created","checkpoint":{...}}
//! 9b04d7e1|{"type":"Finalized","outcome":"committed","at":"..."}
//! ```
//!
//! The first line is the checkpoint itself and is never rewritten. Lines
//! after the first CRC mismatch are ignored.

use crate::config::EngineConfig;
use crate::hash::{HashAlgorithm, hash_file};
use crate::image::ImageReference;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const RECORD_EXTENSION: &str = "ckpt";

/// Overall outcome of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RunOutcome {
    /// Changes were saved into the image
    Committed,
    /// The mount was discarded after a critical failure or cancellation
    RolledBack,
    /// The run stopped before or during mounting, or commit failed
    Aborted,
}

/// Baseline of an image file before a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: String,
    pub image_path: PathBuf,
    pub index: u32,
    pub algorithm: HashAlgorithm,
    pub hash: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    /// Process that ran the checkpointed run; absent in older records
    #[serde(default)]
    pub pid: Option<u32>,
}

/// Lifecycle of a checkpoint record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckpointStatus {
    /// Run in progress (or crashed)
    Pending,
    /// Run finished with this outcome
    Finalized {
        outcome: RunOutcome,
        at: DateTime<Utc>,
    },
    /// Cleaned up by crash recovery
    Abandoned { reason: String, at: DateTime<Utc> },
}

impl CheckpointStatus {
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
enum CheckpointRecord {
    Created { checkpoint: Checkpoint },
    Finalized { outcome: RunOutcome, at: DateTime<Utc> },
    Abandoned { reason: String, at: DateTime<Utc> },
}

/// A checkpoint with its current status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointEntry {
    pub checkpoint: Checkpoint,
    pub status: CheckpointStatus,
}

/// Directory of checkpoint record files
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
    algorithm: HashAlgorithm,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>, algorithm: HashAlgorithm) -> Self {
        Self {
            dir: dir.into(),
            algorithm,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.checkpoint_dir(), config.hash_algorithm)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", run_id, RECORD_EXTENSION))
    }

    /// Hash the image and record the checkpoint
    ///
    /// Hashing happens before anything is written, so a missing or
    /// unreadable image leaves no record behind.
    pub fn create(&self, image: &ImageReference, run_id: &str) -> Result<Checkpoint> {
        self.create_as(image, run_id, std::process::id())
    }

    /// Record a checkpoint for a run owned by process `pid`
    ///
    /// Crash recovery leaves pending checkpoints of live processes alone.
    pub fn create_as(&self, image: &ImageReference, run_id: &str, pid: u32) -> Result<Checkpoint> {
        let digest = hash_file(self.algorithm, image.path()).map_err(|source| {
            Error::ChecksumUnavailable {
                path: image.path().to_path_buf(),
                source,
            }
        })?;

        let checkpoint = Checkpoint {
            run_id: run_id.to_string(),
            image_path: image.path().to_path_buf(),
            index: image.index(),
            algorithm: digest.algorithm,
            hash: digest.hash,
            size: digest.size,
            created_at: Utc::now(),
            pid: Some(pid),
        };

        fs::create_dir_all(&self.dir)?;
        let path = self.record_path(run_id);
        let mut file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)
            .map_err(|e| {
                if e.kind() == ErrorKind::AlreadyExists {
                    Error::Checkpoint(format!("checkpoint for run {} already exists", run_id))
                } else {
                    e.into()
                }
            })?;
        write_record(
            &mut file,
            &CheckpointRecord::Created {
                checkpoint: checkpoint.clone(),
            },
        )?;

        info!(
            "Checkpoint {} for {}: {} {} ({} bytes)",
            run_id,
            image,
            checkpoint.algorithm,
            checkpoint.hash,
            checkpoint.size
        );
        Ok(checkpoint)
    }

    /// Re-hash the image and compare against the checkpoint
    pub fn verify(&self, checkpoint: &Checkpoint) -> Result<bool> {
        Ok(self.current_hash(checkpoint)? == checkpoint.hash)
    }

    /// Like [`verify`](Self::verify), but a mismatch is an `Integrity` error
    pub fn verify_strict(&self, checkpoint: &Checkpoint) -> Result<()> {
        let actual = self.current_hash(checkpoint)?;
        if actual != checkpoint.hash {
            return Err(Error::Integrity {
                path: checkpoint.image_path.clone(),
                expected: checkpoint.hash.clone(),
                actual,
            });
        }
        Ok(())
    }

    fn current_hash(&self, checkpoint: &Checkpoint) -> Result<String> {
        let digest = hash_file(checkpoint.algorithm, &checkpoint.image_path).map_err(|source| {
            Error::ChecksumUnavailable {
                path: checkpoint.image_path.clone(),
                source,
            }
        })?;
        debug!(
            "Verify {}: recorded {}, current {}",
            checkpoint.run_id, checkpoint.hash, digest.hash
        );
        Ok(digest.hash)
    }

    /// Record the run's outcome
    pub fn finalize(&self, run_id: &str, outcome: RunOutcome) -> Result<()> {
        self.append(
            run_id,
            CheckpointRecord::Finalized {
                outcome,
                at: Utc::now(),
            },
        )
    }

    /// Mark a pending checkpoint whose run died as abandoned
    pub fn abandon(&self, run_id: &str, reason: &str) -> Result<()> {
        self.append(
            run_id,
            CheckpointRecord::Abandoned {
                reason: reason.to_string(),
                at: Utc::now(),
            },
        )
    }

    fn append(&self, run_id: &str, record: CheckpointRecord) -> Result<()> {
        let entry = self.load(run_id)?;
        if !entry.status.is_pending() {
            return Err(Error::invalid_state("update checkpoint", &entry.status));
        }
        let mut file = OpenOptions::new()
            .append(true)
            .open(self.record_path(run_id))?;
        write_record(&mut file, &record)
    }

    /// Load one checkpoint and its status
    pub fn load(&self, run_id: &str) -> Result<CheckpointEntry> {
        let path = self.record_path(run_id);
        match File::open(&path) {
            Ok(file) => read_entry(&path, file),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(Error::CheckpointNotFound(run_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// All readable checkpoints, oldest first
    pub fn list(&self) -> Result<Vec<CheckpointEntry>> {
        let read_dir = match fs::read_dir(&self.dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        for dir_entry in read_dir {
            let path = dir_entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            match File::open(&path).map_err(Error::from).and_then(|f| read_entry(&path, f)) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!("Skipping unreadable checkpoint {}: {}", path.display(), e),
            }
        }
        entries.sort_by(|a, b| {
            a.checkpoint
                .created_at
                .cmp(&b.checkpoint.created_at)
                .then_with(|| a.checkpoint.run_id.cmp(&b.checkpoint.run_id))
        });
        Ok(entries)
    }

    /// Checkpoints whose run never finished
    pub fn pending(&self) -> Result<Vec<CheckpointEntry>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|e| e.status.is_pending())
            .collect())
    }

    /// Remove finished checkpoints created before `older_than`
    ///
    /// Pending checkpoints are kept: they belong to a live run or to one
    /// crash recovery has yet to reconcile.
    pub fn prune(&self, older_than: DateTime<Utc>) -> Result<Vec<String>> {
        let mut removed = Vec::new();
        for entry in self.list()? {
            if entry.status.is_pending() || entry.checkpoint.created_at >= older_than {
                continue;
            }
            let run_id = entry.checkpoint.run_id;
            fs::remove_file(self.record_path(&run_id))?;
            debug!("Pruned checkpoint {}", run_id);
            removed.push(run_id);
        }
        if !removed.is_empty() {
            info!("Pruned {} expired checkpoints", removed.len());
        }
        Ok(removed)
    }

    /// Prune with a retention window measured from now
    pub fn prune_expired(&self, retention: chrono::Duration) -> Result<Vec<String>> {
        self.prune(Utc::now() - retention)
    }
}

fn write_record(file: &mut File, record: &CheckpointRecord) -> Result<()> {
    let json = serde_json::to_string(record)?;
    let crc = crc32fast::hash(json.as_bytes());
    writeln!(file, "{:08x}|{}", crc, json)?;
    file.flush()?;
    file.sync_all()?;
    Ok(())
}

fn read_entry(path: &Path, file: File) -> Result<CheckpointEntry> {
    let mut checkpoint = None;
    let mut status = CheckpointStatus::Pending;

    for (line_num, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        let Some((crc_hex, json)) = line.split_once('|') else {
            warn!("Malformed checkpoint line {} in {}", line_num + 1, path.display());
            break;
        };
        let crc_ok = u32::from_str_radix(crc_hex, 16)
            .is_ok_and(|expected| expected == crc32fast::hash(json.as_bytes()));
        if !crc_ok {
            warn!("CRC mismatch at line {} in {}", line_num + 1, path.display());
            break;
        }

        let record: CheckpointRecord = serde_json::from_str(json)?;
        match record {
            CheckpointRecord::Created { checkpoint: c } if checkpoint.is_none() => {
                checkpoint = Some(c)
            }
            CheckpointRecord::Created { .. } => {
                warn!("Duplicate checkpoint header in {}", path.display());
            }
            CheckpointRecord::Finalized { outcome, at } => {
                status = CheckpointStatus::Finalized { outcome, at }
            }
            CheckpointRecord::Abandoned { reason, at } => {
                status = CheckpointStatus::Abandoned { reason, at }
            }
        }
    }

    let checkpoint = checkpoint.ok_or_else(|| {
        Error::Checkpoint(format!("{} has no checkpoint header", path.display()))
    })?;
    Ok(CheckpointEntry { checkpoint, status })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, CheckpointStore, ImageReference) {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("A.wim");
        fs::write(&path, b"image contents").unwrap();
        let image = ImageReference::new(&path, 1, None).unwrap();
        let store =
            CheckpointStore::new(temp_dir.path().join("checkpoints"), HashAlgorithm::Sha256);
        (temp_dir, store, image)
    }

    #[test]
    fn test_create_and_verify() {
        let (_temp_dir, store, image) = setup();
        let checkpoint = store.create(&image, "run-1").unwrap();

        assert_eq!(checkpoint.size, 14);
        assert_eq!(checkpoint.pid, Some(std::process::id()));
        assert!(store.verify(&checkpoint).unwrap());
        assert!(store.load("run-1").unwrap().status.is_pending());

        fs::write(image.path(), b"tampered").unwrap();
        assert!(!store.verify(&checkpoint).unwrap());
        assert!(matches!(
            store.verify_strict(&checkpoint),
            Err(Error::Integrity { .. })
        ));
    }

    #[test]
    fn test_missing_image_writes_nothing() {
        let (_temp_dir, store, image) = setup();
        fs::remove_file(image.path()).unwrap();

        let result = store.create(&image, "run-1");
        assert!(matches!(result, Err(Error::ChecksumUnavailable { .. })));
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_checkpoint_is_immutable() {
        let (_temp_dir, store, image) = setup();
        store.create(&image, "run-1").unwrap();
        assert!(matches!(store.create(&image, "run-1"), Err(Error::Checkpoint(_))));
    }

    #[test]
    fn test_finalize_once() {
        let (_temp_dir, store, image) = setup();
        let checkpoint = store.create(&image, "run-1").unwrap();

        store.finalize("run-1", RunOutcome::Committed).unwrap();
        let entry = store.load("run-1").unwrap();
        assert_eq!(entry.checkpoint, checkpoint);
        assert!(matches!(
            entry.status,
            CheckpointStatus::Finalized { outcome: RunOutcome::Committed, .. }
        ));

        assert!(store.finalize("run-1", RunOutcome::Aborted).is_err());
        assert!(store.abandon("run-1", "late").is_err());
        assert!(store.pending().unwrap().is_empty());
    }

    #[test]
    fn test_load_unknown_run() {
        let (_temp_dir, store, _image) = setup();
        assert!(matches!(store.load("nope"), Err(Error::CheckpointNotFound(_))));
    }

    #[test]
    fn test_corrupted_trailing_line_is_ignored() {
        let (_temp_dir, store, image) = setup();
        store.create(&image, "run-1").unwrap();

        let path = store.dir().join("run-1.ckpt");
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "deadbeef|{{\"type\":\"Finalized\"}}").unwrap();

        assert!(store.load("run-1").unwrap().status.is_pending());
    }

    #[test]
    fn test_prune_keeps_pending_and_recent() {
        let (_temp_dir, store, image) = setup();
        store.create(&image, "old-done").unwrap();
        store.finalize("old-done", RunOutcome::RolledBack).unwrap();
        store.create(&image, "old-pending").unwrap();

        let removed = store.prune(Utc::now() + chrono::Duration::seconds(1)).unwrap();
        assert_eq!(removed, vec!["old-done".to_string()]);

        let remaining: Vec<_> = store
            .list()
            .unwrap()
            .into_iter()
            .map(|e| e.checkpoint.run_id)
            .collect();
        assert_eq!(remaining, vec!["old-pending".to_string()]);

        store.finalize("old-pending", RunOutcome::Committed).unwrap();
        assert!(store.prune_expired(chrono::Duration::days(7)).unwrap().is_empty());
    }

    #[test]
    fn test_record_without_pid_loads() {
        let (_temp_dir, store, image) = setup();
        let checkpoint = store.create(&image, "run-1").unwrap();
        let mut value = serde_json::to_value(CheckpointRecord::Created { checkpoint }).unwrap();
        value["checkpoint"].as_object_mut().unwrap().remove("pid");
        let json = value.to_string();
        let line = format!("{:08x}|{}\n", crc32fast::hash(json.as_bytes()), json);
        fs::write(store.dir().join("run-1.ckpt"), line).unwrap();

        let entry = store.load("run-1").unwrap();
        assert_eq!(entry.checkpoint.pid, None);
        assert!(entry.status.is_pending());
    }
}
