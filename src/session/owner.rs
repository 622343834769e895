// src/session/owner.rs

//! Owner records: which process mounted what
//!
//! Written before the native mount starts and removed after the mount
//! directory is released, so a crash at any point in between leaves a
//! record naming a dead process.

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerRecord {
    pub run_id: String,
    pub pid: u32,
    pub image_path: PathBuf,
    pub index: u32,
    pub mount_dir: PathBuf,
    pub started_at: DateTime<Utc>,
}

impl OwnerRecord {
    pub fn path(owner_dir: &Path, run_id: &str) -> PathBuf {
        owner_dir.join(format!("{}.json", run_id))
    }

    pub fn save(&self, owner_dir: &Path) -> Result<()> {
        fs::create_dir_all(owner_dir)?;
        let json = serde_json::to_vec_pretty(self)?;
        fs::write(Self::path(owner_dir, &self.run_id), json)?;
        Ok(())
    }

    pub fn load(owner_dir: &Path, run_id: &str) -> Result<Self> {
        let content = fs::read(Self::path(owner_dir, run_id))?;
        Ok(serde_json::from_slice(&content)?)
    }

    /// Remove a record; a missing record is not an error
    pub fn remove(owner_dir: &Path, run_id: &str) -> Result<()> {
        match fs::remove_file(Self::path(owner_dir, run_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// All parseable records; unreadable files are skipped with a warning
    pub fn list(owner_dir: &Path) -> Result<Vec<Self>> {
        let read_dir = match fs::read_dir(owner_dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for entry in read_dir {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match fs::read(&path)
                .map_err(Error::from)
                .and_then(|c| serde_json::from_slice::<OwnerRecord>(&c).map_err(Error::from))
            {
                Ok(record) => records.push(record),
                Err(e) => warn!("Skipping unreadable owner record {}: {}", path.display(), e),
            }
        }
        records.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(records)
    }
}

/// Whether a process with this pid is still running
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        // Exists but owned by someone else
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Whether a process with this pid is still running
#[cfg(windows)]
pub fn process_alive(pid: u32) -> bool {
    use winapi::shared::minwindef::{DWORD, FALSE};
    use winapi::um::handleapi::CloseHandle;
    use winapi::um::minwinbase::STILL_ACTIVE;
    use winapi::um::processthreadsapi::{GetExitCodeProcess, OpenProcess};
    use winapi::um::winnt::PROCESS_QUERY_LIMITED_INFORMATION;

    // SAFETY: the handle is checked for null and closed before returning.
    unsafe {
        let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, FALSE, pid);
        if handle.is_null() {
            return false;
        }
        let mut code: DWORD = 0;
        let ok = GetExitCodeProcess(handle, &mut code);
        CloseHandle(handle);
        ok != 0 && code == STILL_ACTIVE
    }
}

#[cfg(not(any(unix, windows)))]
pub fn process_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(run_id: &str) -> OwnerRecord {
        OwnerRecord {
            run_id: run_id.to_string(),
            pid: std::process::id(),
            image_path: PathBuf::from("/images/A.wim"),
            index: 1,
            mount_dir: PathBuf::from("/mnt/run"),
            started_at: Utc::now(),
        }
    }

    #[test]
    fn test_save_load_remove() {
        let temp_dir = TempDir::new().unwrap();
        let owner = record("run-1");
        owner.save(temp_dir.path()).unwrap();

        assert_eq!(OwnerRecord::load(temp_dir.path(), "run-1").unwrap(), owner);
        assert_eq!(OwnerRecord::list(temp_dir.path()).unwrap().len(), 1);

        OwnerRecord::remove(temp_dir.path(), "run-1").unwrap();
        OwnerRecord::remove(temp_dir.path(), "run-1").unwrap();
        assert!(OwnerRecord::list(temp_dir.path()).unwrap().is_empty());
    }

    #[test]
    fn test_list_skips_garbage() {
        let temp_dir = TempDir::new().unwrap();
        record("run-1").save(temp_dir.path()).unwrap();
        fs::write(temp_dir.path().join("junk.json"), b"{not json").unwrap();
        assert_eq!(OwnerRecord::list(temp_dir.path()).unwrap().len(), 1);
    }

    #[test]
    fn test_current_process_is_alive() {
        assert!(process_alive(std::process::id()));
    }

    #[cfg(unix)]
    #[test]
    fn test_unused_pid_is_dead() {
        assert!(!process_alive(i32::MAX as u32 - 1));
    }
}
