// src/lease/lockfile.rs

//! Cross-process exclusive lock for one image file
//!
//! The in-process lease table only sees this process. Two `wimsmith`
//! processes servicing the same image file would otherwise race on the DISM
//! mount, so each session also holds an `flock`-style lock file:
//!
//! - **Lock file**: `<state_dir>/locks/<digest>.lock`, where the digest is
//!   taken over the normalized image path
//! - **PID file**: `<digest>.pid`, names the holder for diagnostics and
//!   crash recovery

use super::normalize_path;
use crate::hash::{HashAlgorithm, hash_bytes};
use crate::{Error, Result};
use fs2::FileExt;
use std::fs::{self, File};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Exclusive lock on an image file, held until dropped
pub struct ImageLock {
    /// Kept open to maintain the lock
    #[allow(dead_code)]
    file: File,
    path: PathBuf,
}

impl ImageLock {
    /// Lock file path for an image under `lock_dir`
    pub fn lock_path(lock_dir: &Path, image_path: &Path) -> PathBuf {
        let digest = hash_bytes(HashAlgorithm::Sha256, normalize_path(image_path).as_bytes());
        lock_dir.join(format!("{}.lock", &digest[..16]))
    }

    /// Try to lock `image_path` without blocking
    ///
    /// Returns:
    /// - `Ok(Some(lock))` if the lock was acquired
    /// - `Ok(None)` if another process holds it
    /// - `Err` on I/O errors
    pub fn try_acquire(lock_dir: &Path, image_path: &Path) -> Result<Option<Self>> {
        fs::create_dir_all(lock_dir)?;
        let path = Self::lock_path(lock_dir, image_path);
        let file = File::create(&path)?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                let lock = Self { file, path };
                lock.write_pid(image_path)?;
                info!("Acquired image lock for {}", image_path.display());
                Ok(Some(lock))
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                debug!("Image lock already held at {:?}", path);
                Ok(None)
            }
            Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
                debug!("Image lock already held at {:?}", path);
                Ok(None)
            }
            Err(e) => Err(Error::ResourceUnavailable {
                resource: image_path.display().to_string(),
                reason: format!("failed to lock {}: {}", path.display(), e),
            }),
        }
    }

    /// Lock `image_path`, mapping contention to `ResourceBusy`
    pub fn acquire(lock_dir: &Path, image_path: &Path) -> Result<Self> {
        Self::try_acquire(lock_dir, image_path)?.ok_or_else(|| {
            let holder = Self::holder_pid(lock_dir, image_path)
                .map(|pid| format!(" (pid {})", pid))
                .unwrap_or_default();
            Error::busy(format!("{}{}", image_path.display(), holder))
        })
    }

    /// Check whether some process holds the lock, without taking it
    pub fn is_held(lock_dir: &Path, image_path: &Path) -> bool {
        let path = Self::lock_path(lock_dir, image_path);
        let Ok(file) = File::open(&path) else {
            return false;
        };
        match file.try_lock_exclusive() {
            Ok(()) => {
                let _ = file.unlock();
                false
            }
            Err(_) => true,
        }
    }

    /// PID recorded by the current (or last) holder
    pub fn holder_pid(lock_dir: &Path, image_path: &Path) -> Option<u32> {
        let pid_path = Self::lock_path(lock_dir, image_path).with_extension("pid");
        fs::read_to_string(pid_path)
            .ok()
            .and_then(|s| s.lines().next().and_then(|l| l.trim().parse().ok()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// PID on the first line, image path on the second
    fn write_pid(&self, image_path: &Path) -> Result<()> {
        let pid_path = self.path.with_extension("pid");
        fs::write(
            pid_path,
            format!("{}\n{}\n", std::process::id(), image_path.display()),
        )?;
        Ok(())
    }
}

impl Drop for ImageLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(self.path.with_extension("pid"));
        // Lock is released when the file handle closes
        debug!("Released image lock at {:?}", self.path);
    }
}

impl std::fmt::Debug for ImageLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageLock").field("path", &self.path).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_and_release() {
        let temp_dir = TempDir::new().unwrap();
        let locks = temp_dir.path().join("locks");
        let image = temp_dir.path().join("A.wim");

        let lock = ImageLock::acquire(&locks, &image).unwrap();
        assert!(lock.path().exists());
        assert!(ImageLock::is_held(&locks, &image));
        assert_eq!(ImageLock::holder_pid(&locks, &image), Some(std::process::id()));

        drop(lock);
        assert!(!ImageLock::is_held(&locks, &image));
        assert!(ImageLock::holder_pid(&locks, &image).is_none());
    }

    #[test]
    fn test_second_acquire_is_busy() {
        let temp_dir = TempDir::new().unwrap();
        let image = temp_dir.path().join("A.wim");

        let _lock = ImageLock::acquire(temp_dir.path(), &image).unwrap();
        assert!(ImageLock::try_acquire(temp_dir.path(), &image).unwrap().is_none());
        assert!(matches!(
            ImageLock::acquire(temp_dir.path(), &image),
            Err(Error::ResourceBusy { .. })
        ));
    }

    #[test]
    fn test_distinct_images_do_not_contend() {
        let temp_dir = TempDir::new().unwrap();
        let _a = ImageLock::acquire(temp_dir.path(), &temp_dir.path().join("A.wim")).unwrap();
        let b = ImageLock::try_acquire(temp_dir.path(), &temp_dir.path().join("B.wim")).unwrap();
        assert!(b.is_some());
    }

    #[test]
    fn test_not_held_without_file() {
        let temp_dir = TempDir::new().unwrap();
        assert!(!ImageLock::is_held(temp_dir.path(), Path::new("/none.wim")));
    }
}
