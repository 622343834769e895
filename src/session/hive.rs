// src/session/hive.rs

//! Offline hive leases nested under a mount session

use super::MountSession;
use crate::lease::ReleaseStatus;
use crate::native::RegValue;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Offline hives a module can open
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum HiveName {
    /// `HKLM\SOFTWARE`
    Software,
    /// `HKLM\SYSTEM`
    System,
    /// Default user profile (`NTUSER.DAT`), template for new accounts
    DefaultUser,
    Sam,
    Security,
    Components,
}

impl HiveName {
    /// Backing file relative to the mount root
    pub fn relative_path(&self) -> &'static str {
        match self {
            Self::Software => "Windows/System32/config/SOFTWARE",
            Self::System => "Windows/System32/config/SYSTEM",
            Self::DefaultUser => "Users/Default/NTUSER.DAT",
            Self::Sam => "Windows/System32/config/SAM",
            Self::Security => "Windows/System32/config/SECURITY",
            Self::Components => "Windows/System32/config/COMPONENTS",
        }
    }

    /// Backing file inside a mount directory
    pub fn backing_path(&self, mount_dir: &Path) -> PathBuf {
        self.relative_path()
            .split('/')
            .fold(mount_dir.to_path_buf(), |path, part| path.join(part))
    }

    /// Suffix of the temporary load key
    pub fn key_suffix(&self) -> &'static str {
        match self {
            Self::Software => "SOFTWARE",
            Self::System => "SYSTEM",
            Self::DefaultUser => "DEFAULT",
            Self::Sam => "SAM",
            Self::Security => "SECURITY",
            Self::Components => "COMPONENTS",
        }
    }
}

/// One loaded offline hive
///
/// Borrows its session, so it cannot outlive it. Dropping the lease unloads
/// the hive (unload failures are logged and the lease is freed anyway).
pub struct HiveLease<'s> {
    session: &'s MountSession,
    hive: HiveName,
    load_key: String,
    backing: PathBuf,
    released: bool,
}

impl<'s> HiveLease<'s> {
    pub(super) fn new(
        session: &'s MountSession,
        hive: HiveName,
        load_key: String,
        backing: PathBuf,
    ) -> Self {
        Self {
            session,
            hive,
            load_key,
            backing,
            released: false,
        }
    }

    pub fn hive(&self) -> HiveName {
        self.hive
    }

    /// Key under `HKLM` the hive is loaded at
    pub fn load_key(&self) -> &str {
        &self.load_key
    }

    pub fn backing(&self) -> &Path {
        &self.backing
    }

    fn ensure_loaded(&self) -> Result<()> {
        if self.released || !self.session.hive_loaded(self.hive) {
            return Err(Error::invalid_state(
                &format!("edit hive {}", self.hive),
                "released",
            ));
        }
        Ok(())
    }

    /// Set `name` under `key` (relative to the hive root)
    pub fn set_value(&self, key: &str, name: &str, value: &RegValue) -> Result<()> {
        self.ensure_loaded()?;
        self.session
            .backend()
            .hives
            .set_value(&self.load_key, key, name, value)
    }

    pub fn delete_value(&self, key: &str, name: &str) -> Result<()> {
        self.ensure_loaded()?;
        self.session
            .backend()
            .hives
            .delete_value(&self.load_key, key, name)
    }

    pub fn delete_key(&self, key: &str) -> Result<()> {
        self.ensure_loaded()?;
        self.session.backend().hives.delete_key(&self.load_key, key)
    }

    /// Unload now instead of at drop
    pub fn release(mut self) -> ReleaseStatus {
        self.release_inner()
    }

    fn release_inner(&mut self) -> ReleaseStatus {
        if self.released {
            return ReleaseStatus::AlreadyReleased;
        }
        self.released = true;
        self.session.release_hive(self.hive)
    }
}

impl Drop for HiveLease<'_> {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl std::fmt::Debug for HiveLease<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HiveLease")
            .field("hive", &self.hive)
            .field("load_key", &self.load_key)
            .field("backing", &self.backing)
            .field("released", &self.released)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hive_name_parsing() {
        assert_eq!("software".parse::<HiveName>().unwrap(), HiveName::Software);
        assert_eq!("DEFAULT_USER".parse::<HiveName>().unwrap(), HiveName::DefaultUser);
        assert_eq!(HiveName::DefaultUser.to_string(), "default_user");
        assert!("hkcu".parse::<HiveName>().is_err());
    }

    #[test]
    fn test_backing_path() {
        let path = HiveName::System.backing_path(Path::new("/mnt/run"));
        assert!(path.ends_with("Windows/System32/config/SYSTEM"));
        assert_eq!(HiveName::DefaultUser.key_suffix(), "DEFAULT");
    }
}
