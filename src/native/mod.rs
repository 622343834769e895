// src/native/mod.rs

//! Native tool layer
//!
//! Everything that touches DISM or the offline registry goes through two
//! traits:
//!
//! - [`ImageServicer`]: mount, unmount (commit/discard), enumerate mounts,
//!   clean up stale mount points, toggle optional features
//! - [`HiveLoader`]: load/unload an offline hive under `HKLM\<key>` and edit
//!   values while it is loaded
//!
//! Backends:
//!
//! | Backend | Images | Hives |
//! |---------|--------|-------|
//! | `dism` | `dism.exe` | `reg.exe` |
//! | `simulated` | JSON image files, directory mounts | JSON hive files |
//!
//! All calls are blocking. Failures are reported as
//! [`NativeToolError`](crate::NativeToolError) so [`RetryPolicy`] can tell
//! transient exit codes from real failures.

mod command;
pub mod dism;
pub mod reg;
pub mod simulated;

pub use command::{ToolOutput, run_tool};
pub use dism::DismServicer;
pub use reg::RegHiveLoader;
pub use simulated::{SimulatedBackend, SimulatedImage};

use crate::config::{BackendKind, EngineConfig};
use crate::image::{ImageFormat, ImageReference};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// Mount state reported for an image by the servicing tool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MountStatus {
    Ok,
    NeedsRemount,
    Invalid,
    Other(String),
}

impl MountStatus {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "ok" => Self::Ok,
            "needs remount" => Self::NeedsRemount,
            "invalid" => Self::Invalid,
            other => Self::Other(other.to_string()),
        }
    }
}

/// One mounted image as reported by the servicing tool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountedImageInfo {
    pub mount_dir: PathBuf,
    pub image_path: PathBuf,
    pub index: u32,
    pub status: MountStatus,
}

/// Image mount/commit backend
pub trait ImageServicer: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this backend can mount the format read-write
    fn supports(&self, format: ImageFormat) -> bool;

    /// Mount `image` into the existing, empty `mount_dir`
    fn mount(&self, image: &ImageReference, mount_dir: &Path) -> Result<()>;

    /// Unmount, saving changes into the image when `commit` is set
    fn unmount(&self, mount_dir: &Path, commit: bool) -> Result<()>;

    /// Images the tool currently reports as mounted
    fn mounted_images(&self) -> Result<Vec<MountedImageInfo>>;

    /// Remove orphaned mount bookkeeping left by crashed sessions
    fn cleanup(&self) -> Result<()>;

    /// Enable or disable an optional feature in the mounted image
    fn set_feature(&self, mount_dir: &Path, feature: &str, enable: bool) -> Result<()>;
}

/// Offline registry hive backend
///
/// `load_key` is the bare subkey name under `HKLM`. `key` arguments are
/// paths relative to the hive root.
pub trait HiveLoader: Send + Sync {
    fn name(&self) -> &str;

    fn load(&self, load_key: &str, backing: &Path) -> Result<()>;

    fn unload(&self, load_key: &str) -> Result<()>;

    fn set_value(&self, load_key: &str, key: &str, name: &str, value: &RegValue) -> Result<()>;

    fn delete_value(&self, load_key: &str, key: &str, name: &str) -> Result<()>;

    fn delete_key(&self, load_key: &str, key: &str) -> Result<()>;
}

/// Typed registry value
///
/// Serialized adjacently tagged so catalog entries read naturally:
/// `type = "dword"`, `data = 0`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum RegValue {
    Dword(u32),
    Qword(u64),
    String(String),
    ExpandString(String),
    MultiString(Vec<String>),
    /// Hex-encoded bytes
    Binary(String),
}

impl RegValue {
    /// `reg.exe` type name
    pub fn reg_type(&self) -> &'static str {
        match self {
            Self::Dword(_) => "REG_DWORD",
            Self::Qword(_) => "REG_QWORD",
            Self::String(_) => "REG_SZ",
            Self::ExpandString(_) => "REG_EXPAND_SZ",
            Self::MultiString(_) => "REG_MULTI_SZ",
            Self::Binary(_) => "REG_BINARY",
        }
    }

    /// Data argument in `reg add /d` syntax
    pub fn reg_data(&self) -> String {
        match self {
            Self::Dword(v) => v.to_string(),
            Self::Qword(v) => v.to_string(),
            Self::String(s) | Self::ExpandString(s) => s.clone(),
            Self::MultiString(items) => items.join("\\0"),
            Self::Binary(hex) => hex.clone(),
        }
    }
}

impl fmt::Display for RegValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.reg_type(), self.reg_data())
    }
}

/// Bounded retry with exponential backoff for transient native failures
///
/// Only errors where [`Error::is_transient`] holds are retried; resource
/// contention and permanent tool failures return on the first attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(500))
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
        }
    }

    /// Single attempt, no retry
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Run `op`, retrying transient failures
    pub fn run<T>(&self, what: &str, mut op: impl FnMut() -> Result<T>) -> Result<T> {
        let mut backoff = self.initial_backoff;
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    warn!(
                        "{} failed (attempt {}/{}): {}; retrying in {:?}",
                        what, attempt, self.max_attempts, e, backoff
                    );
                    thread::sleep(backoff);
                    backoff = backoff.saturating_mul(2);
                    attempt += 1;
                }
                Err(e) => {
                    if attempt > 1 {
                        debug!("{} giving up after {} attempts", what, attempt);
                    }
                    return Err(e);
                }
            }
        }
    }
}

/// The pair of native backends a run uses
#[derive(Clone)]
pub struct NativeBackend {
    pub servicer: Arc<dyn ImageServicer>,
    pub hives: Arc<dyn HiveLoader>,
}

impl NativeBackend {
    pub fn new(servicer: Arc<dyn ImageServicer>, hives: Arc<dyn HiveLoader>) -> Self {
        Self { servicer, hives }
    }

    /// Backends selected by the configuration
    pub fn from_config(config: &EngineConfig) -> Self {
        match config.backend {
            BackendKind::Dism => Self::new(
                Arc::new(DismServicer::new(config.command_timeout())),
                Arc::new(RegHiveLoader::new(config.command_timeout())),
            ),
            BackendKind::Simulated => {
                Self::simulated(Arc::new(SimulatedBackend::new(&config.state_dir)))
            }
        }
    }

    /// Use one simulated backend for both images and hives
    pub fn simulated(backend: Arc<SimulatedBackend>) -> Self {
        Self::new(backend.clone(), backend)
    }

    pub fn name(&self) -> String {
        format!("{}+{}", self.servicer.name(), self.hives.name())
    }
}

impl fmt::Debug for NativeBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeBackend")
            .field("servicer", &self.servicer.name())
            .field("hives", &self.hives.name())
            .finish()
    }
}

/// Map an unsupported format onto the crate error
pub(crate) fn unsupported(servicer: &dyn ImageServicer, format: ImageFormat) -> Error {
    Error::UnsupportedFormat {
        backend: servicer.name().to_string(),
        format: format.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{NativeOperation, NativeToolError};
    use std::cell::Cell;

    fn transient() -> Error {
        NativeToolError::new("dism", NativeOperation::Discard, Some(170), "busy").into()
    }

    #[test]
    fn test_retry_transient_until_success() {
        let policy = RetryPolicy::new(3, Duration::ZERO);
        let calls = Cell::new(0);
        let result = policy.run("discard", || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 { Err(transient()) } else { Ok(calls.get()) }
        });
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn test_retry_gives_up_after_max_attempts() {
        let policy = RetryPolicy::new(2, Duration::ZERO);
        let calls = Cell::new(0);
        let result: Result<()> = policy.run("discard", || {
            calls.set(calls.get() + 1);
            Err(transient())
        });
        assert!(result.is_err());
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_busy_is_not_retried() {
        let policy = RetryPolicy::new(5, Duration::ZERO);
        let calls = Cell::new(0);
        let result: Result<()> = policy.run("acquire", || {
            calls.set(calls.get() + 1);
            Err(Error::busy("image:A.wim"))
        });
        assert!(matches!(result, Err(Error::ResourceBusy { .. })));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_reg_value_arguments() {
        assert_eq!(RegValue::Dword(0).reg_type(), "REG_DWORD");
        assert_eq!(
            RegValue::MultiString(vec!["a".into(), "b".into()]).reg_data(),
            "a\\0b"
        );
        assert_eq!(RegValue::String("x".into()).to_string(), "REG_SZ:x");
    }

    #[test]
    fn test_reg_value_serde_shape() {
        let value: RegValue = serde_json::from_str(r#"{"type":"dword","data":1}"#).unwrap();
        assert_eq!(value, RegValue::Dword(1));
        let json = serde_json::to_string(&RegValue::ExpandString("%SystemRoot%".into())).unwrap();
        assert_eq!(json, r#"{"type":"expand_string","data":"%SystemRoot%"}"#);
    }

    #[test]
    fn test_mount_status_parse() {
        assert_eq!(MountStatus::parse("Ok"), MountStatus::Ok);
        assert_eq!(MountStatus::parse("Needs Remount"), MountStatus::NeedsRemount);
        assert_eq!(MountStatus::parse("Weird"), MountStatus::Other("weird".to_string()));
    }
}
