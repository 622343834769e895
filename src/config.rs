// src/config.rs

//! Engine configuration
//!
//! Loaded from a TOML file; every field has a default so an empty file (or
//! no file at all) is a valid configuration.
//!
//! ```toml
//! state_dir = "D:/wimsmith"
//! checkpoint_retention_days = 14
//! backend = "dism"
//!
//! [native]
//! retry_attempts = 5
//! command_timeout_secs = 1800
//! ```

use crate::hash::HashAlgorithm;
use crate::lease::AcquirePolicy;
use crate::native::RetryPolicy;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File name looked up in the user config directory
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Which native backend services images
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// DISM for images, reg.exe for hives
    #[default]
    Dism,
    /// Directory-backed simulation (tests, dry runs, non-Windows hosts)
    Simulated,
}

/// Native tool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NativeConfig {
    /// Attempts for operations failing with a transient exit code
    pub retry_attempts: u32,
    /// Initial backoff between attempts, doubled each time
    pub retry_backoff_ms: u64,
    /// Per-command timeout for DISM and reg.exe
    pub command_timeout_secs: u64,
    /// Top-level entries that must exist in a freshly mounted image
    pub expected_mount_entries: Vec<String>,
}

impl Default for NativeConfig {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            retry_backoff_ms: 500,
            command_timeout_secs: 3600,
            expected_mount_entries: vec!["Windows".to_string()],
        }
    }
}

/// Top-level engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Root for checkpoints, owner records and lock files
    pub state_dir: PathBuf,
    /// Parent directory for per-run mount directories (default: `<state_dir>/mount`)
    pub mount_root: Option<PathBuf>,
    /// Days a finalized checkpoint is kept before pruning
    pub checkpoint_retention_days: u32,
    /// Checkpoint hash algorithm
    pub hash_algorithm: HashAlgorithm,
    /// Seconds to wait for a busy image (0 = fail fast)
    pub acquire_wait_secs: u64,
    /// Installer backends probed for the package-install capability
    pub installers: Vec<String>,
    /// Native backend selection
    pub backend: BackendKind,
    /// Native tool settings
    pub native: NativeConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            mount_root: None,
            checkpoint_retention_days: 7,
            hash_algorithm: HashAlgorithm::Sha256,
            acquire_wait_secs: 0,
            installers: vec!["winget".to_string(), "choco".to_string()],
            backend: BackendKind::Dism,
            native: NativeConfig::default(),
        }
    }
}

/// Default state directory: `<local data dir>/wimsmith`
fn default_state_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("wimsmith")
}

impl EngineConfig {
    /// Create a config with defaults rooted at `state_dir`
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            ..Default::default()
        }
    }

    /// Load a config file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
    }

    /// Parse config from a TOML string
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from an explicit path, or the user config file if it exists,
    /// or fall back to defaults
    pub fn discover(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        match dirs::config_dir().map(|d| d.join("wimsmith").join(CONFIG_FILE_NAME)) {
            Some(path) if path.is_file() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.native.retry_attempts == 0 {
            return Err(Error::Config("native.retry_attempts must be at least 1".to_string()));
        }
        if self.native.command_timeout_secs == 0 {
            return Err(Error::Config(
                "native.command_timeout_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Use the simulated backend
    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    /// Override the mount root
    pub fn with_mount_root(mut self, mount_root: impl Into<PathBuf>) -> Self {
        self.mount_root = Some(mount_root.into());
        self
    }

    /// Override the checkpoint retention window
    pub fn with_retention_days(mut self, days: u32) -> Self {
        self.checkpoint_retention_days = days;
        self
    }

    /// Override the acquire policy wait
    pub fn with_acquire_wait(mut self, wait: Duration) -> Self {
        self.acquire_wait_secs = wait.as_secs();
        self
    }

    pub fn mount_root(&self) -> PathBuf {
        self.mount_root
            .clone()
            .unwrap_or_else(|| self.state_dir.join("mount"))
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.state_dir.join("checkpoints")
    }

    pub fn owner_dir(&self) -> PathBuf {
        self.state_dir.join("mounts")
    }

    pub fn lock_dir(&self) -> PathBuf {
        self.state_dir.join("locks")
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.checkpoint_retention_days))
    }

    pub fn acquire_policy(&self) -> AcquirePolicy {
        if self.acquire_wait_secs == 0 {
            AcquirePolicy::FailFast
        } else {
            AcquirePolicy::Wait(Duration::from_secs(self.acquire_wait_secs))
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.native.retry_attempts,
            Duration::from_millis(self.native.retry_backoff_ms),
        )
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.native.command_timeout_secs)
    }
}
