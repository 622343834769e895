// src/error.rs

//! Error types for wimsmith
//!
//! The taxonomy follows the lifecycle of a run:
//!
//! - **Resource errors** (`ResourceBusy`, `ResourceUnavailable`): a lease on an
//!   image or hive could not be taken. Busy resources are never retried.
//! - **Native tool errors** (`NativeTool`): DISM, `reg.exe` or the simulated
//!   backend returned a failure. Only known-transient exit codes are retried.
//! - **Checkpoint errors** (`ChecksumUnavailable`, `Integrity`): the baseline
//!   hash could not be recorded, or no longer matches after a discard.
//!
//! Module failures have their own type ([`crate::modules::ModuleError`]) and
//! never escape the orchestration loop.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Result type used throughout the library
pub type Result<T> = std::result::Result<T, Error>;

/// Crate-wide error type
#[derive(Error, Debug)]
pub enum Error {
    /// Resource is already leased by another session
    #[error("resource busy: {resource} is already leased")]
    ResourceBusy { resource: String },

    /// The native acquisition (mount, hive load) for a resource failed
    #[error("resource unavailable: {resource}: {reason}")]
    ResourceUnavailable { resource: String, reason: String },

    /// An underlying native tool failed
    #[error(transparent)]
    NativeTool(#[from] NativeToolError),

    /// Checkpoint verification mismatch
    #[error("integrity mismatch for {path}: expected {expected}, found {actual}")]
    Integrity {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    /// The source image could not be hashed
    #[error("cannot checksum {path}: {source}")]
    ChecksumUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A mount reported success but the mount directory is not usable
    #[error("mount verification failed for {mount_dir}: {reason}")]
    MountVerification { mount_dir: PathBuf, reason: String },

    /// Operation attempted in the wrong session/engine state
    #[error("cannot {operation} in state {state}")]
    InvalidState { operation: String, state: String },

    /// The same hive was loaded twice within one session
    #[error("hive {0} is already loaded in this session")]
    HiveAlreadyLoaded(String),

    /// A module id was registered twice
    #[error("duplicate module id: {0}")]
    DuplicateModule(String),

    /// A run asked for a module id that is not registered
    #[error("unknown module id: {0}")]
    UnknownModule(String),

    /// No checkpoint record exists for a run id
    #[error("checkpoint not found for run {0}")]
    CheckpointNotFound(String),

    /// Checkpoint record could not be read or written
    #[error("checkpoint store error: {0}")]
    Checkpoint(String),

    /// Module catalog could not be parsed
    #[error("catalog error: {0}")]
    Catalog(String),

    /// Configuration file problem
    #[error("configuration error: {0}")]
    Config(String),

    /// Image reference is not valid (missing file, bad index)
    #[error("invalid image: {0}")]
    InvalidImage(String),

    /// Backend cannot service this image format
    #[error("{backend} cannot service {format} images")]
    UnsupportedFormat { backend: String, format: String },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parse error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Create a resource-busy error for a resource key
    pub fn busy(resource: impl fmt::Display) -> Self {
        Self::ResourceBusy {
            resource: resource.to_string(),
        }
    }

    /// Create an invalid-state error
    pub fn invalid_state(operation: &str, state: impl fmt::Debug) -> Self {
        Self::InvalidState {
            operation: operation.to_string(),
            state: format!("{:?}", state),
        }
    }

    /// Whether a caller may retry the failed operation
    ///
    /// Only native tool failures with a known-transient exit code qualify.
    /// `ResourceBusy` is never transient.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::NativeTool(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// Native operation that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum NativeOperation {
    Mount,
    Commit,
    Discard,
    ListMounts,
    Cleanup,
    HiveLoad,
    HiveUnload,
    HiveEdit,
    FeatureToggle,
}

/// Failure reported by an underlying native tool
#[derive(Error, Debug, Clone)]
#[error("{tool} {operation} failed{}: {message}", exit_code_suffix(.exit_code))]
pub struct NativeToolError {
    /// Tool name (dism, reg, simulated)
    pub tool: String,
    /// What the tool was asked to do
    pub operation: NativeOperation,
    /// Process exit code, if the process ran at all
    pub exit_code: Option<i32>,
    /// Captured output or spawn error
    pub message: String,
}

fn exit_code_suffix(exit_code: &Option<i32>) -> String {
    exit_code
        .map(|c| format!(" (exit code {:#x})", c as u32))
        .unwrap_or_default()
}

/// Exit codes that indicate a temporary condition worth retrying
///
/// Both the Win32 value and its HRESULT form are listed since DISM reports
/// HRESULTs while `reg.exe` reports Win32 codes.
const TRANSIENT_EXIT_CODES: &[u32] = &[
    32,          // ERROR_SHARING_VIOLATION
    33,          // ERROR_LOCK_VIOLATION
    170,         // ERROR_BUSY
    1224,        // ERROR_USER_MAPPED_FILE
    0x8007_0020, // HRESULT(ERROR_SHARING_VIOLATION)
    0x8007_0021, // HRESULT(ERROR_LOCK_VIOLATION)
    0x8007_00AA, // HRESULT(ERROR_BUSY)
    0x8007_04C8, // HRESULT(ERROR_USER_MAPPED_FILE)
    0xC142_0117, // DISM: directory could not be completely unmounted
];

impl NativeToolError {
    /// Create a new native tool error
    pub fn new(
        tool: impl Into<String>,
        operation: NativeOperation,
        exit_code: Option<i32>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            tool: tool.into(),
            operation,
            exit_code,
            message: message.into(),
        }
    }

    /// Exit-code heuristic for transient failures
    ///
    /// Spawn failures (no exit code) and timeouts are not transient.
    pub fn is_transient(&self) -> bool {
        self.exit_code
            .is_some_and(|code| TRANSIENT_EXIT_CODES.contains(&(code as u32)))
    }
}
