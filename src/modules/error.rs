// src/modules/error.rs
//! Error types for customization modules

use super::Capability;
use thiserror::Error;

/// Result type for module operations
pub type ModuleResult<T> = std::result::Result<T, ModuleError>;

/// Errors a customization module can report
///
/// These never leave the orchestration loop: the engine turns them into a
/// `ModuleStatus::Failed` entry of the run result.
#[derive(Error, Debug)]
pub enum ModuleError {
    /// An offline hive could not be loaded or edited
    #[error("hive access failed: {0}")]
    Hive(#[source] crate::Error),

    /// A native operation (feature toggle, servicing call) failed
    #[error("native operation failed: {0}")]
    Native(#[from] crate::Error),

    /// The module needs a capability this environment lacks
    #[error("capability {0} is not available")]
    CapabilityUnavailable(Capability),

    /// The module observed cancellation and stopped
    #[error("module cancelled")]
    Cancelled,

    /// The module panicked; the payload message is kept
    #[error("module panicked: {0}")]
    Panicked(String),

    /// IO error while touching files in the mounted image
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic module failure
    #[error("{0}")]
    Other(String),
}

impl ModuleError {
    /// Create a new "other" error with a message
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }
}
