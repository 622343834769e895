// src/engine/context.rs

//! What a module sees of its run

use super::CancellationToken;
use crate::image::ImageReference;
use crate::modules::{ModuleError, ModuleResult};
use crate::progress::{EventSink, RunEventKind};
use crate::session::{HiveLease, HiveName, MountSession};
use std::path::Path;
use tracing::debug;

/// Handle passed to a module for the duration of one call
///
/// Borrows the mounted session, so neither the context nor any hive lease
/// opened through it can outlive the call.
pub struct ModuleContext<'s> {
    session: &'s MountSession,
    module_id: &'s str,
    sink: &'s EventSink<'s>,
    cancel: &'s CancellationToken,
    installers: &'s [String],
    last_percent: u8,
}

impl<'s> ModuleContext<'s> {
    pub(crate) fn new(
        session: &'s MountSession,
        module_id: &'s str,
        sink: &'s EventSink<'s>,
        cancel: &'s CancellationToken,
        installers: &'s [String],
    ) -> Self {
        Self {
            session,
            module_id,
            sink,
            cancel,
            installers,
            last_percent: 0,
        }
    }

    pub fn module_id(&self) -> &str {
        self.module_id
    }

    pub fn run_id(&self) -> &str {
        self.session.run_id()
    }

    pub fn image(&self) -> &ImageReference {
        self.session.image()
    }

    /// Root of the mounted image
    pub fn mount_dir(&self) -> &Path {
        self.session.mount_dir()
    }

    /// Installer backends available for package installs
    pub fn installers(&self) -> &[String] {
        self.installers
    }

    /// Load an offline hive of the mounted image
    ///
    /// The engine force-releases any lease still open when the module
    /// returns.
    pub fn open_hive(&self, hive: HiveName) -> ModuleResult<HiveLease<'s>> {
        let session: &'s MountSession = self.session;
        session.open_hive(hive).map_err(ModuleError::Hive)
    }

    /// Enable or disable an optional feature
    pub fn set_feature(&self, name: &str, enable: bool) -> ModuleResult<()> {
        self.session.set_feature(name, enable)?;
        Ok(())
    }

    /// Report progress (0-100) within this module
    pub fn report_progress(&mut self, percent: u8, message: &str) {
        let percent = percent.min(100);
        self.last_percent = percent;
        self.sink.emit(RunEventKind::Progress {
            module_id: self.module_id.to_string(),
            percent,
            message: message.to_string(),
        });
    }

    pub fn last_percent(&self) -> u8 {
        self.last_percent
    }

    /// Append a line to the run log
    pub fn log(&mut self, line: impl Into<String>) {
        let line = line.into();
        debug!("{}: {}", self.module_id, line);
        self.sink.emit(RunEventKind::Log {
            module_id: self.module_id.to_string(),
            line,
        });
    }

    pub fn cancellation(&self) -> &CancellationToken {
        self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fail with `ModuleError::Cancelled` if the run was cancelled
    pub fn check_cancelled(&self) -> ModuleResult<()> {
        if self.is_cancelled() {
            return Err(ModuleError::Cancelled);
        }
        Ok(())
    }
}

impl std::fmt::Debug for ModuleContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleContext")
            .field("module_id", &self.module_id)
            .field("run_id", &self.session.run_id())
            .finish()
    }
}
