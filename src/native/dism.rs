// src/native/dism.rs

//! DISM image servicer
//!
//! Command lines used:
//!
//! ```text
//! dism /English /Mount-Image /ImageFile:<file> /Index:<n> /MountDir:<dir>
//! dism /English /Unmount-Image /MountDir:<dir> /Commit | /Discard
//! dism /English /Get-MountedImageInfo
//! dism /English /Cleanup-Mountpoints
//! dism /English /Image:<dir> /Enable-Feature /FeatureName:<name> /All
//! dism /English /Image:<dir> /Disable-Feature /FeatureName:<name>
//! ```
//!
//! `/English` keeps `/Get-MountedImageInfo` output parseable regardless of
//! the host UI language.

use super::{ImageServicer, MountStatus, MountedImageInfo, run_tool};
use crate::image::{ImageFormat, ImageReference};
use crate::{NativeOperation, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

const DISM: &str = "dism";

/// `dism.exe` backend
#[derive(Debug, Clone)]
pub struct DismServicer {
    program: String,
    timeout: Duration,
}

impl DismServicer {
    pub fn new(timeout: Duration) -> Self {
        Self {
            program: DISM.to_string(),
            timeout,
        }
    }

    /// Use a specific `dism.exe` (e.g. from an ADK install)
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    fn dism(&self, operation: NativeOperation, args: Vec<String>) -> Result<String> {
        let mut full = vec!["/English".to_string()];
        full.extend(args);
        Ok(run_tool(&self.program, &full, self.timeout, operation)?.stdout)
    }
}

impl ImageServicer for DismServicer {
    fn name(&self) -> &str {
        DISM
    }

    /// ESD files are read-only to DISM and must be exported to WIM first
    fn supports(&self, format: ImageFormat) -> bool {
        !matches!(format, ImageFormat::Esd)
    }

    fn mount(&self, image: &ImageReference, mount_dir: &Path) -> Result<()> {
        info!("Mounting {} at {}", image, mount_dir.display());
        self.dism(
            NativeOperation::Mount,
            vec![
                "/Mount-Image".to_string(),
                format!("/ImageFile:{}", image.path().display()),
                format!("/Index:{}", image.index()),
                format!("/MountDir:{}", mount_dir.display()),
            ],
        )?;
        Ok(())
    }

    fn unmount(&self, mount_dir: &Path, commit: bool) -> Result<()> {
        let (operation, flag) = if commit {
            (NativeOperation::Commit, "/Commit")
        } else {
            (NativeOperation::Discard, "/Discard")
        };
        info!("Unmounting {} ({})", mount_dir.display(), flag);
        self.dism(
            operation,
            vec![
                "/Unmount-Image".to_string(),
                format!("/MountDir:{}", mount_dir.display()),
                flag.to_string(),
            ],
        )?;
        Ok(())
    }

    fn mounted_images(&self) -> Result<Vec<MountedImageInfo>> {
        let stdout = self.dism(
            NativeOperation::ListMounts,
            vec!["/Get-MountedImageInfo".to_string()],
        )?;
        Ok(parse_mounted_images(&stdout))
    }

    fn cleanup(&self) -> Result<()> {
        info!("Cleaning up orphaned DISM mount points");
        self.dism(
            NativeOperation::Cleanup,
            vec!["/Cleanup-Mountpoints".to_string()],
        )?;
        Ok(())
    }

    fn set_feature(&self, mount_dir: &Path, feature: &str, enable: bool) -> Result<()> {
        let mut args = vec![
            format!("/Image:{}", mount_dir.display()),
            if enable { "/Enable-Feature" } else { "/Disable-Feature" }.to_string(),
            format!("/FeatureName:{}", feature),
        ];
        if enable {
            args.push("/All".to_string());
        }
        self.dism(NativeOperation::FeatureToggle, args)?;
        Ok(())
    }
}

/// Parse `dism /Get-MountedImageInfo` output
///
/// ```text
/// Mounted images:
///
/// Mount Dir : C:\mount\run-1
/// Image File : C:\images\install.wim
/// Image Index : 1
/// Mounted Read/Write : Yes
/// Status : Ok
/// ```
///
/// Blocks missing a mount dir or image file are ignored.
pub fn parse_mounted_images(output: &str) -> Vec<MountedImageInfo> {
    let mut images = Vec::new();
    let mut current: Option<PartialInfo> = None;

    for line in output.lines() {
        let Some((field, value)) = line.split_once(" : ") else {
            continue;
        };
        let value = value.trim();
        match field.trim().to_ascii_lowercase().as_str() {
            "mount dir" => {
                if let Some(done) = current.take().and_then(PartialInfo::finish) {
                    images.push(done);
                }
                current = Some(PartialInfo {
                    mount_dir: Some(PathBuf::from(value)),
                    ..Default::default()
                });
            }
            "image file" => {
                if let Some(info) = current.as_mut() {
                    info.image_path = Some(PathBuf::from(value));
                }
            }
            "image index" => {
                if let Some(info) = current.as_mut() {
                    info.index = value.parse().ok();
                }
            }
            "status" => {
                if let Some(info) = current.as_mut() {
                    info.status = Some(MountStatus::parse(value));
                }
            }
            _ => {}
        }
    }
    if let Some(done) = current.and_then(PartialInfo::finish) {
        images.push(done);
    }
    images
}

#[derive(Default)]
struct PartialInfo {
    mount_dir: Option<PathBuf>,
    image_path: Option<PathBuf>,
    index: Option<u32>,
    status: Option<MountStatus>,
}

impl PartialInfo {
    fn finish(self) -> Option<MountedImageInfo> {
        Some(MountedImageInfo {
            mount_dir: self.mount_dir?,
            image_path: self.image_path?,
            index: self.index.unwrap_or(1),
            status: self.status.unwrap_or(MountStatus::Other("unknown".to_string())),
        })
    }
}
