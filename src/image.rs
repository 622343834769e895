// src/image.rs

//! Image references and container format detection

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// WIM/ESD header magic
const WIM_MAGIC: &[u8; 8] = b"MSWIM\0\0\0";
/// VHDX file identifier at offset 0
const VHDX_MAGIC: &[u8; 8] = b"vhdxfile";
/// VHD footer cookie (last 512 bytes of the file)
const VHD_COOKIE: &[u8; 8] = b"conectix";

/// Deployment image container formats
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ImageFormat {
    Wim,
    Esd,
    Vhd,
    Vhdx,
}

impl ImageFormat {
    /// Guess the format from a file extension
    pub fn from_extension(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?;
        ext.parse().ok()
    }

    /// Detect the format of an image file
    ///
    /// The extension is trusted first. Files without a recognised extension
    /// fall back to magic bytes; WIM and ESD share a header so unknown
    /// extensions with the WIM magic are reported as WIM.
    pub fn detect(path: &Path) -> Result<Self> {
        if let Some(format) = Self::from_extension(path) {
            return Ok(format);
        }

        let mut file = File::open(path)?;
        let mut magic = [0u8; 8];
        if file.read_exact(&mut magic).is_ok() {
            if &magic == WIM_MAGIC {
                return Ok(Self::Wim);
            }
            if &magic == VHDX_MAGIC {
                return Ok(Self::Vhdx);
            }
        }

        let len = file.metadata()?.len();
        if len >= 512 {
            file.seek(SeekFrom::Start(len - 512))?;
            let mut cookie = [0u8; 8];
            file.read_exact(&mut cookie)?;
            if &cookie == VHD_COOKIE {
                return Ok(Self::Vhd);
            }
        }

        Err(Error::InvalidImage(format!(
            "unable to detect image format for {}",
            path.display()
        )))
    }

    /// Whether the container holds multiple indexed images
    pub fn is_multi_index(&self) -> bool {
        matches!(self, Self::Wim | Self::Esd)
    }
}

/// Immutable reference to one image inside an image file
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageReference {
    path: PathBuf,
    index: u32,
    format: ImageFormat,
}

impl ImageReference {
    /// Create a reference, validating the file and index
    ///
    /// Disk images (VHD/VHDX) only have index 1.
    pub fn new(path: impl Into<PathBuf>, index: u32, format: Option<ImageFormat>) -> Result<Self> {
        let path = path.into();
        if !path.is_file() {
            return Err(Error::InvalidImage(format!(
                "{} does not exist or is not a file",
                path.display()
            )));
        }
        if index == 0 {
            return Err(Error::InvalidImage("image index starts at 1".to_string()));
        }

        let format = match format {
            Some(f) => f,
            None => ImageFormat::detect(&path)?,
        };
        if !format.is_multi_index() && index != 1 {
            return Err(Error::InvalidImage(format!(
                "{} images have a single index, got {}",
                format, index
            )));
        }

        Ok(Self {
            path,
            index,
            format,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }

    /// Canonical path used as the lease key for this image file
    ///
    /// All indexes of one file share the key: DISM cannot mount two indexes
    /// of the same file read-write at once.
    pub fn lease_path(&self) -> PathBuf {
        self.path
            .canonicalize()
            .unwrap_or_else(|_| self.path.clone())
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{} ({})", self.path.display(), self.index, self.format)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_detect_from_extension() {
        let temp_dir = TempDir::new().unwrap();
        for (name, expected) in [
            ("install.wim", ImageFormat::Wim),
            ("install.ESD", ImageFormat::Esd),
            ("disk.vhd", ImageFormat::Vhd),
            ("disk.vhdx", ImageFormat::Vhdx),
        ] {
            let path = temp_dir.path().join(name);
            fs::write(&path, b"").unwrap();
            assert_eq!(ImageFormat::detect(&path).unwrap(), expected);
        }
    }

    #[test]
    fn test_detect_from_magic() {
        let temp_dir = TempDir::new().unwrap();

        let wim = temp_dir.path().join("image.bin");
        let mut content = WIM_MAGIC.to_vec();
        content.extend_from_slice(&[0u8; 200]);
        fs::write(&wim, &content).unwrap();
        assert_eq!(ImageFormat::detect(&wim).unwrap(), ImageFormat::Wim);

        let vhdx = temp_dir.path().join("disk.img");
        fs::write(&vhdx, b"vhdxfile and more").unwrap();
        assert_eq!(ImageFormat::detect(&vhdx).unwrap(), ImageFormat::Vhdx);

        let vhd = temp_dir.path().join("disk.raw");
        let mut content = vec![0u8; 4096];
        content[4096 - 512..4096 - 504].copy_from_slice(VHD_COOKIE);
        fs::write(&vhd, &content).unwrap();
        assert_eq!(ImageFormat::detect(&vhd).unwrap(), ImageFormat::Vhd);
    }

    #[test]
    fn test_detect_unknown() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("random.bin");
        fs::write(&path, [0xFFu8; 16]).unwrap();
        assert!(ImageFormat::detect(&path).is_err());
    }

    #[test]
    fn test_reference_validation() {
        let temp_dir = TempDir::new().unwrap();
        let wim = temp_dir.path().join("install.wim");
        fs::write(&wim, b"x").unwrap();

        let image = ImageReference::new(&wim, 3, None).unwrap();
        assert_eq!(image.index(), 3);
        assert_eq!(image.format(), ImageFormat::Wim);

        assert!(ImageReference::new(&wim, 0, None).is_err());
        assert!(ImageReference::new(temp_dir.path().join("nope.wim"), 1, None).is_err());

        let vhdx = temp_dir.path().join("disk.vhdx");
        fs::write(&vhdx, b"x").unwrap();
        assert!(ImageReference::new(&vhdx, 2, None).is_err());
        assert!(ImageReference::new(&vhdx, 1, None).is_ok());
    }
}
