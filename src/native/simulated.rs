// src/native/simulated.rs

//! Directory-backed simulation of DISM and reg.exe
//!
//! A simulated image file is JSON describing the file tree of each index:
//!
//! ```json
//! { "images": [ { "index": 1, "name": "Windows 11 Pro",
//!                 "files": { "Windows/explorer.exe": "MZ" } } ] }
//! ```
//!
//! Behavior mirrors the real tools where the engine depends on it:
//!
//! - Mounting writes the index's files into the mount directory. A file that
//!   does not parse as a simulated image "mounts" successfully but leaves
//!   the directory empty, the same spurious success DISM gives on some
//!   malformed images.
//! - Commit rewrites the image file only if the mounted tree changed, so a
//!   no-op commit leaves the file byte-identical. Discard never touches it.
//! - Mount bookkeeping lives in `<state_dir>/simulated-mounts.json` and
//!   survives a crashed process, like DISM's own mount registry.
//! - Hives are JSON maps of `key -> name -> value`; an empty file is an
//!   empty hive. Loaded hives live in memory until unloaded.
//!
//! Failures can be injected per operation with [`SimulatedBackend::fail_next`].

use super::{HiveLoader, ImageServicer, MountStatus, MountedImageInfo, RegValue};
use crate::image::{ImageFormat, ImageReference};
use crate::lease::normalize_path;
use crate::{Error, NativeOperation, NativeToolError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};
use walkdir::WalkDir;

const TOOL: &str = "simulated";
const STATE_FILE: &str = "simulated-mounts.json";

/// Feature state of a simulated mounted image, relative to the mount root
pub const FEATURES_FILE: &str = "Windows/servicing/features.json";

/// Offline hive contents: key path -> value name -> value
pub type SimulatedHive = BTreeMap<String, BTreeMap<String, RegValue>>;

/// One index of a simulated image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulatedIndex {
    pub index: u32,
    pub name: String,
    #[serde(default)]
    pub files: BTreeMap<String, String>,
}

/// Simulated image file contents
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulatedImage {
    pub images: Vec<SimulatedIndex>,
}

impl SimulatedImage {
    /// Single-index image with the given files
    pub fn single(name: &str, files: BTreeMap<String, String>) -> Self {
        Self {
            images: vec![SimulatedIndex {
                index: 1,
                name: name.to_string(),
                files,
            }],
        }
    }

    /// Minimal Windows tree with empty offline hives
    pub fn windows_skeleton() -> BTreeMap<String, String> {
        [
            ("Windows/explorer.exe", "MZ"),
            ("Windows/System32/config/SOFTWARE", ""),
            ("Windows/System32/config/SYSTEM", ""),
            ("Windows/System32/config/SAM", ""),
            ("Windows/System32/config/SECURITY", ""),
            ("Windows/System32/config/COMPONENTS", ""),
            ("Users/Default/NTUSER.DAT", ""),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    pub fn read(path: &Path) -> Result<Self> {
        let content = fs::read(path)?;
        Ok(serde_json::from_slice(&content)?)
    }

    /// Write atomically (temp file in the same directory, then rename)
    pub fn write(&self, path: &Path) -> Result<()> {
        write_json_atomic(path, self)
    }

    pub fn index(&self, index: u32) -> Option<&SimulatedIndex> {
        self.images.iter().find(|i| i.index == index)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SimulatedMount {
    mount_dir: PathBuf,
    image_path: PathBuf,
    index: u32,
    baseline: BTreeMap<String, String>,
}

struct LoadedHive {
    backing: PathBuf,
    data: SimulatedHive,
}

/// In-memory plus on-disk simulation of both native backends
pub struct SimulatedBackend {
    state_file: PathBuf,
    state_lock: Mutex<()>,
    failures: Mutex<HashMap<NativeOperation, VecDeque<Option<i32>>>>,
    hives: Mutex<HashMap<String, LoadedHive>>,
    calls: Mutex<Vec<NativeOperation>>,
}

fn failure(
    operation: NativeOperation,
    exit_code: Option<i32>,
    message: impl Into<String>,
) -> Error {
    NativeToolError::new(TOOL, operation, exit_code, message).into()
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
    let mut temp = tempfile::NamedTempFile::new_in(parent)?;
    serde_json::to_writer_pretty(&mut temp, value)?;
    temp.flush()?;
    temp.persist(path).map_err(|e| Error::Io(e.error))?;
    Ok(())
}

/// Relative `/`-separated path -> content for every file under `root`
fn read_tree(root: &Path) -> Result<BTreeMap<String, String>> {
    let mut files = BTreeMap::new();
    for entry in WalkDir::new(root).min_depth(1) {
        let entry = entry.map_err(|e| Error::Io(e.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| Error::Checkpoint(e.to_string()))?;
        let key = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        let content = fs::read(entry.path())?;
        files.insert(key, String::from_utf8_lossy(&content).into_owned());
    }
    Ok(files)
}

fn clear_dir(dir: &Path) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

fn normalize_key(key: &str) -> String {
    key.trim_matches('\\').to_string()
}

impl SimulatedBackend {
    /// Backend keeping its mount registry under `state_dir`
    pub fn new(state_dir: &Path) -> Self {
        Self {
            state_file: state_dir.join(STATE_FILE),
            state_lock: Mutex::new(()),
            failures: Mutex::new(HashMap::new()),
            hives: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Make the next `operation` call fail with `exit_code`
    ///
    /// Calls queue up: two `fail_next` calls fail the next two attempts.
    pub fn fail_next(&self, operation: NativeOperation, exit_code: Option<i32>) {
        guard(&self.failures)
            .entry(operation)
            .or_default()
            .push_back(exit_code);
    }

    /// Every native operation invoked so far, in order
    pub fn calls(&self) -> Vec<NativeOperation> {
        guard(&self.calls).clone()
    }

    /// Number of times `operation` was invoked
    pub fn call_count(&self, operation: NativeOperation) -> usize {
        guard(&self.calls).iter().filter(|op| **op == operation).count()
    }

    /// Load keys of hives currently loaded
    pub fn loaded_hives(&self) -> Vec<String> {
        let mut keys: Vec<_> = guard(&self.hives).keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Parse a hive file
    pub fn read_hive(path: &Path) -> Result<SimulatedHive> {
        let content = fs::read(path)?;
        if content.iter().all(u8::is_ascii_whitespace) {
            return Ok(SimulatedHive::new());
        }
        Ok(serde_json::from_slice(&content)?)
    }

    fn begin(&self, operation: NativeOperation) -> Result<()> {
        guard(&self.calls).push(operation);
        let injected = guard(&self.failures)
            .get_mut(&operation)
            .and_then(VecDeque::pop_front);
        match injected {
            Some(code) => Err(failure(operation, code, "injected failure")),
            None => Ok(()),
        }
    }

    fn load_state(&self) -> Result<Vec<SimulatedMount>> {
        match fs::read(&self.state_file) {
            Ok(content) => Ok(serde_json::from_slice(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn save_state(&self, mounts: &[SimulatedMount]) -> Result<()> {
        write_json_atomic(&self.state_file, &mounts)
    }

    fn hive_op<T>(
        &self,
        load_key: &str,
        f: impl FnOnce(&mut SimulatedHive) -> Result<T>,
    ) -> Result<T> {
        self.begin(NativeOperation::HiveEdit)?;
        let mut hives = guard(&self.hives);
        let hive = hives.get_mut(load_key).ok_or_else(|| {
            failure(
                NativeOperation::HiveEdit,
                Some(2),
                format!("HKLM\\{} is not loaded", load_key),
            )
        })?;
        f(&mut hive.data)
    }
}

impl ImageServicer for SimulatedBackend {
    fn name(&self) -> &str {
        TOOL
    }

    fn supports(&self, _format: ImageFormat) -> bool {
        true
    }

    fn mount(&self, image: &ImageReference, mount_dir: &Path) -> Result<()> {
        self.begin(NativeOperation::Mount)?;
        let _state = guard(&self.state_lock);
        let mut mounts = self.load_state()?;

        let image_key = normalize_path(image.path());
        let dir_key = normalize_path(mount_dir);
        if mounts.iter().any(|m| normalize_path(&m.mount_dir) == dir_key) {
            return Err(failure(
                NativeOperation::Mount,
                Some(0xC142_0127_u32 as i32),
                format!("{} is already a mount point", mount_dir.display()),
            ));
        }
        if mounts.iter().any(|m| normalize_path(&m.image_path) == image_key) {
            return Err(failure(
                NativeOperation::Mount,
                Some(0xC142_0127_u32 as i32),
                format!("{} is already mounted", image.path().display()),
            ));
        }

        fs::create_dir_all(mount_dir)?;
        if fs::read_dir(mount_dir)?.next().is_some() {
            return Err(failure(
                NativeOperation::Mount,
                Some(0xC142_0127_u32 as i32),
                format!("mount directory {} is not empty", mount_dir.display()),
            ));
        }

        let files = match SimulatedImage::read(image.path()) {
            Ok(contents) => contents
                .index(image.index())
                .ok_or_else(|| {
                    failure(
                        NativeOperation::Mount,
                        Some(0x8007_0057_u32 as i32),
                        format!("index {} not found in {}", image.index(), image.path().display()),
                    )
                })?
                .files
                .clone(),
            Err(e) => {
                debug!(
                    "{} is not a simulated image ({}); mounting empty",
                    image.path().display(),
                    e
                );
                BTreeMap::new()
            }
        };

        for (relative, content) in &files {
            let target = mount_dir.join(relative);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&target, content)?;
        }

        mounts.push(SimulatedMount {
            mount_dir: mount_dir.to_path_buf(),
            image_path: image.path().to_path_buf(),
            index: image.index(),
            baseline: files,
        });
        self.save_state(&mounts)?;
        info!("Simulated mount of {} at {}", image, mount_dir.display());
        Ok(())
    }

    fn unmount(&self, mount_dir: &Path, commit: bool) -> Result<()> {
        let operation = if commit {
            NativeOperation::Commit
        } else {
            NativeOperation::Discard
        };
        self.begin(operation)?;
        let _state = guard(&self.state_lock);
        let mut mounts = self.load_state()?;

        let dir_key = normalize_path(mount_dir);
        let position = mounts
            .iter()
            .position(|m| normalize_path(&m.mount_dir) == dir_key)
            .ok_or_else(|| {
                failure(
                    operation,
                    Some(1),
                    format!("no image is mounted at {}", mount_dir.display()),
                )
            })?;
        let mount = mounts.remove(position);

        if mount_dir.is_dir() {
            if commit {
                let current = read_tree(mount_dir)?;
                if current != mount.baseline {
                    let mut contents = SimulatedImage::read(&mount.image_path).unwrap_or_default();
                    match contents.images.iter_mut().find(|i| i.index == mount.index) {
                        Some(entry) => entry.files = current,
                        None => contents.images.push(SimulatedIndex {
                            index: mount.index,
                            name: format!("Index {}", mount.index),
                            files: current,
                        }),
                    }
                    contents.write(&mount.image_path)?;
                    info!("Simulated commit wrote {}", mount.image_path.display());
                } else {
                    debug!("Simulated commit: no changes under {}", mount_dir.display());
                }
            }
            clear_dir(mount_dir)?;
        }

        self.save_state(&mounts)?;
        Ok(())
    }

    fn mounted_images(&self) -> Result<Vec<MountedImageInfo>> {
        self.begin(NativeOperation::ListMounts)?;
        let _state = guard(&self.state_lock);
        Ok(self
            .load_state()?
            .into_iter()
            .map(|m| MountedImageInfo {
                status: if m.mount_dir.is_dir() {
                    MountStatus::Ok
                } else {
                    MountStatus::Invalid
                },
                mount_dir: m.mount_dir,
                image_path: m.image_path,
                index: m.index,
            })
            .collect())
    }

    fn cleanup(&self) -> Result<()> {
        self.begin(NativeOperation::Cleanup)?;
        let _state = guard(&self.state_lock);
        let mut mounts = self.load_state()?;
        let before = mounts.len();
        mounts.retain(|m| m.mount_dir.is_dir());
        if mounts.len() != before {
            info!("Simulated cleanup removed {} orphaned mounts", before - mounts.len());
        }
        self.save_state(&mounts)
    }

    fn set_feature(&self, mount_dir: &Path, feature: &str, enable: bool) -> Result<()> {
        self.begin(NativeOperation::FeatureToggle)?;
        let path = mount_dir.join(FEATURES_FILE);
        let mut features: BTreeMap<String, bool> = match fs::read(&path) {
            Ok(content) => serde_json::from_slice(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        if !mount_dir.join("Windows").is_dir() {
            return Err(failure(
                NativeOperation::FeatureToggle,
                Some(0x8007_0002_u32 as i32),
                format!("{} is not a Windows image", mount_dir.display()),
            ));
        }
        features.insert(feature.to_string(), enable);
        write_json_atomic(&path, &features)
    }
}

impl HiveLoader for SimulatedBackend {
    fn name(&self) -> &str {
        TOOL
    }

    fn load(&self, load_key: &str, backing: &Path) -> Result<()> {
        self.begin(NativeOperation::HiveLoad)?;
        let mut hives = guard(&self.hives);
        if hives.contains_key(load_key)
            || hives
                .values()
                .any(|h| normalize_path(&h.backing) == normalize_path(backing))
        {
            return Err(failure(
                NativeOperation::HiveLoad,
                Some(5),
                format!("access denied loading {}", backing.display()),
            ));
        }
        if !backing.is_file() {
            return Err(failure(
                NativeOperation::HiveLoad,
                Some(2),
                format!("the system cannot find {}", backing.display()),
            ));
        }
        let data = Self::read_hive(backing).map_err(|e| {
            failure(NativeOperation::HiveLoad, Some(1009), format!("corrupt hive: {}", e))
        })?;
        hives.insert(
            load_key.to_string(),
            LoadedHive {
                backing: backing.to_path_buf(),
                data,
            },
        );
        Ok(())
    }

    fn unload(&self, load_key: &str) -> Result<()> {
        self.begin(NativeOperation::HiveUnload)?;
        let mut hives = guard(&self.hives);
        let hive = hives.remove(load_key).ok_or_else(|| {
            failure(
                NativeOperation::HiveUnload,
                Some(87),
                format!("HKLM\\{} is not loaded", load_key),
            )
        })?;
        write_json_atomic(&hive.backing, &hive.data)
    }

    fn set_value(&self, load_key: &str, key: &str, name: &str, value: &RegValue) -> Result<()> {
        self.hive_op(load_key, |hive| {
            hive.entry(normalize_key(key))
                .or_default()
                .insert(name.to_string(), value.clone());
            Ok(())
        })
    }

    fn delete_value(&self, load_key: &str, key: &str, name: &str) -> Result<()> {
        self.hive_op(load_key, |hive| {
            hive.get_mut(&normalize_key(key))
                .and_then(|values| values.remove(name))
                .map(|_| ())
                .ok_or_else(|| {
                    failure(
                        NativeOperation::HiveEdit,
                        Some(1),
                        format!("unable to find value {} under {}", name, key),
                    )
                })
        })
    }

    fn delete_key(&self, load_key: &str, key: &str) -> Result<()> {
        let key = normalize_key(key);
        let prefix = format!("{}\\", key);
        self.hive_op(load_key, |hive| {
            let before = hive.len();
            hive.retain(|k, _| *k != key && !k.starts_with(&prefix));
            if hive.len() == before {
                return Err(failure(
                    NativeOperation::HiveEdit,
                    Some(1),
                    format!("unable to find key {}", key),
                ));
            }
            Ok(())
        })
    }
}

impl std::fmt::Debug for SimulatedBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedBackend")
            .field("state_file", &self.state_file)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::{HashAlgorithm, hash_file};
    use tempfile::TempDir;

    fn setup() -> (TempDir, SimulatedBackend, ImageReference) {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("A.wim");
        SimulatedImage::single("Pro", SimulatedImage::windows_skeleton())
            .write(&path)
            .unwrap();
        let backend = SimulatedBackend::new(&temp_dir.path().join("state"));
        let image = ImageReference::new(&path, 1, None).unwrap();
        (temp_dir, backend, image)
    }

    #[test]
    fn test_mount_discard_leaves_image_untouched() {
        let (temp_dir, backend, image) = setup();
        let before = hash_file(HashAlgorithm::Sha256, image.path()).unwrap();
        let mount_dir = temp_dir.path().join("mnt");

        backend.mount(&image, &mount_dir).unwrap();
        assert!(mount_dir.join("Windows/explorer.exe").is_file());
        assert_eq!(backend.mounted_images().unwrap().len(), 1);

        fs::write(mount_dir.join("Windows/new.txt"), "x").unwrap();
        backend.unmount(&mount_dir, false).unwrap();

        assert!(fs::read_dir(&mount_dir).unwrap().next().is_none());
        assert_eq!(hash_file(HashAlgorithm::Sha256, image.path()).unwrap(), before);
        assert!(backend.mounted_images().unwrap().is_empty());
    }

    #[test]
    fn test_commit_writes_changes_only_when_changed() {
        let (temp_dir, backend, image) = setup();
        let before = hash_file(HashAlgorithm::Sha256, image.path()).unwrap();
        let mount_dir = temp_dir.path().join("mnt");

        backend.mount(&image, &mount_dir).unwrap();
        backend.unmount(&mount_dir, true).unwrap();
        assert_eq!(hash_file(HashAlgorithm::Sha256, image.path()).unwrap(), before);

        backend.mount(&image, &mount_dir).unwrap();
        fs::write(mount_dir.join("Windows/new.txt"), "x").unwrap();
        backend.unmount(&mount_dir, true).unwrap();

        let contents = SimulatedImage::read(image.path()).unwrap();
        assert_eq!(contents.index(1).unwrap().files["Windows/new.txt"], "x");
    }

    #[test]
    fn test_corrupt_image_mounts_empty() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("bad.wim");
        fs::write(&path, b"MSWIM\0\0\0garbage").unwrap();
        let backend = SimulatedBackend::new(temp_dir.path());
        let image = ImageReference::new(&path, 1, None).unwrap();
        let mount_dir = temp_dir.path().join("mnt");

        backend.mount(&image, &mount_dir).unwrap();
        assert!(fs::read_dir(&mount_dir).unwrap().next().is_none());
    }

    #[test]
    fn test_same_image_cannot_mount_twice() {
        let (temp_dir, backend, image) = setup();
        backend.mount(&image, &temp_dir.path().join("m1")).unwrap();
        let second = backend.mount(&image, &temp_dir.path().join("m2"));
        assert!(matches!(second, Err(Error::NativeTool(_))));
    }

    #[test]
    fn test_mount_state_survives_new_instance() {
        let (temp_dir, backend, image) = setup();
        let mount_dir = temp_dir.path().join("mnt");
        backend.mount(&image, &mount_dir).unwrap();
        drop(backend);

        let fresh = SimulatedBackend::new(&temp_dir.path().join("state"));
        let mounts = fresh.mounted_images().unwrap();
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].mount_dir, mount_dir);
        fresh.unmount(&mount_dir, false).unwrap();
    }

    #[test]
    fn test_injected_failure_is_consumed() {
        let (temp_dir, backend, image) = setup();
        backend.fail_next(NativeOperation::Mount, Some(170));

        let err = backend.mount(&image, &temp_dir.path().join("mnt")).unwrap_err();
        assert!(err.is_transient());
        backend.mount(&image, &temp_dir.path().join("mnt")).unwrap();
        assert_eq!(backend.call_count(NativeOperation::Mount), 2);
    }

    #[test]
    fn test_hive_edit_roundtrip_through_unload() {
        let (temp_dir, backend, image) = setup();
        let mount_dir = temp_dir.path().join("mnt");
        backend.mount(&image, &mount_dir).unwrap();
        let backing = mount_dir.join("Windows/System32/config/SOFTWARE");

        backend.load("WIMSMITH_SOFTWARE", &backing).unwrap();
        assert!(backend.load("OTHER", &backing).is_err());
        backend
            .set_value(
                "WIMSMITH_SOFTWARE",
                "\\Policies\\DataCollection",
                "AllowTelemetry",
                &RegValue::Dword(0),
            )
            .unwrap();
        backend.unload("WIMSMITH_SOFTWARE").unwrap();
        assert!(backend.loaded_hives().is_empty());

        let hive = SimulatedBackend::read_hive(&backing).unwrap();
        assert_eq!(
            hive["Policies\\DataCollection"]["AllowTelemetry"],
            RegValue::Dword(0)
        );
    }

    #[test]
    fn test_delete_key_removes_subkeys() {
        let (temp_dir, backend, image) = setup();
        let mount_dir = temp_dir.path().join("mnt");
        backend.mount(&image, &mount_dir).unwrap();
        backend
            .load("K", &mount_dir.join("Windows/System32/config/SYSTEM"))
            .unwrap();
        backend.set_value("K", "A\\B", "x", &RegValue::Dword(1)).unwrap();
        backend.set_value("K", "A", "y", &RegValue::Dword(1)).unwrap();
        backend.set_value("K", "AB", "z", &RegValue::Dword(1)).unwrap();

        backend.delete_key("K", "A").unwrap();
        assert!(backend.delete_key("K", "A").is_err());
        backend.delete_value("K", "AB", "z").unwrap();
        backend.unload("K").unwrap();
    }

    #[test]
    fn test_feature_toggle_persists_in_mount() {
        let (temp_dir, backend, image) = setup();
        let mount_dir = temp_dir.path().join("mnt");
        backend.mount(&image, &mount_dir).unwrap();

        backend.set_feature(&mount_dir, "SMB1Protocol", false).unwrap();
        let features: BTreeMap<String, bool> =
            serde_json::from_slice(&fs::read(mount_dir.join(FEATURES_FILE)).unwrap()).unwrap();
        assert_eq!(features.get("SMB1Protocol"), Some(&false));
    }
}
