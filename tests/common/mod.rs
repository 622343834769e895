// tests/common/mod.rs

//! Shared test utilities and helpers for integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use wimsmith::hash::hash_file;
use wimsmith::native::simulated::{SimulatedHive, FEATURES_FILE};
use wimsmith::native::{SimulatedBackend, SimulatedImage};
use wimsmith::{
    BackendKind, EngineConfig, HashAlgorithm, ModuleRegistry, NativeBackend, Orchestrator,
    ResourceScopeManager,
};

/// A simulated host: state directory, backend and one image `A.wim`
///
/// Keep the struct alive for the duration of the test; dropping it removes
/// the temp directory.
pub struct TestHost {
    pub temp_dir: TempDir,
    pub sim: Arc<SimulatedBackend>,
    pub config: EngineConfig,
    pub image: PathBuf,
}

/// Create a host with a single-index Windows image at `A.wim`
pub fn setup_host() -> TestHost {
    let temp_dir = tempfile::tempdir().unwrap();
    let state = temp_dir.path().join("state");
    let mut config = EngineConfig::new(&state).with_backend(BackendKind::Simulated);
    config.native.retry_backoff_ms = 0;

    let image = temp_dir.path().join("A.wim");
    write_windows_image(&image);

    TestHost {
        sim: Arc::new(SimulatedBackend::new(&state)),
        temp_dir,
        config,
        image,
    }
}

/// Write a fresh simulated Windows image
pub fn write_windows_image(path: &Path) {
    SimulatedImage::single("Windows 11 Pro", SimulatedImage::windows_skeleton())
        .write(path)
        .unwrap();
}

impl TestHost {
    /// Orchestrator over this host's backend with its own lease table
    pub fn orchestrator(&self, registry: ModuleRegistry) -> Orchestrator {
        Orchestrator::with_backend(
            &self.config,
            registry,
            NativeBackend::simulated(self.sim.clone()),
        )
        .with_leases(ResourceScopeManager::isolated())
    }

    /// Path of another image inside the host's temp directory
    pub fn extra_image(&self, name: &str) -> PathBuf {
        let path = self.temp_dir.path().join(name);
        write_windows_image(&path);
        path
    }

    pub fn hash(&self) -> String {
        hash_file(HashAlgorithm::Sha256, &self.image).unwrap().hash
    }

    /// Offline hive contents stored in index 1 of `image`
    pub fn stored_hive(&self, image: &Path, relative: &str) -> SimulatedHive {
        let contents = SimulatedImage::read(image).unwrap();
        let files = &contents.index(1).unwrap().files;
        let raw = files.get(relative).map(String::as_str).unwrap_or("");
        if raw.trim().is_empty() {
            return SimulatedHive::new();
        }
        serde_json::from_str(raw).unwrap()
    }

    /// Feature states stored in index 1 of `image`
    pub fn stored_features(&self, image: &Path) -> std::collections::BTreeMap<String, bool> {
        let contents = SimulatedImage::read(image).unwrap();
        match contents.index(1).unwrap().files.get(FEATURES_FILE) {
            Some(raw) => serde_json::from_str(raw).unwrap(),
            None => Default::default(),
        }
    }
}

/// Rewrite the creation time of a checkpoint record to `days` ago
///
/// Keeps every later line and re-frames the header with a fresh CRC.
pub fn backdate_checkpoint(checkpoint_dir: &Path, run_id: &str, days: i64) {
    let path = checkpoint_dir.join(format!("{}.ckpt", run_id));
    let content = std::fs::read_to_string(&path).unwrap();
    let mut lines: Vec<String> = content.lines().map(str::to_string).collect();

    let (_, json) = lines[0].split_once('|').unwrap();
    let mut header: serde_json::Value = serde_json::from_str(json).unwrap();
    let created_at = chrono::Utc::now() - chrono::Duration::days(days);
    header["checkpoint"]["created_at"] = serde_json::to_value(created_at).unwrap();
    let json = header.to_string();
    lines[0] = format!("{:08x}|{}", crc32fast::hash(json.as_bytes()), json);

    std::fs::write(&path, lines.join("\n") + "\n").unwrap();
}

/// Above any real pid limit, so never a running process
pub const DEAD_PID: u32 = 0x7fff_fff0;

pub const SOFTWARE_HIVE: &str = "Windows/System32/config/SOFTWARE";
pub const TELEMETRY_KEY: &str = r"Policies\Microsoft\Windows\DataCollection";

/// Catalog used by the catalog-driven tests
pub const CATALOG: &str = r#"
[[module]]
id = "disable_telemetry"
label = "Disable telemetry"
priority = 10
critical = true

[[module.registry]]
hive = "software"
key = 'Policies\Microsoft\Windows\DataCollection'
name = "AllowTelemetry"
value = { type = "dword", data = 0 }

[[module]]
id = "remove_smb1"
label = "Remove SMB1"
priority = 20

[[module.feature]]
name = "SMB1Protocol"
enable = false

[[module]]
id = "audit_marker"
label = "Record customization"
priority = 100
always = true

[[module.registry]]
hive = "software"
key = 'wimsmith'
name = "Customized"
value = { type = "string", data = "yes" }
"#;
