// src/modules/capability.rs

//! Capabilities a module may require, and what the host provides
//!
//! The set is closed: every module declares exactly one capability and the
//! environment is probed once at startup.

use crate::config::{BackendKind, EngineConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use strum::IntoEnumIterator;
use tracing::debug;

/// What a module needs from the host to run
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
    strum_macros::EnumIter,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case", ascii_case_insensitive)]
pub enum Capability {
    /// Offline hive loading and editing (`reg.exe`)
    Registry,
    /// Optional feature toggling (`dism`)
    FeatureToggle,
    /// Service start-type configuration, done through the SYSTEM hive
    ServiceConfig,
    /// Package installation through an installer backend
    PackageInstall,
    /// Plain file edits inside the mount directory
    FileSystem,
}

/// Capabilities available on this host
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Environment {
    available: BTreeSet<Capability>,
    installers: Vec<String>,
}

impl Environment {
    /// Probe the host for the tools behind each capability
    ///
    /// A simulated backend grants everything.
    pub fn detect(config: &EngineConfig) -> Self {
        if config.backend == BackendKind::Simulated {
            return Self::all().with_installers(config.installers.clone());
        }

        let mut available = BTreeSet::from([Capability::FileSystem]);
        if which::which("reg").is_ok() {
            available.insert(Capability::Registry);
            available.insert(Capability::ServiceConfig);
        }
        if which::which("dism").is_ok() {
            available.insert(Capability::FeatureToggle);
        }

        let installers: Vec<String> = config
            .installers
            .iter()
            .filter(|name| which::which(name.as_str()).is_ok())
            .cloned()
            .collect();
        if !installers.is_empty() {
            available.insert(Capability::PackageInstall);
        }

        debug!("Detected capabilities: {:?}, installers: {:?}", available, installers);
        Self {
            available,
            installers,
        }
    }

    /// Every capability, no installers
    pub fn all() -> Self {
        Self {
            available: Capability::iter().collect(),
            installers: Vec::new(),
        }
    }

    /// Only the given capabilities
    pub fn with_capabilities(capabilities: impl IntoIterator<Item = Capability>) -> Self {
        Self {
            available: capabilities.into_iter().collect(),
            installers: Vec::new(),
        }
    }

    /// Set the installer backends modules may use
    pub fn with_installers(mut self, installers: Vec<String>) -> Self {
        self.installers = installers;
        self
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.available.contains(&capability)
    }

    pub fn capabilities(&self) -> impl Iterator<Item = Capability> + '_ {
        self.available.iter().copied()
    }

    pub fn installers(&self) -> &[String] {
        &self.installers
    }

    /// Why a module with this capability is excluded, if it is
    pub fn exclusion_reason(&self, capability: Capability) -> Option<String> {
        if self.supports(capability) {
            return None;
        }
        Some(match capability {
            Capability::Registry | Capability::ServiceConfig => {
                format!("capability {} unavailable: reg not found", capability)
            }
            Capability::FeatureToggle => {
                format!("capability {} unavailable: dism not found", capability)
            }
            Capability::PackageInstall => format!(
                "capability {} unavailable: no installer backend found",
                capability
            ),
            Capability::FileSystem => format!("capability {} unavailable", capability),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_capability_names() {
        assert_eq!(Capability::FeatureToggle.to_string(), "feature-toggle");
        assert_eq!(
            "package-install".parse::<Capability>().unwrap(),
            Capability::PackageInstall
        );
        assert!("network".parse::<Capability>().is_err());
    }

    #[test]
    fn test_simulated_environment_grants_everything() {
        let config = EngineConfig::new(PathBuf::from("/tmp/state"))
            .with_backend(BackendKind::Simulated);
        let env = Environment::detect(&config);
        assert!(Capability::iter().all(|c| env.supports(c)));
        assert_eq!(env.installers(), ["winget", "choco"]);
    }

    #[test]
    fn test_exclusion_reason() {
        let env = Environment::with_capabilities([Capability::Registry]);
        assert!(env.exclusion_reason(Capability::Registry).is_none());
        let reason = env.exclusion_reason(Capability::PackageInstall).unwrap();
        assert!(reason.contains("no installer backend"));
    }

    #[test]
    fn test_filesystem_always_detected() {
        let env = Environment::detect(&EngineConfig::new(PathBuf::from("/tmp/state")));
        assert!(env.supports(Capability::FileSystem));
    }
}
