//! Configuration.
//!
//! rekindle configuration is loaded from multiple sources with the
//! following priority:
//!
//! 1. Environment variables (`REKINDLE_*`)
//! 2. Configuration file (TOML)
//! 3. Default values
//!
//! ## Example configuration file
//!
//! ```toml
//! snapshots_base_path = "/var/lib/rekindle/snapshots"
//! chunk_size = 1048576
//! keepalive_seconds = 3600
//! use_remote_storage = true
//!
//! [object_store]
//! endpoint = "http://localhost:9000"
//! bucket = "snapshots"
//! access_key = "ROOTUSER"
//! secret_key = "CHANGEME123"
//!
//! [vm]
//! vcpu_count = 2
//! mem_size_mib = 2048
//! ```

use std::path::PathBuf;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use rekindle_store::S3Config;
use rekindle_vmm::MachineSpec;
use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base directory for materialized snapshots.
    pub snapshots_base_path: PathBuf,
    /// Memory-chunk size in bytes.
    pub chunk_size: usize,
    /// Seconds a CLI-driven VM stays up before teardown.
    pub keepalive_seconds: u64,
    /// Whether snapshots are uploaded to / downloaded from remote storage.
    pub use_remote_storage: bool,
    /// Object store connection settings.
    pub object_store: S3Config,
    /// Machine shape for new VMs.
    pub vm: VmDefaults,
    /// Per-call deadline for hypervisor operations, in seconds.
    pub vmm_timeout_seconds: u64,
    /// Registry credentials injected into cold-booted VMs, if any.
    pub registry: Option<RegistryCredentials>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            snapshots_base_path: PathBuf::from("/var/lib/rekindle/snapshots"),
            chunk_size: rekindle_snapshot::DEFAULT_CHUNK_SIZE,
            keepalive_seconds: 3600,
            use_remote_storage: false,
            object_store: S3Config::default(),
            vm: VmDefaults::default(),
            vmm_timeout_seconds: 30,
            registry: None,
        }
    }
}

impl Config {
    /// Loads configuration from the environment over defaults.
    pub fn load() -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Env::prefixed("REKINDLE_").split("__"))
            .extract()
    }

    /// Loads configuration from a specific file, still honoring environment
    /// overrides.
    pub fn load_from(path: impl AsRef<std::path::Path>) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("REKINDLE_").split("__"))
            .extract()
    }

    /// Machine spec for new VMs.
    #[must_use]
    pub fn machine_spec(&self) -> MachineSpec {
        MachineSpec {
            vcpu_count: self.vm.vcpu_count,
            mem_size_mib: self.vm.mem_size_mib,
            ..MachineSpec::default()
        }
    }

    /// Coordinator settings derived from this configuration.
    #[must_use]
    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            orchestrated: true,
            use_remote_storage: self.use_remote_storage,
            vmm_timeout: Duration::from_secs(self.vmm_timeout_seconds),
            machine: self.machine_spec(),
            registry: self.registry.clone(),
        }
    }
}

/// Default machine shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VmDefaults {
    /// Number of virtual CPUs.
    pub vcpu_count: u32,
    /// Guest memory in MiB.
    pub mem_size_mib: u64,
}

impl Default for VmDefaults {
    fn default() -> Self {
        Self {
            vcpu_count: 2,
            mem_size_mib: 2048,
        }
    }
}

/// Registry credentials pushed into cold-booted VMs so the in-guest agent
/// can pull private images.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryCredentials {
    /// Registry host the credentials apply to.
    pub host: String,
    /// Username.
    pub username: String,
    /// Password or token.
    pub password: String,
}

impl RegistryCredentials {
    /// Renders the metadata blob consumed by the in-guest agent.
    #[must_use]
    pub fn metadata_blob(&self) -> String {
        serde_json::json!({
            "docker-credentials": {
                &self.host: {
                    "username": &self.username,
                    "password": &self.password,
                }
            }
        })
        .to_string()
    }
}

/// Coordinator construction settings.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// When false, all hypervisor, snapshot-manager and network calls are
    /// skipped and the coordinator maintains its table with synthetic VMs.
    pub orchestrated: bool,
    /// Whether a snapshot miss may be served by downloading from remote
    /// storage.
    pub use_remote_storage: bool,
    /// Per-call deadline for hypervisor operations.
    pub vmm_timeout: Duration,
    /// Machine shape for new VMs.
    pub machine: MachineSpec,
    /// Registry credentials injected on the cold path, if any.
    pub registry: Option<RegistryCredentials>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            orchestrated: true,
            use_remote_storage: false,
            vmm_timeout: Duration::from_secs(30),
            machine: MachineSpec::default(),
            registry: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.chunk_size, rekindle_snapshot::DEFAULT_CHUNK_SIZE);
        assert_eq!(config.vm.vcpu_count, 2);
        assert!(!config.use_remote_storage);
    }

    #[test]
    fn registry_metadata_blob_shape() {
        let creds = RegistryCredentials {
            host: "registry.example.com".to_string(),
            username: "u".to_string(),
            password: "p".to_string(),
        };
        let blob = creds.metadata_blob();
        let parsed: serde_json::Value = serde_json::from_str(&blob).unwrap();
        assert_eq!(
            parsed["docker-credentials"]["registry.example.com"]["username"],
            "u"
        );
    }

    #[test]
    fn load_from_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rekindle.toml");
        std::fs::write(
            &path,
            "chunk_size = 4096\nuse_remote_storage = true\n[object_store]\nbucket = \"b\"\n",
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.chunk_size, 4096);
        assert!(config.use_remote_storage);
        assert_eq!(config.object_store.bucket, "b");
        // Untouched settings keep their defaults.
        assert_eq!(config.keepalive_seconds, 3600);
    }
}
