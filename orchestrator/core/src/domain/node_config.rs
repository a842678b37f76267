// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Daemon Configuration Types
//
// Defines the configuration schema for a Lodge host daemon:
// - Kubernetes-style manifest format (apiVersion/kind/metadata/spec)
// - REST listener settings
// - Operation retention and wait defaults
// - Migration channel timeouts and rsync options
// - Host idmap pool discovery
// - Instance storage location and observability

use crate::domain::repository::StorageBackend;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const API_VERSION: &str = "lodge.dev/v1";
pub const KIND: &str = "DaemonConfig";

/// Top-level Kubernetes-style daemon configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfigManifest {
    /// API version (must be "lodge.dev/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "DaemonConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    pub spec: DaemonConfigSpec,
}

/// Manifest metadata (Kubernetes-style)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    /// Human-readable host name
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

/// Daemon configuration specification (content under spec:)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfigSpec {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub operations: OperationsConfig,

    #[serde(default)]
    pub migration: MigrationConfig,

    #[serde(default)]
    pub idmap: IdmapPoolConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub observability: Option<ObservabilityConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    #[serde(default = "default_api_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_api_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationsConfig {
    /// Seconds a finished operation stays queryable
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,

    /// Upper bound applied to `wait` requests without a timeout; 0 = unbounded
    #[serde(default)]
    pub default_wait_secs: u64,

    /// Seconds a created operation may stay Pending before it is cancelled
    #[serde(default = "default_pending_timeout_secs")]
    pub pending_timeout_secs: u64,
}

impl Default for OperationsConfig {
    fn default() -> Self {
        Self {
            retention_secs: default_retention_secs(),
            default_wait_secs: 0,
            pending_timeout_secs: default_pending_timeout_secs(),
        }
    }
}

impl OperationsConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn pending_timeout(&self) -> Duration {
        Duration::from_secs(self.pending_timeout_secs)
    }

    pub fn default_wait(&self) -> Option<Duration> {
        (self.default_wait_secs > 0).then(|| Duration::from_secs(self.default_wait_secs))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Seconds to wait for the peer to open each channel
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Seconds of silence tolerated on "control"
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_rsync_binary")]
    pub rsync_binary: String,

    /// Optional --bwlimit value in KiB/s
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bwlimit: Option<String>,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            idle_timeout_secs: default_idle_timeout(),
            rsync_binary: default_rsync_binary(),
            bwlimit: None,
        }
    }
}

impl MigrationConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdmapPoolConfig {
    /// Service account whose subordinate ranges form the pool
    #[serde(default = "default_idmap_user")]
    pub username: String,

    #[serde(default = "default_subuid_path")]
    pub subuid_path: PathBuf,

    #[serde(default = "default_subgid_path")]
    pub subgid_path: PathBuf,
}

impl Default for IdmapPoolConfig {
    fn default() -> Self {
        Self {
            username: default_idmap_user(),
            subuid_path: default_subuid_path(),
            subgid_path: default_subgid_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_instances_dir")]
    pub instances_dir: PathBuf,

    /// "file" persists instance records, "memory" keeps them in process
    #[serde(default = "default_storage_backend")]
    pub backend: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            instances_dir: default_instances_dir(),
            backend: default_storage_backend(),
        }
    }
}

impl StorageConfig {
    pub fn repository_backend(&self) -> StorageBackend {
        match self.backend.as_str() {
            "memory" => StorageBackend::InMemory,
            _ => StorageBackend::File,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MetricsConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (e.g., "info", "debug", "trace")
    #[serde(default = "default_log_level")]
    pub level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Prometheus listener port
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_true() -> bool {
    true
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8443
}

fn default_retention_secs() -> u64 {
    5
}

fn default_pending_timeout_secs() -> u64 {
    300
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_idle_timeout() -> u64 {
    30
}

fn default_rsync_binary() -> String {
    "rsync".to_string()
}

fn default_idmap_user() -> String {
    "root".to_string()
}

fn default_subuid_path() -> PathBuf {
    PathBuf::from("/etc/subuid")
}

fn default_subgid_path() -> PathBuf {
    PathBuf::from("/etc/subgid")
}

fn default_instances_dir() -> PathBuf {
    PathBuf::from("/var/lib/lodge/instances")
}

fn default_storage_backend() -> String {
    "file".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9100
}

impl Default for DaemonConfigManifest {
    fn default() -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "lodge-node".to_string());

        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: hostname,
                version: Some("1.0.0".to_string()),
                labels: None,
            },
            spec: DaemonConfigSpec::default(),
        }
    }
}

impl DaemonConfigManifest {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to YAML file
    pub fn to_yaml_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Discover configuration file using precedence order
    /// 1. LODGE_CONFIG_PATH environment variable
    /// 2. ./lodge-config.yaml (working directory)
    /// 3. ~/.lodge/config.yaml (user home)
    /// 4. /etc/lodge/config.yaml (system)
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("LODGE_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./lodge-config.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".lodge").join("config.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        let system_config = PathBuf::from("/etc/lodge/config.yaml");
        if system_config.exists() {
            return Some(system_config);
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        // Explicit CLI path (fail if missing/invalid)
        if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            let mut config = Self::from_yaml_file(&path).map_err(|e| {
                anyhow::anyhow!("Failed to load config at {:?}: {}", path, e)
            })?;
            config.apply_env_overrides();
            return Ok(config);
        }

        if let Some(config_path) = Self::discover_config() {
            tracing::info!("Loading configuration from discovered path: {:?}", config_path);
            let mut config = Self::from_yaml_file(config_path)?;
            config.apply_env_overrides();
            Ok(config)
        } else {
            tracing::warn!("No configuration file found in standard locations. Using defaults.");
            let mut config = Self::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("LODGE_PORT") {
            match val.parse::<u16>() {
                Ok(port) => {
                    tracing::info!("Environment override: LODGE_PORT={}", port);
                    self.spec.server.port = port;
                }
                Err(_) => {
                    tracing::warn!("Invalid value for LODGE_PORT: '{}'. Ignoring.", val);
                }
            }
        }

        if let Ok(val) = std::env::var("LODGE_INSTANCES_DIR") {
            tracing::info!("Environment override: LODGE_INSTANCES_DIR={}", val);
            self.spec.storage.instances_dir = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("LODGE_IDMAP_USER") {
            tracing::info!("Environment override: LODGE_IDMAP_USER={}", val);
            self.spec.idmap.username = val;
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_version != API_VERSION {
            anyhow::bail!(
                "Invalid apiVersion: '{}'. Must be '{}'",
                self.api_version,
                API_VERSION
            );
        }

        if self.kind != KIND {
            anyhow::bail!("Invalid kind: '{}'. Must be '{}'", self.kind, KIND);
        }

        if self.metadata.name.is_empty() {
            anyhow::bail!("metadata.name cannot be empty");
        }

        let migration = &self.spec.migration;
        if migration.connect_timeout_secs == 0 {
            anyhow::bail!("spec.migration.connect_timeout_secs must be greater than 0");
        }
        if migration.idle_timeout_secs == 0 {
            anyhow::bail!("spec.migration.idle_timeout_secs must be greater than 0");
        }
        if migration.rsync_binary.is_empty() {
            anyhow::bail!("spec.migration.rsync_binary cannot be empty");
        }
        if let Some(limit) = &migration.bwlimit {
            if limit.parse::<u64>().is_err() {
                anyhow::bail!("spec.migration.bwlimit must be a number of KiB/s, got '{}'", limit);
            }
        }

        if self.spec.idmap.username.is_empty() {
            anyhow::bail!("spec.idmap.username cannot be empty");
        }

        if self.spec.storage.instances_dir.as_os_str().is_empty() {
            anyhow::bail!("spec.storage.instances_dir cannot be empty");
        }
        if !matches!(self.spec.storage.backend.as_str(), "file" | "memory") {
            anyhow::bail!(
                "Invalid spec.storage.backend: '{}'. Must be 'file' or 'memory'",
                self.spec.storage.backend
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_manifest() {
        let manifest = DaemonConfigManifest::default();
        assert_eq!(manifest.api_version, "lodge.dev/v1");
        assert_eq!(manifest.kind, "DaemonConfig");
        assert_eq!(manifest.spec.operations.retention(), Duration::from_secs(5));
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn test_yaml_roundtrip() {
        let yaml = r#"
apiVersion: lodge.dev/v1
kind: DaemonConfig
metadata:
  name: host-a
spec:
  server:
    port: 9443
  migration:
    idle_timeout_secs: 5
    bwlimit: "2048"
  idmap:
    username: lodge
  storage:
    instances_dir: /srv/lodge
    backend: memory
"#;
        let manifest = DaemonConfigManifest::from_yaml_str(yaml).unwrap();
        assert_eq!(manifest.spec.server.port, 9443);
        assert_eq!(manifest.spec.server.bind_address, "0.0.0.0");
        assert_eq!(manifest.spec.migration.idle_timeout(), Duration::from_secs(5));
        assert_eq!(manifest.spec.migration.connect_timeout_secs, 10);
        assert_eq!(manifest.spec.idmap.username, "lodge");
        assert_eq!(manifest.spec.idmap.subuid_path, PathBuf::from("/etc/subuid"));
        assert_eq!(manifest.spec.storage.instances_dir, PathBuf::from("/srv/lodge"));
        assert_eq!(manifest.spec.storage.repository_backend(), StorageBackend::InMemory);
        assert!(manifest.validate().is_ok());

        let rendered = serde_yaml::to_string(&manifest).unwrap();
        let again = DaemonConfigManifest::from_yaml_str(&rendered).unwrap();
        assert_eq!(again.spec.migration.bwlimit.as_deref(), Some("2048"));
    }

    #[test]
    fn test_validation() {
        let mut manifest = DaemonConfigManifest::default();
        manifest.kind = "NodeConfig".to_string();
        assert!(manifest.validate().is_err());

        let mut manifest = DaemonConfigManifest::default();
        manifest.spec.migration.idle_timeout_secs = 0;
        assert!(manifest.validate().is_err());

        let mut manifest = DaemonConfigManifest::default();
        manifest.spec.storage.backend = "postgres".to_string();
        assert!(manifest.validate().is_err());

        let mut manifest = DaemonConfigManifest::default();
        manifest.spec.migration.bwlimit = Some("fast".to_string());
        assert!(manifest.validate().is_err());
    }
}
