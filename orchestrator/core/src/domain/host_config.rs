// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Host Configuration Types
//
// Defines the configuration schema for a Warden agent host:
// - Kubernetes-style manifest format (apiVersion/kind/metadata/spec)
// - Relational store connection string and pool tuning
// - Realtime server bind address and port
// - Memory sampling cadence, window size and leak threshold
// - Observability (logging, metrics) settings

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::domain::memory::{DEFAULT_LEAK_THRESHOLD_BYTES_PER_SEC, DEFAULT_WINDOW_CAPACITY};
use crate::domain::pool::PoolConfig;

pub const API_VERSION: &str = "warden.dev/v1";
pub const KIND: &str = "HostConfig";

/// Top-level Kubernetes-style host configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// API version (must be "warden.dev/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "HostConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    #[serde(default)]
    pub spec: HostConfigSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostConfigSpec {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub memory: MemoryConfig,

    /// Data directory for the embedded store variant. Recorded and logged;
    /// the relational pool stays the only storage driver.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub observability: Option<ObservabilityConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection string
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default)]
    pub pool: PoolConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Sampler cadence in milliseconds
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,

    /// Number of snapshots retained
    #[serde(default = "default_window")]
    pub window: usize,

    #[serde(default = "default_leak_threshold")]
    pub leak_threshold_bytes_per_sec: f64,

    /// Maintenance tick cadence (idle reap + debug memory log)
    #[serde(default = "default_maintenance_interval_secs")]
    pub maintenance_interval_secs: u64,

    /// Verbose memory-tick logging; also enabled by DEBUG_MEMORY=1
    #[serde(default)]
    pub debug: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: default_sample_interval_ms(),
            window: default_window(),
            leak_threshold_bytes_per_sec: default_leak_threshold(),
            maintenance_interval_secs: default_maintenance_interval_secs(),
            debug: false,
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

    /// Prometheus exporter port
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_true() -> bool {
    true
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_sample_interval_ms() -> u64 {
    5_000
}

fn default_window() -> usize {
    DEFAULT_WINDOW_CAPACITY
}

fn default_leak_threshold() -> f64 {
    DEFAULT_LEAK_THRESHOLD_BYTES_PER_SEC
}

fn default_maintenance_interval_secs() -> u64 {
    600
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: "warden-host".to_string(),
                labels: None,
            },
            spec: HostConfigSpec::default(),
        }
    }
}

impl HostConfig {
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
    /// 1. WARDEN_CONFIG_PATH environment variable
    /// 2. ./warden-config.yaml (working directory)
    /// 3. ~/.warden/config.yaml (user home)
    /// 4. /etc/warden/config.yaml (Unix only)
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("WARDEN_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./warden-config.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".warden").join("config.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        #[cfg(unix)]
        {
            let system_config = PathBuf::from("/etc/warden/config.yaml");
            if system_config.exists() {
                return Some(system_config);
            }
        }

        None
    }

    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        // Explicit CLI path must exist and parse
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
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides using an arbitrary variable lookup
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("WARDEN_DATABASE_URL").or_else(|| lookup("POSTGRES_URL")) {
            tracing::info!("Environment override: database url");
            self.spec.database.url = Some(url);
        }

        if let Some(val) = lookup("WARDEN_PORT") {
            match val.parse::<u16>() {
                Ok(port) if port > 0 => {
                    tracing::info!("Environment override: WARDEN_PORT={}", port);
                    self.spec.server.port = port;
                }
                _ => tracing::warn!("Invalid value for WARDEN_PORT: '{}'. Ignoring.", val),
            }
        }

        if let Some(dir) = lookup("WARDEN_DATA_DIR").or_else(|| lookup("PGLITE_DATA_DIR")) {
            tracing::info!("Environment override: data dir {}", dir);
            self.spec.data_dir = Some(PathBuf::from(dir));
        }

        if let Some(val) = lookup("DEBUG_MEMORY") {
            match val.to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => self.spec.memory.debug = true,
                "0" | "false" | "no" | "off" => self.spec.memory.debug = false,
                _ => tracing::warn!("Invalid value for DEBUG_MEMORY: '{}'. Ignoring.", val),
            }
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

        self.spec
            .database
            .pool
            .validate()
            .map_err(|e| anyhow::anyhow!("spec.database.pool: {}", e))?;

        if self.spec.server.port == 0 {
            anyhow::bail!("spec.server.port must be between 1 and 65535");
        }

        if self.spec.memory.window == 0 {
            anyhow::bail!("spec.memory.window must be at least 1");
        }

        if self.spec.memory.sample_interval_ms == 0 {
            anyhow::bail!("spec.memory.sample_interval_ms must be positive");
        }

        if self.spec.memory.maintenance_interval_secs == 0 {
            anyhow::bail!("spec.memory.maintenance_interval_secs must be positive");
        }

        Ok(())
    }

    pub fn database_url(&self) -> Option<&str> {
        self.spec.database.url.as_deref()
    }

    /// `spec.observability.logging.level`, when configured.
    pub fn log_level(&self) -> Option<&str> {
        self.spec
            .observability
            .as_ref()
            .and_then(|o| o.logging.as_ref())
            .map(|l| l.level.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_manifest() {
        let config = HostConfig::default();
        assert_eq!(config.api_version, API_VERSION);
        assert_eq!(config.kind, KIND);
        assert_eq!(config.spec.server.port, 3000);
        assert_eq!(config.spec.database.pool.max, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let yaml = r#"
apiVersion: warden.dev/v1
kind: HostConfig
metadata:
  name: edge-1
spec:
  database:
    url: postgres://localhost/warden
    pool:
      max: 5
      idle_timeout_millis: 1000
  memory:
    sample_interval_ms: 2000
"#;
        let config = HostConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.database_url(), Some("postgres://localhost/warden"));
        assert_eq!(config.spec.database.pool.max, 5);
        assert_eq!(config.spec.database.pool.min, 0);
        assert_eq!(config.spec.database.pool.application_name, "warden-agent");
        assert_eq!(config.spec.memory.sample_interval_ms, 2000);
        assert_eq!(config.spec.memory.window, DEFAULT_WINDOW_CAPACITY);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = HostConfig::default();
        let env: HashMap<&str, &str> = HashMap::from([
            ("POSTGRES_URL", "postgres://db/warden"),
            ("WARDEN_PORT", "3001"),
            ("PGLITE_DATA_DIR", "/var/lib/warden"),
            ("DEBUG_MEMORY", "1"),
        ]);
        config.apply_overrides_from(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.database_url(), Some("postgres://db/warden"));
        assert_eq!(config.spec.server.port, 3001);
        assert_eq!(config.spec.data_dir, Some(PathBuf::from("/var/lib/warden")));
        assert!(config.spec.memory.debug);
    }

    #[test]
    fn test_invalid_port_override_is_ignored() {
        let mut config = HostConfig::default();
        config.apply_overrides_from(|key| (key == "WARDEN_PORT").then(|| "0".to_string()));
        assert_eq!(config.spec.server.port, 3000);
    }

    #[test]
    fn test_validation() {
        let mut config = HostConfig::default();
        assert!(config.validate().is_ok());

        config.api_version = "wrong/v1".to_string();
        assert!(config.validate().is_err());
        config.api_version = API_VERSION.to_string();

        config.spec.database.pool.min = 10;
        assert!(config.validate().is_err());
        config.spec.database.pool.min = 0;

        config.spec.memory.window = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_yaml_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("warden-config.yaml");
        let mut config = HostConfig::default();
        config.spec.database.url = Some("postgres://localhost/test".to_string());
        config.to_yaml_file(&path).unwrap();

        let loaded = HostConfig::load_or_default(Some(path)).unwrap();
        assert_eq!(loaded.metadata.name, "warden-host");
        assert!(loaded.database_url().is_some());
    }
}
