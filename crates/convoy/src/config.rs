//! Static agent configuration.
//!
//! Loaded once at startup from a YAML file: `--config` flag, else the
//! `CONVOY_CONFIG_FILE` environment variable, else `config.yml` in the
//! working directory.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use convoy_coordinator::CoordinatorConfig;
use serde::Deserialize;

use crate::logger::LogLevel;

/// Environment variable naming the configuration file.
pub const CONFIG_FILE_ENV: &str = "CONVOY_CONFIG_FILE";

/// Fallback configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yml";

/// One managed MinIO service unit.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MinioServiceConfig {
    /// Unit name; the `.service` suffix is optional.
    pub name: String,
    /// Environment file the unit references.
    pub env_path: PathBuf,
    /// Optional per-tenant subpath appended to each pool mount.
    #[serde(default)]
    pub data_path: Option<String>,
}

impl MinioServiceConfig {
    /// Unit name with the `.service` suffix, however the operator wrote it.
    pub fn unit_name(&self) -> String {
        if self.name.ends_with(".service") {
            self.name.clone()
        } else {
            format!("{}.service", self.name)
        }
    }

    /// Unit name without the suffix.
    pub fn base_name(&self) -> String {
        self.name
            .strip_suffix(".service")
            .unwrap_or(&self.name)
            .to_string()
    }
}

/// The agent's static configuration document.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Coordinator connection and keyspace settings.
    pub etcd: CoordinatorConfig,
    /// Local binary cache root.
    pub binaries_dir: PathBuf,
    /// Managed service units.
    #[serde(default)]
    pub minio_services: Vec<MinioServiceConfig>,
    /// Stable host identity; defaults to the hostname.
    #[serde(default)]
    pub host: String,
    /// One of `error|warning|info|debug`; anything else means `info`.
    #[serde(default)]
    pub log_level: String,
}

impl AgentConfig {
    /// Load from the path named by `CONVOY_CONFIG_FILE`, or `config.yml`.
    pub fn load_default() -> Result<Self> {
        let path =
            std::env::var(CONFIG_FILE_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        Self::load(Path::new(&path))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("error reading the configuration file {}", path.display()))?;
        let mut config: AgentConfig =
            serde_yaml::from_str(&raw).context("error parsing the configuration file")?;
        if config.host.is_empty() {
            config.host = gethostname::gethostname().to_string_lossy().into_owned();
        }
        Ok(config)
    }

    pub fn log_level(&self) -> LogLevel {
        LogLevel::parse(&self.log_level)
    }

    /// File name the release binary is cached under: the first service's
    /// base name, or `minio` when none are configured.
    pub fn binary_name(&self) -> String {
        self.minio_services
            .first()
            .map(MinioServiceConfig::base_name)
            .unwrap_or_else(|| "minio".to_string())
    }
}
