//! Service-unit management.
//!
//! The [`ServiceManager`] trait is the seam between the rollout engine
//! and the host's service manager; [`SystemdManager`] is the production
//! implementation, shelling out to `systemctl` and owning the unit files
//! it renders. Tests substitute their own manager.

use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::process::Command;

use crate::config::MinioServiceConfig;
use crate::fs;
use crate::logger::Logger;
use crate::topology::Topology;

/// Embedded unit template. Recognized placeholders: `{MinioPath}`,
/// `{EnvPath}`, `{ServerPools}`.
pub const UNIT_TEMPLATE: &str = include_str!("minio.service");

/// Where unit files are installed.
pub const DEFAULT_UNIT_DIR: &str = "/etc/systemd/system";

/// Values substituted into the unit template.
#[derive(Debug, Clone)]
pub struct UnitTemplateValues {
    pub minio_path: String,
    pub env_path: String,
    pub server_pools: String,
}

/// Substitute the template's placeholders.
pub fn render_unit(template: &str, values: &UnitTemplateValues) -> String {
    template
        .replace("{MinioPath}", &values.minio_path)
        .replace("{EnvPath}", &values.env_path)
        .replace("{ServerPools}", &values.server_pools)
}

/// The rollout engine's contract with the host's service manager.
#[async_trait]
pub trait ServiceManager: Send + Sync {
    /// Whether every configured unit file is present locally.
    async fn exists(&self) -> Result<bool>;
    /// Stop and disable the units; missing units are skipped.
    async fn stop(&self) -> Result<()>;
    /// Start and enable the units; missing units are skipped.
    async fn start(&self) -> Result<()>;
    /// Rewrite the unit files for `topology` with the binary at
    /// `minio_path`, then reload the service manager.
    async fn refresh(&self, minio_path: &Path, topology: &Topology) -> Result<()>;
}

/// systemd-backed service manager.
pub struct SystemdManager {
    unit_dir: PathBuf,
    services: Vec<MinioServiceConfig>,
    log: Logger,
}

impl SystemdManager {
    pub fn new(services: Vec<MinioServiceConfig>, log: Logger) -> Self {
        Self::with_unit_dir(PathBuf::from(DEFAULT_UNIT_DIR), services, log)
    }

    /// Install units somewhere other than `/etc/systemd/system`.
    pub fn with_unit_dir(unit_dir: PathBuf, services: Vec<MinioServiceConfig>, log: Logger) -> Self {
        Self {
            unit_dir,
            services,
            log,
        }
    }

    fn unit_path(&self, service: &MinioServiceConfig) -> PathBuf {
        self.unit_dir.join(service.unit_name())
    }

    async fn systemctl(&self, args: &[&str]) -> Result<()> {
        let output = Command::new("systemctl")
            .args(args)
            .output()
            .await
            .with_context(|| format!("failed to run systemctl {}", args.join(" ")))?;
        if !output.status.success() {
            bail!(
                "systemctl {} exited with {}: {}",
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

#[async_trait]
impl ServiceManager for SystemdManager {
    async fn exists(&self) -> Result<bool> {
        for service in &self.services {
            if !fs::path_exists(&self.unit_path(service))? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn stop(&self) -> Result<()> {
        for service in &self.services {
            let unit = service.unit_name();
            if !fs::path_exists(&self.unit_path(service))? {
                self.log.info(format!("[systemd] stop of {unit} skipped: unit does not exist"));
                continue;
            }
            self.log.info(format!("[systemd] stopping {unit}"));
            self.systemctl(&["stop", &unit]).await?;
            self.systemctl(&["disable", &unit]).await?;
        }
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        for service in &self.services {
            let unit = service.unit_name();
            if !fs::path_exists(&self.unit_path(service))? {
                self.log.info(format!("[systemd] start of {unit} skipped: unit does not exist"));
                continue;
            }
            self.log.info(format!("[systemd] starting {unit}"));
            self.systemctl(&["start", &unit]).await?;
            self.systemctl(&["enable", &unit]).await?;
        }
        Ok(())
    }

    async fn refresh(&self, minio_path: &Path, topology: &Topology) -> Result<()> {
        for service in &self.services {
            let values = UnitTemplateValues {
                minio_path: minio_path.display().to_string(),
                env_path: service.env_path.display().to_string(),
                server_pools: topology.stringify(service.data_path.as_deref()),
            };
            let path = self.unit_path(service);
            self.log.info(format!(
                "[systemd] writing {} with binary {} and server pools '{}'",
                path.display(),
                values.minio_path,
                values.server_pools
            ));
            write_unit_file(&path, &render_unit(UNIT_TEMPLATE, &values))?;
        }
        self.systemctl(&["daemon-reload"]).await
    }
}

/// Write a unit file atomically at mode 0640: staged next to the target
/// and renamed into place.
pub fn write_unit_file(path: &Path, contents: &str) -> Result<()> {
    let dir = path
        .parent()
        .with_context(|| format!("unit path {} has no parent directory", path.display()))?;
    let mut staged = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("failed to stage a unit file in {}", dir.display()))?;
    staged
        .write_all(contents.as_bytes())
        .context("failed to write the staged unit file")?;
    staged
        .as_file()
        .set_permissions(std::fs::Permissions::from_mode(0o640))
        .context("failed to set unit file permissions")?;
    staged
        .persist(path)
        .with_context(|| format!("failed to install the unit file {}", path.display()))?;
    Ok(())
}
