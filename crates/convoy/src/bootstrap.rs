//! Agent startup sequence and runtime loop.
//!
//! Startup is deliberately re-entrant: every step either checks before
//! acting or resumes from coordinator state, so a crash at any point is
//! recovered by simply running the sequence again.

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use convoy_coordinator::{Coordinator, EtcdCoordinator};
use tokio_util::sync::CancellationToken;

use crate::binary;
use crate::config::AgentConfig;
use crate::fs;
use crate::logger::Logger;
use crate::release::{self, Release};
use crate::rollout;
use crate::systemd::{ServiceManager, SystemdManager};
use crate::topology::{self, Topology};
use crate::watch::{self, ChangeHandler};

/// Create the binary cache root if it is missing.
pub async fn ensure_binaries_dir(dir: &Path, log: &Logger) -> Result<()> {
    if !fs::path_exists(dir)? {
        log.info(format!("[main] creating binary directory {}", dir.display()));
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }
    Ok(())
}

/// Bring the node in line with the fleet: install the service if it is
/// missing, finish any in-progress rollouts, start the service, and prune
/// the cache if a release rollout ran. Returns the initial topology and
/// release the watch loop starts from.
pub async fn startup(
    coordinator: &dyn Coordinator,
    config: &AgentConfig,
    manager: &dyn ServiceManager,
    cancel: &CancellationToken,
    log: &Logger,
) -> Result<(Topology, Release)> {
    let (topology, _) = topology::get_topology(coordinator, &config.etcd.config_prefix).await?;
    let (current_release, _) = release::get_release(coordinator, &config.etcd.config_prefix).await?;

    let binary_name = config.binary_name();
    let minio_path = binary::minio_path(&config.binaries_dir, &current_release.version, &binary_name);

    if !manager.exists().await? {
        log.info("[main] minio service not found, generating it");
        binary::fetch_binary(
            &current_release.url,
            &current_release.version,
            &current_release.checksum,
            &config.binaries_dir,
            &binary_name,
            log,
        )
        .await?;
        manager.refresh(&minio_path, &topology).await?;
    }

    rollout::update_pools(
        coordinator,
        &config.etcd.workspace_prefix,
        &minio_path,
        &topology,
        &config.host,
        manager,
        cancel,
        log,
    )
    .await?;

    let release_updated = rollout::update_release(
        coordinator,
        &config.etcd.workspace_prefix,
        &config.binaries_dir,
        &binary_name,
        &current_release,
        &topology,
        &config.host,
        manager,
        cancel,
        log,
    )
    .await?;

    manager.start().await?;

    if release_updated {
        binary::cleanup_old_binaries(&config.binaries_dir, log)?;
    }

    Ok((topology, current_release))
}

/// The runtime loop's reaction to configuration changes: rerun the
/// matching rollout driver, restart the services, and prune the cache
/// after a release moved.
pub struct AgentHandler<'a> {
    coordinator: &'a dyn Coordinator,
    config: &'a AgentConfig,
    manager: &'a dyn ServiceManager,
    cancel: &'a CancellationToken,
    log: &'a Logger,
}

impl<'a> AgentHandler<'a> {
    pub fn new(
        coordinator: &'a dyn Coordinator,
        config: &'a AgentConfig,
        manager: &'a dyn ServiceManager,
        cancel: &'a CancellationToken,
        log: &'a Logger,
    ) -> Self {
        Self {
            coordinator,
            config,
            manager,
            cancel,
            log,
        }
    }
}

#[async_trait]
impl ChangeHandler for AgentHandler<'_> {
    async fn on_pools_change(&self, topology: &Topology, current_release: &Release) -> Result<()> {
        let binary_name = self.config.binary_name();
        let minio_path = binary::minio_path(
            &self.config.binaries_dir,
            &current_release.version,
            &binary_name,
        );
        rollout::update_pools(
            self.coordinator,
            &self.config.etcd.workspace_prefix,
            &minio_path,
            topology,
            &self.config.host,
            self.manager,
            self.cancel,
            self.log,
        )
        .await?;
        self.manager.start().await
    }

    async fn on_release_change(
        &self,
        new_release: &Release,
        current_topology: &Topology,
    ) -> Result<()> {
        rollout::update_release(
            self.coordinator,
            &self.config.etcd.workspace_prefix,
            &self.config.binaries_dir,
            &self.config.binary_name(),
            new_release,
            current_topology,
            &self.config.host,
            self.manager,
            self.cancel,
            self.log,
        )
        .await?;
        self.manager.start().await?;
        binary::cleanup_old_binaries(&self.config.binaries_dir, self.log)
    }
}

/// Run the agent end to end: bootstrap, then the watch loop. Returns only
/// on cancellation (clean) or a fatal error.
pub async fn run(config: &AgentConfig, cancel: &CancellationToken, log: &Logger) -> Result<()> {
    ensure_binaries_dir(&config.binaries_dir, log).await?;

    log.info("[main] connecting to the coordinator");
    let coordinator = EtcdCoordinator::connect(&config.etcd)
        .await
        .context("failed to connect to the coordinator")?;

    let manager = SystemdManager::new(config.minio_services.clone(), *log);
    let (topology, current_release) = startup(&coordinator, config, &manager, cancel, log).await?;

    let handler = AgentHandler::new(&coordinator, config, &manager, cancel, log);
    watch::handle_changes(
        &coordinator,
        &config.etcd.config_prefix,
        &topology.version,
        &current_release.version,
        &handler,
        cancel,
        log,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ensure_binaries_dir_creates_missing_directories() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("cache/binaries");
        let log = Logger::default();

        ensure_binaries_dir(&target, &log).await.expect("create");
        assert!(fs::path_exists(&target).expect("exists"));

        // Idempotent on rerun.
        ensure_binaries_dir(&target, &log).await.expect("rerun");
    }
}
