//! Configuration watcher and rollout dispatcher.
//!
//! One task owns both configuration watches and serializes every
//! reaction: at most one rollout runs on this node at a time, and
//! per-axis event order is preserved. The watches start one past the
//! startup snapshot's revision, which makes delivery exactly-once
//! relative to that snapshot.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use convoy_coordinator::{Coordinator, WatchUpdate};
use tokio_util::sync::CancellationToken;

use crate::keys;
use crate::logger::Logger;
use crate::release::{self, Release};
use crate::topology::{self, Topology};

/// What the dispatcher invokes when a configuration axis changes.
#[async_trait]
pub trait ChangeHandler: Send + Sync {
    /// A new topology was published; `current_release` is the release the
    /// fleet is on while the topology changes.
    async fn on_pools_change(&self, topology: &Topology, current_release: &Release) -> Result<()>;
    /// A new release was published; `current_topology` defines the fleet
    /// the release rolls out to.
    async fn on_release_change(&self, release: &Release, current_topology: &Topology)
    -> Result<()>;
}

/// Watch both configuration keys and dispatch rollouts until a fatal
/// condition or cancellation.
///
/// Versions that already differ from the `start_*` values at the initial
/// snapshot are dispatched immediately (topology first), covering
/// changes published while this node was down.
pub async fn handle_changes(
    coordinator: &dyn Coordinator,
    config_prefix: &str,
    start_topology_version: &str,
    start_release_version: &str,
    handler: &dyn ChangeHandler,
    cancel: &CancellationToken,
    log: &Logger,
) -> Result<()> {
    log.info("[watch] watching for server pool and release changes");

    let pools_key = keys::pools_key(config_prefix);
    let release_key = keys::release_key(config_prefix);

    let snapshot = coordinator
        .get_prefix(config_prefix)
        .await
        .context("failed to read the configuration snapshot")?;
    let topology_raw = snapshot
        .entries
        .get(&pools_key)
        .context("server pools configuration is not set")?;
    let release_raw = snapshot
        .entries
        .get(&release_key)
        .context("minio release configuration is not set")?;
    let mut current_topology = topology::parse_topology(topology_raw)?;
    let mut current_release = release::parse_release(release_raw)?;

    if current_topology.version != start_topology_version {
        log.info(format!(
            "[watch] handling new server pools configuration at version {}",
            current_topology.version
        ));
        handler
            .on_pools_change(&current_topology, &current_release)
            .await?;
    }
    if current_release.version != start_release_version {
        log.info(format!(
            "[watch] handling new minio release at version {}",
            current_release.version
        ));
        handler
            .on_release_change(&current_release, &current_topology)
            .await?;
    }

    let mut pools_watch = coordinator
        .watch(&pools_key, snapshot.revision + 1, false)
        .await
        .context("failed to watch the server pools configuration")?;
    let mut release_watch = coordinator
        .watch(&release_key, snapshot.revision + 1, false)
        .await
        .context("failed to watch the minio release configuration")?;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                log.info("[watch] shutting down");
                return Ok(());
            }
            update = pools_watch.recv() => {
                let update = unwrap_update(update, "server pools")?;
                let Some(raw) = update.upserts.get(&pools_key) else { continue };
                current_topology = topology::parse_topology(raw)?;
                log.info(format!(
                    "[watch] handling new server pools configuration at version {}",
                    current_topology.version
                ));
                handler.on_pools_change(&current_topology, &current_release).await?;
            }
            update = release_watch.recv() => {
                let update = unwrap_update(update, "minio release")?;
                let Some(raw) = update.upserts.get(&release_key) else { continue };
                current_release = release::parse_release(raw)?;
                log.info(format!(
                    "[watch] handling new minio release at version {}",
                    current_release.version
                ));
                handler.on_release_change(&current_release, &current_topology).await?;
            }
        }
    }
}

fn unwrap_update(
    update: Option<Result<WatchUpdate, convoy_coordinator::CoordinatorError>>,
    what: &str,
) -> Result<WatchUpdate> {
    let update = match update {
        None => bail!("{what} watch stream ended unexpectedly"),
        Some(Err(err)) => {
            return Err(err).with_context(|| format!("{what} watch failed"));
        }
        Some(Ok(update)) => update,
    };
    if !update.deletions.is_empty() {
        bail!("got an unexpected key deletion while watching for {what} changes");
    }
    Ok(update)
}
