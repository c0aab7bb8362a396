//! The coordinated rollout state machine.
//!
//! A rollout drives one configuration axis (the server-pool topology or
//! the binary release) through three phases, each a fleet-wide barrier:
//! every host finishes phase N before any host starts phase N+1. Progress
//! lives entirely in the coordinator, so a node restarted mid-rollout
//! rebuilds its position from the task keyspaces and rejoins the barrier
//! it was at. Local actions run at most once per host per phase: the
//! host's completer key is both the dedup record and the barrier vote.

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use convoy_coordinator::Coordinator;
use tokio_util::sync::CancellationToken;

use crate::binary;
use crate::keys;
use crate::logger::Logger;
use crate::release::Release;
use crate::systemd::ServiceManager;
use crate::task::{self, Task};
use crate::topology::Topology;

/// Which configuration axis a rollout transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RolloutAxis {
    Pools,
    Release,
}

impl RolloutAxis {
    /// Keyspace segment under `<ws>/tasks/`.
    pub fn segment(self) -> &'static str {
        match self {
            RolloutAxis::Pools => "pools",
            RolloutAxis::Release => "release",
        }
    }

    /// Phase keys, in execution order.
    pub fn phases(self) -> [&'static str; 3] {
        match self {
            RolloutAxis::Pools => ["acknowledgment", "minio_shutdown", "systemd_update"],
            RolloutAxis::Release => ["binary_download", "minio_shutdown", "systemd_update"],
        }
    }

    /// The three task prefixes for one rollout of this axis.
    pub fn task_prefixes(self, workspace_prefix: &str, version: &str) -> [String; 3] {
        self.phases()
            .map(|phase| keys::task_prefix(workspace_prefix, self.segment(), version, phase))
    }
}

/// The local side effects of one rollout, keyed by phase.
///
/// Implementations must be idempotent: a crash between the action and the
/// completer write replays the action on restart.
#[async_trait]
pub trait RolloutActions: Send + Sync {
    /// First phase: acknowledge (pools) or download the binary (release).
    async fn prepare(&self) -> Result<()>;
    /// Second phase: stop the local service units.
    async fn shutdown(&self) -> Result<()>;
    /// Third phase: regenerate the local service units.
    async fn refresh(&self) -> Result<()>;
}

/// A rollout's position, reconstructed from the coordinator on demand.
#[derive(Debug, Clone)]
pub struct RolloutProgress {
    done: [bool; 3],
    current: Option<(usize, Task)>,
}

impl RolloutProgress {
    /// Whether every phase may already be advanced past.
    pub fn is_done(&self) -> bool {
        self.current.is_none()
    }

    /// Index of the first phase still gated by its barrier.
    pub fn current_phase(&self) -> Option<usize> {
        self.current.as_ref().map(|(index, _)| *index)
    }

    pub fn phases_done(&self) -> [bool; 3] {
        self.done
    }
}

/// Read the three tasks in order; the first that may not be advanced past
/// becomes the current phase.
pub async fn read_progress(
    coordinator: &dyn Coordinator,
    prefixes: &[String; 3],
    expected_hosts: u64,
) -> Result<RolloutProgress> {
    let mut done = [false; 3];
    for (index, prefix) in prefixes.iter().enumerate() {
        let (task, _) = task::get_task(coordinator, prefix).await?;
        if !task.may_advance(expected_hosts) {
            return Ok(RolloutProgress {
                done,
                current: Some((index, task)),
            });
        }
        done[index] = true;
    }
    Ok(RolloutProgress {
        done,
        current: None,
    })
}

/// Drive one rollout from wherever the coordinator says it stands to
/// completion. Returns whether any phase was still outstanding.
///
/// The barrier threshold is the current topology's host count for both
/// axes; the fleet is whatever the topology says it is at the moment the
/// rollout runs.
#[allow(clippy::too_many_arguments)]
pub async fn run_rollout(
    coordinator: &dyn Coordinator,
    workspace_prefix: &str,
    axis: RolloutAxis,
    version: &str,
    expected_hosts: u64,
    host: &str,
    actions: &dyn RolloutActions,
    cancel: &CancellationToken,
    log: &Logger,
) -> Result<bool> {
    let prefixes = axis.task_prefixes(workspace_prefix, version);
    let mut progress = read_progress(coordinator, &prefixes, expected_hosts).await?;
    if progress.is_done() {
        log.debug(format!(
            "[rollout] {} rollout {version} is already complete",
            axis.segment()
        ));
        return Ok(false);
    }

    while let Some((index, current)) = progress.current.take() {
        let prefix = &prefixes[index];
        let phase = axis.phases()[index];

        if current.has_to_do(host) {
            log.info(format!(
                "[rollout] running {phase} for {} rollout {version}",
                axis.segment()
            ));
            let action = match index {
                0 => actions.prepare().await,
                1 => actions.shutdown().await,
                _ => actions.refresh().await,
            };
            action.with_context(|| {
                format!("{phase} failed for {} rollout {version}", axis.segment())
            })?;
            task::mark_self(coordinator, prefix, host).await?;
        } else {
            log.info(format!(
                "[rollout] {phase} already done locally for {} rollout {version}",
                axis.segment()
            ));
        }

        log.info(format!(
            "[rollout] waiting on the {phase} barrier ({expected_hosts} hosts)"
        ));
        task::wait(coordinator, prefix, expected_hosts, cancel).await?;

        progress.done[index] = true;
        if index + 1 < prefixes.len() {
            let (next, _) = task::get_task(coordinator, &prefixes[index + 1]).await?;
            progress.current = Some((index + 1, next));
        }
    }

    log.info(format!(
        "[rollout] {} rollout {version} complete",
        axis.segment()
    ));
    Ok(true)
}

struct PoolsActions<'a> {
    manager: &'a dyn ServiceManager,
    minio_path: &'a Path,
    topology: &'a Topology,
}

#[async_trait]
impl RolloutActions for PoolsActions<'_> {
    async fn prepare(&self) -> Result<()> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.manager.stop().await
    }

    async fn refresh(&self) -> Result<()> {
        self.manager.refresh(self.minio_path, self.topology).await
    }
}

/// Run the topology rollout for `topology`, refreshing units against the
/// currently active binary at `minio_path`.
#[allow(clippy::too_many_arguments)]
pub async fn update_pools(
    coordinator: &dyn Coordinator,
    workspace_prefix: &str,
    minio_path: &Path,
    topology: &Topology,
    host: &str,
    manager: &dyn ServiceManager,
    cancel: &CancellationToken,
    log: &Logger,
) -> Result<bool> {
    let actions = PoolsActions {
        manager,
        minio_path,
        topology,
    };
    run_rollout(
        coordinator,
        workspace_prefix,
        RolloutAxis::Pools,
        &topology.version,
        topology.count_hosts(),
        host,
        &actions,
        cancel,
        log,
    )
    .await
}

struct ReleaseActions<'a> {
    manager: &'a dyn ServiceManager,
    binaries_dir: &'a Path,
    binary_name: &'a str,
    release: &'a Release,
    topology: &'a Topology,
    log: &'a Logger,
}

#[async_trait]
impl RolloutActions for ReleaseActions<'_> {
    async fn prepare(&self) -> Result<()> {
        binary::fetch_binary(
            &self.release.url,
            &self.release.version,
            &self.release.checksum,
            self.binaries_dir,
            self.binary_name,
            self.log,
        )
        .await
    }

    async fn shutdown(&self) -> Result<()> {
        self.manager.stop().await
    }

    async fn refresh(&self) -> Result<()> {
        let minio_path = binary::minio_path(self.binaries_dir, &self.release.version, self.binary_name);
        self.manager.refresh(&minio_path, self.topology).await
    }
}

/// Run the release rollout for `release`, refreshing units against the
/// currently active `topology`.
#[allow(clippy::too_many_arguments)]
pub async fn update_release(
    coordinator: &dyn Coordinator,
    workspace_prefix: &str,
    binaries_dir: &Path,
    binary_name: &str,
    release: &Release,
    topology: &Topology,
    host: &str,
    manager: &dyn ServiceManager,
    cancel: &CancellationToken,
    log: &Logger,
) -> Result<bool> {
    let actions = ReleaseActions {
        manager,
        binaries_dir,
        binary_name,
        release,
        topology,
        log,
    };
    run_rollout(
        coordinator,
        workspace_prefix,
        RolloutAxis::Release,
        &release.version,
        topology.count_hosts(),
        host,
        &actions,
        cancel,
        log,
    )
    .await
}

#[cfg(test)]
mod tests {
    use convoy_coordinator::memory::MemoryCoordinator;

    use super::*;

    const WS: &str = "/w";

    #[test]
    fn task_prefixes_are_deterministic_per_axis_and_version() {
        let prefixes = RolloutAxis::Release.task_prefixes(WS, "v9");
        assert_eq!(prefixes[0], "/w/tasks/release/v9/binary_download/");
        assert_eq!(prefixes[1], "/w/tasks/release/v9/minio_shutdown/");
        assert_eq!(prefixes[2], "/w/tasks/release/v9/systemd_update/");
    }

    #[tokio::test]
    async fn read_progress_on_a_blank_keyspace_starts_at_the_first_phase() {
        let coordinator = MemoryCoordinator::new();
        let prefixes = RolloutAxis::Pools.task_prefixes(WS, "v1");

        let progress = read_progress(&coordinator, &prefixes, 3).await.expect("read");
        assert!(!progress.is_done());
        assert_eq!(progress.current_phase(), Some(0));
        assert_eq!(progress.phases_done(), [false, false, false]);
    }

    #[tokio::test]
    async fn read_progress_resumes_at_the_first_gated_phase() {
        let coordinator = MemoryCoordinator::new();
        let prefixes = RolloutAxis::Pools.task_prefixes(WS, "v1");

        coordinator
            .put(&keys::complete_key(&prefixes[0]), "true")
            .await
            .expect("put");
        task::mark_self(&coordinator, &prefixes[1], "host1").await.expect("mark");

        let progress = read_progress(&coordinator, &prefixes, 3).await.expect("read");
        assert_eq!(progress.current_phase(), Some(1));
        assert_eq!(progress.phases_done(), [true, false, false]);
    }

    #[tokio::test]
    async fn read_progress_reports_done_when_every_barrier_is_resolved() {
        let coordinator = MemoryCoordinator::new();
        let prefixes = RolloutAxis::Pools.task_prefixes(WS, "v1");

        for prefix in &prefixes {
            coordinator
                .put(&keys::complete_key(prefix), "true")
                .await
                .expect("put");
        }

        let progress = read_progress(&coordinator, &prefixes, 3).await.expect("read");
        assert!(progress.is_done());
        assert_eq!(progress.current_phase(), None);
    }
}
