//! The distributed barrier primitive.
//!
//! A task lives under one key prefix: `<P>/completers/<host>` holds one
//! key per host that finished the task's local action, and `<P>/complete`
//! is a terminal marker written once the completer set reaches the
//! expected fleet size. Either signal lets a reader advance: the count
//! covers the common case, the marker keeps late joiners and shrunken
//! fleets live.

use anyhow::{Context, Result};
use convoy_coordinator::Coordinator;
use tokio_util::sync::CancellationToken;

use crate::keys;

/// A snapshot of one barrier's state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Task {
    pub complete: bool,
    pub completers: Vec<String>,
}

impl Task {
    /// Whether `host` still has to run the task's local action.
    pub fn has_to_do(&self, host: &str) -> bool {
        !self.completers.iter().any(|completer| completer == host)
    }

    /// Whether a reader may advance past this barrier.
    pub fn may_advance(&self, expected_hosts: u64) -> bool {
        self.complete || self.completers.len() as u64 >= expected_hosts
    }
}

/// Read a task in one snapshot-consistent prefix read.
pub async fn get_task(coordinator: &dyn Coordinator, task_prefix: &str) -> Result<(Task, i64)> {
    let snapshot = coordinator
        .get_prefix(task_prefix)
        .await
        .with_context(|| format!("failed to read task state under {task_prefix}"))?;

    let completers_prefix = keys::completers_prefix(task_prefix);
    let complete_key = keys::complete_key(task_prefix);

    let mut task = Task::default();
    for key in snapshot.entries.keys() {
        if let Some(host) = key.strip_prefix(&completers_prefix) {
            if !host.is_empty() && !host.contains('/') {
                task.completers.push(host.to_string());
            }
        } else if key == &complete_key {
            task.complete = true;
        }
    }
    Ok((task, snapshot.revision))
}

/// Record that `host` finished the task's local action. Idempotent.
pub async fn mark_self(coordinator: &dyn Coordinator, task_prefix: &str, host: &str) -> Result<()> {
    coordinator
        .join_group(&keys::completers_prefix(task_prefix), host, "done")
        .await
        .with_context(|| format!("failed to mark {host} done under {task_prefix}"))
}

/// Block until the barrier resolves.
///
/// Two signals race: the completer count reaching `expected_hosts`, in
/// which case this caller promotes the task by writing the terminal
/// marker, or an already-written marker being observed, in which case
/// nothing is written.
pub async fn wait(
    coordinator: &dyn Coordinator,
    task_prefix: &str,
    expected_hosts: u64,
    cancel: &CancellationToken,
) -> Result<()> {
    let completers_prefix = keys::completers_prefix(task_prefix);
    let complete_key = keys::complete_key(task_prefix);

    tokio::select! {
        outcome = coordinator.wait_group_count(&completers_prefix, expected_hosts, cancel) => {
            outcome.with_context(|| format!("failed waiting for completers under {task_prefix}"))?;
            coordinator
                .put(&complete_key, "true")
                .await
                .with_context(|| format!("failed to mark {task_prefix} complete"))?;
        }
        outcome = wait_for_marker(coordinator, &complete_key, cancel) => {
            outcome?;
        }
    }
    Ok(())
}

async fn wait_for_marker(
    coordinator: &dyn Coordinator,
    complete_key: &str,
    cancel: &CancellationToken,
) -> Result<()> {
    // A prefix read of the exact key doubles as "current revision plus
    // existence", so the watch below cannot miss a concurrent write.
    let snapshot = coordinator
        .get_prefix(complete_key)
        .await
        .with_context(|| format!("failed to read {complete_key}"))?;
    if snapshot.entries.contains_key(complete_key) {
        return Ok(());
    }

    let mut updates = coordinator
        .watch(complete_key, snapshot.revision + 1, false)
        .await
        .with_context(|| format!("failed to watch {complete_key}"))?;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(convoy_coordinator::CoordinatorError::Cancelled.into());
            }
            update = updates.recv() => match update {
                None => return Err(convoy_coordinator::CoordinatorError::WatchClosed.into()),
                Some(Err(err)) => return Err(err.into()),
                Some(Ok(update)) => {
                    if update.upserts.contains_key(complete_key) {
                        return Ok(());
                    }
                }
            },
        }
    }
}
