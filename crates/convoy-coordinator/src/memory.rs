//! In-process coordinator backend.
//!
//! Mirrors the revision semantics the engine relies on from etcd: a
//! single store-wide revision counter, per-key mod revisions, atomic
//! prefix snapshots, and watches that replay every entry modified at or
//! after the requested starting revision before going live. Intended for
//! tests and examples; nothing here persists.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{Coordinator, CoordinatorError, KeyInfo, PrefixSnapshot, WatchReceiver, WatchUpdate};

#[derive(Debug)]
struct Entry {
    value: String,
    mod_revision: i64,
}

#[derive(Debug)]
struct Watcher {
    selector: String,
    is_prefix: bool,
    tx: mpsc::UnboundedSender<Result<WatchUpdate, CoordinatorError>>,
}

impl Watcher {
    fn matches(&self, key: &str) -> bool {
        if self.is_prefix {
            key.starts_with(&self.selector)
        } else {
            key == self.selector
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    revision: i64,
    entries: BTreeMap<String, Entry>,
    watchers: Vec<Watcher>,
}

impl Shared {
    fn notify(&mut self, key: &str, update: &WatchUpdate) {
        self.watchers
            .retain(|watcher| !watcher.matches(key) || watcher.tx.send(Ok(update.clone())).is_ok());
    }
}

/// A shared, clonable in-memory coordinator.
///
/// Clones share one store, so a test can hand the same coordinator to
/// several concurrent "hosts".
#[derive(Debug, Clone, Default)]
pub struct MemoryCoordinator {
    shared: Arc<Mutex<Shared>>,
}

impl MemoryCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current store revision.
    pub fn revision(&self) -> i64 {
        self.shared.lock().expect("coordinator state poisoned").revision
    }

    /// Remove a key, delivering a deletion event to matching watchers.
    ///
    /// Deletion is not part of the [`Coordinator`] contract (agents never
    /// delete), but operators can, and the dispatcher treats it as fatal.
    pub fn delete(&self, key: &str) {
        let mut shared = self.shared.lock().expect("coordinator state poisoned");
        if shared.entries.remove(key).is_none() {
            return;
        }
        shared.revision += 1;
        let update = WatchUpdate {
            revision: shared.revision,
            upserts: BTreeMap::new(),
            deletions: vec![key.to_string()],
        };
        shared.notify(key, &update);
    }
}

#[async_trait]
impl Coordinator for MemoryCoordinator {
    async fn get(&self, key: &str) -> Result<KeyInfo, CoordinatorError> {
        let shared = self.shared.lock().expect("coordinator state poisoned");
        Ok(match shared.entries.get(key) {
            Some(entry) => KeyInfo {
                found: true,
                value: entry.value.clone(),
                mod_revision: entry.mod_revision,
            },
            None => KeyInfo {
                found: false,
                value: String::new(),
                mod_revision: 0,
            },
        })
    }

    async fn get_prefix(&self, prefix: &str) -> Result<PrefixSnapshot, CoordinatorError> {
        let shared = self.shared.lock().expect("coordinator state poisoned");
        let entries = shared
            .entries
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, entry)| (key.clone(), entry.value.clone()))
            .collect();
        Ok(PrefixSnapshot {
            entries,
            revision: shared.revision,
        })
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), CoordinatorError> {
        let mut shared = self.shared.lock().expect("coordinator state poisoned");
        shared.revision += 1;
        let revision = shared.revision;
        shared.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                mod_revision: revision,
            },
        );
        let update = WatchUpdate {
            revision,
            upserts: BTreeMap::from([(key.to_string(), value.to_string())]),
            deletions: Vec::new(),
        };
        shared.notify(key, &update);
        Ok(())
    }

    async fn watch(
        &self,
        key: &str,
        from_revision: i64,
        is_prefix: bool,
    ) -> Result<WatchReceiver, CoordinatorError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut shared = self.shared.lock().expect("coordinator state poisoned");

        // Replay what the caller has not observed yet, then go live.
        let mut upserts = BTreeMap::new();
        for (existing, entry) in &shared.entries {
            let selected = if is_prefix {
                existing.starts_with(key)
            } else {
                existing.as_str() == key
            };
            if selected && entry.mod_revision >= from_revision {
                upserts.insert(existing.clone(), entry.value.clone());
            }
        }
        if !upserts.is_empty() {
            let _ = tx.send(Ok(WatchUpdate {
                revision: shared.revision,
                upserts,
                deletions: Vec::new(),
            }));
        }

        shared.watchers.push(Watcher {
            selector: key.to_string(),
            is_prefix,
            tx,
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use super::*;

    #[tokio::test]
    async fn get_reports_missing_keys() {
        let coordinator = MemoryCoordinator::new();
        let info = coordinator.get("/nothing").await.expect("get");
        assert!(!info.found);
        assert_eq!(info.mod_revision, 0);
    }

    #[tokio::test]
    async fn put_bumps_the_store_revision() {
        let coordinator = MemoryCoordinator::new();
        coordinator.put("/a", "1").await.expect("put");
        coordinator.put("/b", "2").await.expect("put");

        let a = coordinator.get("/a").await.expect("get");
        let b = coordinator.get("/b").await.expect("get");
        assert_eq!(a.mod_revision, 1);
        assert_eq!(b.mod_revision, 2);
        assert_eq!(coordinator.revision(), 2);
    }

    #[tokio::test]
    async fn prefix_snapshot_only_covers_the_prefix() {
        let coordinator = MemoryCoordinator::new();
        coordinator.put("/group/a", "1").await.expect("put");
        coordinator.put("/group/b", "2").await.expect("put");
        coordinator.put("/other", "3").await.expect("put");

        let snapshot = coordinator.get_prefix("/group/").await.expect("snapshot");
        assert_eq!(snapshot.entries.len(), 2);
        assert_eq!(snapshot.entries["/group/a"], "1");
        assert_eq!(snapshot.entries["/group/b"], "2");
        assert_eq!(snapshot.revision, 3);
    }

    #[tokio::test]
    async fn watch_replays_entries_from_the_requested_revision() {
        let coordinator = MemoryCoordinator::new();
        coordinator.put("/k/a", "old").await.expect("put");
        let cut = coordinator.revision();
        coordinator.put("/k/b", "new").await.expect("put");

        let mut rx = coordinator.watch("/k/", cut + 1, true).await.expect("watch");
        let update = rx.recv().await.expect("update").expect("ok");
        assert_eq!(update.upserts.len(), 1);
        assert_eq!(update.upserts["/k/b"], "new");
    }

    #[tokio::test]
    async fn watch_delivers_live_updates_and_deletions() {
        let coordinator = MemoryCoordinator::new();
        let mut rx = coordinator.watch("/live", 1, false).await.expect("watch");

        coordinator.put("/live", "v").await.expect("put");
        let update = rx.recv().await.expect("update").expect("ok");
        assert_eq!(update.upserts["/live"], "v");

        coordinator.delete("/live");
        let update = rx.recv().await.expect("update").expect("ok");
        assert_eq!(update.deletions, vec!["/live".to_string()]);
    }

    #[tokio::test]
    async fn watch_ignores_other_keys() {
        let coordinator = MemoryCoordinator::new();
        let mut rx = coordinator.watch("/watched", 1, false).await.expect("watch");

        coordinator.put("/unrelated", "v").await.expect("put");
        coordinator.put("/watched", "v").await.expect("put");

        let update = rx.recv().await.expect("update").expect("ok");
        assert!(update.upserts.contains_key("/watched"));
        assert_eq!(update.upserts.len(), 1);
    }

    #[tokio::test]
    async fn join_group_is_idempotent_and_members_are_trimmed() {
        let coordinator = MemoryCoordinator::new();
        coordinator
            .join_group("/task/completers/", "host1", "done")
            .await
            .expect("join");
        coordinator
            .join_group("/task/completers/", "host1", "done")
            .await
            .expect("join again");
        coordinator
            .join_group("/task/completers/", "host2", "done")
            .await
            .expect("join");

        let members = coordinator
            .get_group_members("/task/completers/")
            .await
            .expect("members");
        assert_eq!(members.entries.len(), 2);
        assert!(members.entries.contains_key("host1"));
        assert!(members.entries.contains_key("host2"));
    }

    #[tokio::test]
    async fn wait_group_count_returns_once_the_threshold_is_met() {
        let coordinator = MemoryCoordinator::new();
        let cancel = CancellationToken::new();

        let waiter = {
            let coordinator = coordinator.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                coordinator
                    .wait_group_count("/task/completers/", 2, &cancel)
                    .await
            })
        };

        coordinator
            .join_group("/task/completers/", "host1", "done")
            .await
            .expect("join");
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        coordinator
            .join_group("/task/completers/", "host2", "done")
            .await
            .expect("join");
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("no timeout")
            .expect("join handle")
            .expect("threshold reached");
    }

    #[tokio::test]
    async fn wait_group_count_honors_cancellation() {
        let coordinator = MemoryCoordinator::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = coordinator
            .wait_group_count("/task/completers/", 99, &cancel)
            .await
            .expect_err("cancelled");
        assert!(matches!(err, CoordinatorError::Cancelled));
    }

    #[tokio::test]
    async fn wait_group_count_with_met_threshold_is_immediate() {
        let coordinator = MemoryCoordinator::new();
        coordinator
            .join_group("/task/completers/", "host1", "done")
            .await
            .expect("join");

        let cancel = CancellationToken::new();
        coordinator
            .wait_group_count("/task/completers/", 1, &cancel)
            .await
            .expect("already met");
    }
}
