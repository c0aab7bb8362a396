//! Multi-host rollout scenarios against the in-memory coordinator.
//!
//! Each test drives real rollout drivers for several "hosts" sharing one
//! coordinator, exercising the barrier and crash-recovery semantics the
//! fleet relies on.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use convoy::keys;
use convoy::logger::Logger;
use convoy::rollout::{RolloutActions, RolloutAxis, run_rollout};
use convoy::task;
use convoy_coordinator::Coordinator;
use convoy_coordinator::memory::MemoryCoordinator;
use tokio_util::sync::CancellationToken;

const WS: &str = "/w";

type Journal = Arc<Mutex<Vec<(String, String)>>>;

#[derive(Clone)]
struct RecordingActions {
    host: String,
    journal: Journal,
}

impl RecordingActions {
    fn record(&self, phase: &str) {
        self.journal
            .lock()
            .unwrap()
            .push((self.host.clone(), phase.to_string()));
    }
}

#[async_trait]
impl RolloutActions for RecordingActions {
    async fn prepare(&self) -> Result<()> {
        self.record("prepare");
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.record("shutdown");
        Ok(())
    }

    async fn refresh(&self) -> Result<()> {
        self.record("refresh");
        Ok(())
    }
}

fn spawn_host(
    coordinator: MemoryCoordinator,
    journal: Journal,
    axis: RolloutAxis,
    version: &'static str,
    expected_hosts: u64,
    host: &'static str,
) -> tokio::task::JoinHandle<Result<bool>> {
    tokio::spawn(async move {
        let actions = RecordingActions {
            host: host.to_string(),
            journal,
        };
        let cancel = CancellationToken::new();
        run_rollout(
            &coordinator,
            WS,
            axis,
            version,
            expected_hosts,
            host,
            &actions,
            &cancel,
            &Logger::default(),
        )
        .await
    })
}

async fn phase_task(
    coordinator: &MemoryCoordinator,
    axis: &str,
    version: &str,
    phase: &str,
) -> task::Task {
    let prefix = keys::task_prefix(WS, axis, version, phase);
    let (task, _) = task::get_task(coordinator, &prefix).await.expect("get task");
    task
}

async fn join_rollout(handle: tokio::task::JoinHandle<Result<bool>>) -> bool {
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("rollout within the timeout")
        .expect("join")
        .expect("rollout")
}

#[tokio::test]
async fn hosts_cross_each_barrier_in_lockstep() {
    let coordinator = MemoryCoordinator::new();
    let journal: Journal = Arc::default();

    let h1 = spawn_host(coordinator.clone(), journal.clone(), RolloutAxis::Pools, "B", 3, "h1");
    let h2 = spawn_host(coordinator.clone(), journal.clone(), RolloutAxis::Pools, "B", 3, "h2");

    // h1 and h2 acknowledge and park at the first barrier; h3 is absent.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!h1.is_finished());
    assert!(!h2.is_finished());

    let acknowledgment = phase_task(&coordinator, "pools", "B", "acknowledgment").await;
    assert_eq!(acknowledgment.completers.len(), 2);
    assert!(!acknowledgment.complete);

    let shutdown = phase_task(&coordinator, "pools", "B", "minio_shutdown").await;
    assert!(shutdown.completers.is_empty());

    // The lagger joins; the whole fleet advances through all three phases.
    let h3 = spawn_host(coordinator.clone(), journal.clone(), RolloutAxis::Pools, "B", 3, "h3");
    for handle in [h1, h2, h3] {
        assert!(join_rollout(handle).await);
    }

    // Barrier ordering: every acknowledgment precedes every shutdown, and
    // every shutdown precedes every refresh.
    let journal = journal.lock().unwrap().clone();
    assert_eq!(journal.len(), 9);
    let last_prepare = journal.iter().rposition(|(_, p)| p == "prepare").unwrap();
    let first_shutdown = journal.iter().position(|(_, p)| p == "shutdown").unwrap();
    let last_shutdown = journal.iter().rposition(|(_, p)| p == "shutdown").unwrap();
    let first_refresh = journal.iter().position(|(_, p)| p == "refresh").unwrap();
    assert!(last_prepare < first_shutdown);
    assert!(last_shutdown < first_refresh);

    for phase in ["acknowledgment", "minio_shutdown", "systemd_update"] {
        let task = phase_task(&coordinator, "pools", "B", phase).await;
        assert!(task.complete);
        assert_eq!(task.completers.len(), 3);
    }
}

#[tokio::test]
async fn a_host_that_crashed_before_marking_itself_replays_the_action() {
    let coordinator = MemoryCoordinator::new();

    // The fleet finished acknowledging. h2 ran its shutdown action but
    // crashed before writing its completer; h1 and h3 are already done
    // with shutdown and refresh and are waiting on h2.
    let ack = keys::task_prefix(WS, "pools", "B", "acknowledgment");
    coordinator.put(&keys::complete_key(&ack), "true").await.expect("seed");
    for host in ["h1", "h2", "h3"] {
        task::mark_self(&coordinator, &ack, host).await.expect("seed");
    }
    let shutdown = keys::task_prefix(WS, "pools", "B", "minio_shutdown");
    let refresh = keys::task_prefix(WS, "pools", "B", "systemd_update");
    for host in ["h1", "h3"] {
        task::mark_self(&coordinator, &shutdown, host).await.expect("seed");
        task::mark_self(&coordinator, &refresh, host).await.expect("seed");
    }

    let journal: Journal = Arc::default();
    let h2 = spawn_host(coordinator.clone(), journal.clone(), RolloutAxis::Pools, "B", 3, "h2");
    assert!(join_rollout(h2).await);

    // The shutdown action ran again (it is idempotent), then refresh.
    let journal = journal.lock().unwrap().clone();
    let phases: Vec<&str> = journal.iter().map(|(_, p)| p.as_str()).collect();
    assert_eq!(phases, vec!["shutdown", "refresh"]);

    for prefix in [&shutdown, &refresh] {
        let (task, _) = task::get_task(&coordinator, prefix).await.expect("get");
        assert!(task.complete);
        assert_eq!(task.completers.len(), 3);
    }
}

#[tokio::test]
async fn a_host_that_crashed_after_marking_itself_skips_the_action() {
    let coordinator = MemoryCoordinator::new();

    // Same as above, but h2's shutdown completer made it to the
    // coordinator before the crash.
    let ack = keys::task_prefix(WS, "pools", "B", "acknowledgment");
    coordinator.put(&keys::complete_key(&ack), "true").await.expect("seed");
    let shutdown = keys::task_prefix(WS, "pools", "B", "minio_shutdown");
    for host in ["h1", "h2", "h3"] {
        task::mark_self(&coordinator, &shutdown, host).await.expect("seed");
    }
    let refresh = keys::task_prefix(WS, "pools", "B", "systemd_update");
    for host in ["h1", "h3"] {
        task::mark_self(&coordinator, &refresh, host).await.expect("seed");
    }

    let journal: Journal = Arc::default();
    let h2 = spawn_host(coordinator.clone(), journal.clone(), RolloutAxis::Pools, "B", 3, "h2");
    assert!(join_rollout(h2).await);

    // Shutdown was not replayed; only the outstanding refresh ran.
    let journal = journal.lock().unwrap().clone();
    let phases: Vec<&str> = journal.iter().map(|(_, p)| p.as_str()).collect();
    assert_eq!(phases, vec!["refresh"]);
}

#[tokio::test]
async fn a_late_joiner_treats_a_closed_rollout_as_done() {
    let coordinator = MemoryCoordinator::new();

    // Five hosts finished the rollout end to end before h6 was provisioned.
    for phase in ["acknowledgment", "minio_shutdown", "systemd_update"] {
        let prefix = keys::task_prefix(WS, "pools", "B", phase);
        for host in ["h1", "h2", "h3", "h4", "h5"] {
            task::mark_self(&coordinator, &prefix, host).await.expect("seed");
        }
        coordinator.put(&keys::complete_key(&prefix), "true").await.expect("seed");
    }

    // h6 evaluates the rollout against the six-host topology it joined
    // under; the markers alone say there is nothing to do.
    let journal: Journal = Arc::default();
    let h6 = spawn_host(coordinator.clone(), journal.clone(), RolloutAxis::Pools, "B", 6, "h6");
    let ran = tokio::time::timeout(Duration::from_secs(5), h6)
        .await
        .expect("no timeout")
        .expect("join")
        .expect("rollout");
    assert!(!ran);
    assert!(journal.lock().unwrap().is_empty());
}

#[tokio::test]
async fn rerunning_a_finished_rollout_is_a_no_op() {
    let coordinator = MemoryCoordinator::new();
    let journal: Journal = Arc::default();

    let first = spawn_host(coordinator.clone(), journal.clone(), RolloutAxis::Pools, "B", 1, "h1");
    assert!(join_rollout(first).await);
    assert_eq!(journal.lock().unwrap().len(), 3);

    let second = spawn_host(coordinator.clone(), journal.clone(), RolloutAxis::Pools, "B", 1, "h1");
    let ran = tokio::time::timeout(Duration::from_secs(5), second)
        .await
        .expect("no timeout")
        .expect("join")
        .expect("rollout");
    assert!(!ran);
    assert_eq!(journal.lock().unwrap().len(), 3);

    // The completer was written exactly once per phase.
    for phase in ["acknowledgment", "minio_shutdown", "systemd_update"] {
        let task = phase_task(&coordinator, "pools", "B", phase).await;
        assert_eq!(task.completers, vec!["h1".to_string()]);
    }
}

#[tokio::test]
async fn release_rollouts_use_their_own_keyspace() {
    let coordinator = MemoryCoordinator::new();
    let journal: Journal = Arc::default();

    let host = spawn_host(coordinator.clone(), journal.clone(), RolloutAxis::Release, "v2", 1, "h1");
    assert!(join_rollout(host).await);

    for phase in ["binary_download", "minio_shutdown", "systemd_update"] {
        let task = phase_task(&coordinator, "release", "v2", phase).await;
        assert!(task.complete);
        assert_eq!(task.completers, vec!["h1".to_string()]);
    }

    // Nothing leaked into the pools keyspace.
    let pools = coordinator.get_prefix("/w/tasks/pools/").await.expect("snapshot");
    assert!(pools.entries.is_empty());
}

#[tokio::test]
async fn a_failing_local_action_leaves_no_completer_behind() {
    struct FailingActions;

    #[async_trait]
    impl RolloutActions for FailingActions {
        async fn prepare(&self) -> Result<()> {
            anyhow::bail!("download failed")
        }

        async fn shutdown(&self) -> Result<()> {
            Ok(())
        }

        async fn refresh(&self) -> Result<()> {
            Ok(())
        }
    }

    let coordinator = MemoryCoordinator::new();
    let cancel = CancellationToken::new();
    let outcome = run_rollout(
        &coordinator,
        WS,
        RolloutAxis::Release,
        "v2",
        1,
        "h1",
        &FailingActions,
        &cancel,
        &Logger::default(),
    )
    .await;
    assert!(outcome.is_err());

    // The failed phase holds no completer, so a restart replays it.
    let prefix = keys::task_prefix(WS, "release", "v2", "binary_download");
    let (task, _) = task::get_task(&coordinator, &prefix).await.expect("get");
    assert!(task.completers.is_empty());
    assert!(!task.complete);
}
