//! # Convoy
//!
//! A per-node agent that keeps a MinIO fleet's service units and server
//! binary in lockstep through coordinated rollouts.
//!
//! Every node runs exactly one agent. The agents share no direct
//! connections; they cooperate through a strongly consistent key-value
//! store (etcd) where operators publish two documents, the server-pool
//! topology and the binary release, and where the agents keep all
//! rollout progress.
//!
//! ## How a rollout works
//!
//! A change to either document starts a three-phase rollout. Each phase
//! is a fleet-wide barrier: a host runs the phase's local action, writes
//! its completer key, and waits until every host in the topology has done
//! the same (or until the phase's terminal marker is observed) before
//! moving on.
//!
//! - Topology change: acknowledge → stop services → regenerate units.
//! - Release change: download + verify binary → stop services →
//!   regenerate units.
//!
//! Progress lives entirely in the coordinator. An agent restarted at any
//! point rebuilds its position from the task keyspaces, skips local
//! actions it already completed, and rejoins the barrier it was at.
//! Rollouts are forward-only; recovery from a bad configuration is
//! publishing a corrected one.
//!
//! ## Pipeline
//!
//! 1. [`config::AgentConfig::load_default`] reads the static YAML
//!    configuration.
//! 2. [`bootstrap::run`] connects the coordinator, installs the service
//!    if missing, resumes any in-progress rollouts, and starts the
//!    service.
//! 3. [`watch::handle_changes`] observes both configuration keys from the
//!    startup snapshot's revision and dispatches rollouts serially.
//! 4. [`rollout::run_rollout`] drives each rollout through its barriers
//!    via [`task`].
//!
//! ## Modules
//!
//! - [`bootstrap`] — startup sequence and the runtime loop
//! - [`watch`] — configuration watcher and rollout dispatcher
//! - [`rollout`] — the per-axis rollout state machine
//! - [`task`] — the distributed barrier primitive
//! - [`topology`] — server-pool model and argument rendering
//! - [`release`] — binary release model
//! - [`binary`] — binary cache: download, verify, prune
//! - [`systemd`] — service-unit rendering and `systemctl` driving
//! - [`keys`] — canonical coordinator keyspace layout
//! - [`config`] — static agent configuration
//! - [`logger`] — leveled logging passed as an explicit value
//! - [`fs`] — filesystem helpers
//!
//! The coordinator contract itself lives in the
//! [`convoy-coordinator`](coordinator) crate, re-exported here.

/// Binary cache: download, verify, prune.
pub mod binary;

/// Startup sequence and the runtime loop.
pub mod bootstrap;

/// Static agent configuration.
pub mod config;

/// Filesystem helpers.
pub mod fs;

/// Canonical coordinator keyspace layout.
pub mod keys;

/// Leveled logging passed as an explicit value.
pub mod logger;

/// Binary release model.
pub mod release;

/// The per-axis rollout state machine.
pub mod rollout;

/// Service-unit rendering and `systemctl` driving.
pub mod systemd;

/// The distributed barrier primitive.
pub mod task;

/// Server-pool model and argument rendering.
pub mod topology;

/// Configuration watcher and rollout dispatcher.
pub mod watch;

/// Coordinator contract and backends.
/// Re-exported from the convoy-coordinator microcrate.
pub use convoy_coordinator as coordinator;
