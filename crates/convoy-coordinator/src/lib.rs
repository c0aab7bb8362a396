//! Coordinator contract and etcd-backed client for convoy.
//!
//! This crate defines the thin contract the rollout engine has with the
//! strongly consistent key-value store that every agent in the fleet
//! shares: point reads, atomic prefix snapshots, unconditional writes,
//! resumable watch streams, and group membership helpers built on them.
//!
//! Two implementations are provided:
//!
//! - [`EtcdCoordinator`] — the production backend, speaking to an etcd
//!   cluster with a configurable retry budget, request timeouts, and
//!   either mTLS or password authentication.
//! - [`memory::MemoryCoordinator`] — an in-process backend with the same
//!   revision and watch-replay semantics, for tests and examples.
//!
//! # Example
//!
//! ```
//! use convoy_coordinator::{Coordinator, memory::MemoryCoordinator};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let coordinator = MemoryCoordinator::new();
//! coordinator.put("/fleet/release", "v1").await.expect("put");
//!
//! let info = coordinator.get("/fleet/release").await.expect("get");
//! assert!(info.found);
//! assert_eq!(info.value, "v1");
//! # }
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Certificate, Client, ConnectOptions, EventType, GetOptions, Identity, TlsOptions, WatchOptions,
};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub mod memory;

/// Errors surfaced by a coordinator backend.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// Could not establish a session with the coordinator cluster.
    #[error("failed to connect to coordinator: {0}")]
    Connect(String),
    /// A unary request failed after exhausting the retry budget.
    #[error("coordinator request failed: {0}")]
    Request(String),
    /// Credential material could not be loaded or parsed.
    #[error("coordinator auth error: {0}")]
    Auth(String),
    /// A watch stream terminated without being asked to.
    #[error("coordinator watch stream ended unexpectedly")]
    WatchClosed,
    /// The caller's cancellation signal fired while waiting.
    #[error("coordinator operation cancelled")]
    Cancelled,
}

/// Result of a single-key read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyInfo {
    /// Whether the key exists.
    pub found: bool,
    /// The key's value; empty when not found.
    pub value: String,
    /// The revision at which the key was last modified; 0 when not found.
    pub mod_revision: i64,
}

/// An atomic multi-key snapshot taken at a single store revision.
#[derive(Debug, Clone, Default)]
pub struct PrefixSnapshot {
    /// Key/value pairs under the requested prefix.
    pub entries: BTreeMap<String, String>,
    /// The store revision the snapshot was taken at.
    pub revision: i64,
}

/// One batch of committed changes delivered on a watch stream.
#[derive(Debug, Clone, Default)]
pub struct WatchUpdate {
    /// The store revision this batch was committed at.
    pub revision: i64,
    /// Keys created or overwritten, with their new values.
    pub upserts: BTreeMap<String, String>,
    /// Keys removed.
    pub deletions: Vec<String>,
}

/// Receiving half of a watch stream. The channel closing without a prior
/// error means the backend tore the watch down.
pub type WatchReceiver = mpsc::UnboundedReceiver<Result<WatchUpdate, CoordinatorError>>;

/// The contract the rollout engine has with the shared key-value store.
///
/// Backends must guarantee that watch streams are monotonic in revision
/// and never miss a committed change at or after the requested starting
/// revision. Group operations are plain key operations under a shared
/// prefix; [`Coordinator::wait_group_count`] is provided on top of them.
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Read a single key.
    async fn get(&self, key: &str) -> Result<KeyInfo, CoordinatorError>;

    /// Read every key under a prefix at one consistent revision.
    async fn get_prefix(&self, prefix: &str) -> Result<PrefixSnapshot, CoordinatorError>;

    /// Unconditionally write a key.
    async fn put(&self, key: &str, value: &str) -> Result<(), CoordinatorError>;

    /// Open a change feed for a key (or every key under a prefix) starting
    /// at `from_revision`. Callers resume a stream by passing one past the
    /// last revision they observed.
    async fn watch(
        &self,
        key: &str,
        from_revision: i64,
        is_prefix: bool,
    ) -> Result<WatchReceiver, CoordinatorError>;

    /// Add a member to a group by writing `<prefix><member>`. Idempotent
    /// when the pair already exists.
    async fn join_group(
        &self,
        prefix: &str,
        member: &str,
        value: &str,
    ) -> Result<(), CoordinatorError> {
        self.put(&format!("{prefix}{member}"), value).await
    }

    /// List a group's members, keyed by member id (prefix stripped).
    async fn get_group_members(&self, prefix: &str) -> Result<PrefixSnapshot, CoordinatorError> {
        let snapshot = self.get_prefix(prefix).await?;
        let entries = snapshot
            .entries
            .into_iter()
            .map(|(key, value)| {
                let member = key.strip_prefix(prefix).unwrap_or(key.as_str()).to_string();
                (member, value)
            })
            .collect();
        Ok(PrefixSnapshot {
            entries,
            revision: snapshot.revision,
        })
    }

    /// Block until a group's member count reaches `threshold`.
    ///
    /// The snapshot-then-watch sequence cannot miss a joining member: the
    /// watch resumes from one past the snapshot revision.
    async fn wait_group_count(
        &self,
        prefix: &str,
        threshold: u64,
        cancel: &CancellationToken,
    ) -> Result<(), CoordinatorError> {
        let snapshot = self.get_group_members(prefix).await?;
        let revision = snapshot.revision;
        let mut members: BTreeSet<String> = snapshot.entries.into_keys().collect();
        if members.len() as u64 >= threshold {
            return Ok(());
        }

        let mut updates = self.watch(prefix, revision + 1, true).await?;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(CoordinatorError::Cancelled),
                update = updates.recv() => match update {
                    None => return Err(CoordinatorError::WatchClosed),
                    Some(Err(err)) => return Err(err),
                    Some(Ok(update)) => {
                        for key in update.upserts.keys() {
                            members.insert(key.strip_prefix(prefix).unwrap_or(key.as_str()).to_string());
                        }
                        for key in &update.deletions {
                            members.remove(key.strip_prefix(prefix).unwrap_or(key.as_str()));
                        }
                        if members.len() as u64 >= threshold {
                            return Ok(());
                        }
                    }
                },
            }
        }
    }
}

fn default_connection_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_retry_interval() -> Duration {
    Duration::from_secs(5)
}

/// Transport and keyspace configuration for the coordinator connection.
#[derive(Debug, Clone, Deserialize)]
pub struct CoordinatorConfig {
    /// Keyspace prefix the operator publishes configuration under.
    #[serde(default)]
    pub config_prefix: String,
    /// Keyspace prefix the agents write rollout state under.
    #[serde(default)]
    pub workspace_prefix: String,
    /// Coordinator cluster addresses.
    #[serde(default)]
    pub endpoints: Vec<String>,
    /// Dial timeout for the initial session.
    #[serde(default = "default_connection_timeout", with = "humantime_serde")]
    pub connection_timeout: Duration,
    /// Deadline applied to each unary request.
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Pause between retries of a failed request.
    #[serde(default = "default_retry_interval", with = "humantime_serde")]
    pub retry_interval: Duration,
    /// How many times a failed request is retried before surfacing.
    #[serde(default)]
    pub retries: u64,
    /// Credential configuration.
    #[serde(default)]
    pub auth: AuthConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            config_prefix: String::new(),
            workspace_prefix: String::new(),
            endpoints: Vec::new(),
            connection_timeout: default_connection_timeout(),
            request_timeout: default_request_timeout(),
            retry_interval: default_retry_interval(),
            retries: 0,
            auth: AuthConfig::default(),
        }
    }
}

/// Credential configuration. A configured client certificate disables
/// password resolution entirely.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    /// CA certificate validating the cluster's server certificates.
    #[serde(default)]
    pub ca_cert: Option<PathBuf>,
    /// Client certificate for mTLS.
    #[serde(default)]
    pub client_cert: Option<PathBuf>,
    /// Private key for the client certificate.
    #[serde(default)]
    pub client_key: Option<PathBuf>,
    /// Path to a YAML file holding `{username, password}`.
    #[serde(default)]
    pub password_auth: Option<PathBuf>,
}

/// Username and password loaded from the password auth file.
#[derive(Debug, Clone, Deserialize)]
pub struct PasswordAuth {
    pub username: String,
    pub password: String,
}

impl AuthConfig {
    /// Whether any TLS material is configured.
    pub fn uses_tls(&self) -> bool {
        self.ca_cert.is_some() || self.client_cert.is_some()
    }

    /// Resolve password credentials from the referenced file. Returns
    /// `None` when a client certificate is configured or no password file
    /// is named.
    pub fn resolve_password(&self) -> Result<Option<PasswordAuth>, CoordinatorError> {
        if self.client_cert.is_some() {
            return Ok(None);
        }
        let Some(path) = &self.password_auth else {
            return Ok(None);
        };
        let raw = std::fs::read_to_string(path).map_err(|err| {
            CoordinatorError::Auth(format!("error reading the password auth file: {err}"))
        })?;
        let creds: PasswordAuth = serde_yaml::from_str(&raw).map_err(|err| {
            CoordinatorError::Auth(format!("error parsing the password auth file: {err}"))
        })?;
        Ok(Some(creds))
    }
}

/// etcd-backed coordinator.
///
/// Unary requests retry up to the configured budget with a constant pause
/// between attempts before the error surfaces to the caller. Watches are
/// pumped into a channel by a task that owns the etcd watcher handle for
/// the stream's lifetime.
pub struct EtcdCoordinator {
    client: Client,
    retries: u64,
    retry_interval: Duration,
}

impl EtcdCoordinator {
    /// Establish a session with the cluster described by `config`.
    pub async fn connect(config: &CoordinatorConfig) -> Result<Self, CoordinatorError> {
        let creds = config.auth.resolve_password()?;

        let mut options = ConnectOptions::new()
            .with_connect_timeout(config.connection_timeout)
            .with_timeout(config.request_timeout);
        if let Some(creds) = creds {
            options = options.with_user(creds.username, creds.password);
        }
        if config.auth.uses_tls() {
            let mut tls = TlsOptions::new();
            if let Some(ca_path) = &config.auth.ca_cert {
                let pem = std::fs::read(ca_path).map_err(|err| {
                    CoordinatorError::Auth(format!("failed to read root certificate file: {err}"))
                })?;
                tls = tls.ca_certificate(Certificate::from_pem(pem));
            }
            if let (Some(cert_path), Some(key_path)) =
                (&config.auth.client_cert, &config.auth.client_key)
            {
                let cert = std::fs::read(cert_path).map_err(|err| {
                    CoordinatorError::Auth(format!("failed to read client certificate: {err}"))
                })?;
                let key = std::fs::read(key_path).map_err(|err| {
                    CoordinatorError::Auth(format!("failed to read client key: {err}"))
                })?;
                tls = tls.identity(Identity::from_pem(cert, key));
            }
            options = options.with_tls(tls);
        }

        let mut attempt = 0u64;
        let client = loop {
            match Client::connect(&config.endpoints, Some(options.clone())).await {
                Ok(client) => break client,
                Err(err) => {
                    attempt += 1;
                    if attempt > config.retries {
                        return Err(CoordinatorError::Connect(err.to_string()));
                    }
                    tokio::time::sleep(config.retry_interval).await;
                }
            }
        };

        Ok(Self {
            client,
            retries: config.retries,
            retry_interval: config.retry_interval,
        })
    }

    async fn with_retries<T, F, Fut>(&self, mut op: F) -> Result<T, CoordinatorError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, etcd_client::Error>>,
    {
        let mut attempt = 0u64;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    attempt += 1;
                    if attempt > self.retries {
                        return Err(CoordinatorError::Request(err.to_string()));
                    }
                    tokio::time::sleep(self.retry_interval).await;
                }
            }
        }
    }
}

#[async_trait]
impl Coordinator for EtcdCoordinator {
    async fn get(&self, key: &str) -> Result<KeyInfo, CoordinatorError> {
        let response = self
            .with_retries(|| {
                let mut client = self.client.clone();
                let key = key.to_string();
                async move { client.get(key, None).await }
            })
            .await?;

        match response.kvs().first() {
            Some(kv) => Ok(KeyInfo {
                found: true,
                value: kv
                    .value_str()
                    .map_err(|err| CoordinatorError::Request(err.to_string()))?
                    .to_string(),
                mod_revision: kv.mod_revision(),
            }),
            None => Ok(KeyInfo {
                found: false,
                value: String::new(),
                mod_revision: 0,
            }),
        }
    }

    async fn get_prefix(&self, prefix: &str) -> Result<PrefixSnapshot, CoordinatorError> {
        let response = self
            .with_retries(|| {
                let mut client = self.client.clone();
                let prefix = prefix.to_string();
                async move { client.get(prefix, Some(GetOptions::new().with_prefix())).await }
            })
            .await?;

        let revision = response.header().map(|h| h.revision()).unwrap_or(0);
        let mut entries = BTreeMap::new();
        for kv in response.kvs() {
            let key = kv
                .key_str()
                .map_err(|err| CoordinatorError::Request(err.to_string()))?;
            let value = kv
                .value_str()
                .map_err(|err| CoordinatorError::Request(err.to_string()))?;
            entries.insert(key.to_string(), value.to_string());
        }
        Ok(PrefixSnapshot { entries, revision })
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), CoordinatorError> {
        self.with_retries(|| {
            let mut client = self.client.clone();
            let key = key.to_string();
            let value = value.to_string();
            async move { client.put(key, value, None).await }
        })
        .await?;
        Ok(())
    }

    async fn watch(
        &self,
        key: &str,
        from_revision: i64,
        is_prefix: bool,
    ) -> Result<WatchReceiver, CoordinatorError> {
        let mut client = self.client.clone();
        let mut options = WatchOptions::new().with_start_revision(from_revision);
        if is_prefix {
            options = options.with_prefix();
        }
        let (watcher, mut stream) = client
            .watch(key, Some(options))
            .await
            .map_err(|err| CoordinatorError::Request(err.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            // Dropping the watcher cancels the server-side stream, so it
            // lives as long as the pump.
            let _watcher = watcher;
            loop {
                match stream.message().await {
                    Ok(Some(response)) => {
                        if response.canceled() {
                            let _ = tx.send(Err(CoordinatorError::WatchClosed));
                            break;
                        }
                        let revision = response.header().map(|h| h.revision()).unwrap_or(0);
                        let mut upserts = BTreeMap::new();
                        let mut deletions = Vec::new();
                        for event in response.events() {
                            let Some(kv) = event.kv() else { continue };
                            let Ok(key) = kv.key_str() else { continue };
                            match event.event_type() {
                                EventType::Put => {
                                    upserts.insert(
                                        key.to_string(),
                                        kv.value_str().unwrap_or("").to_string(),
                                    );
                                }
                                EventType::Delete => deletions.push(key.to_string()),
                            }
                        }
                        if upserts.is_empty() && deletions.is_empty() {
                            continue;
                        }
                        let update = WatchUpdate {
                            revision,
                            upserts,
                            deletions,
                        };
                        if tx.send(Ok(update)).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        let _ = tx.send(Err(CoordinatorError::Request(err.to_string())));
                        break;
                    }
                }
            }
        });
        Ok(rx)
    }
}
