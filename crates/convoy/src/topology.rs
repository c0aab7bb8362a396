//! Server-pool topology: the declarative description of the fleet.
//!
//! A topology is a versioned list of rectangular pools. Each pool shares
//! one API port and mount layout across a contiguous range of hosts. The
//! rendering below produces the argument list the MinIO server's own
//! parser consumes; brace ranges (`{1...4}`) are passed through verbatim,
//! never expanded here.

use anyhow::{Context, Result, bail};
use convoy_coordinator::Coordinator;
use serde::Deserialize;

use crate::keys;

/// A contiguous group of hosts sharing a port and mount pattern.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerPool {
    pub api_port: u16,
    pub domain_template: String,
    pub server_count_begin: u32,
    pub server_count_end: u32,
    pub mount_path_template: String,
    pub mount_count: u32,
}

/// Substitute the first `%d` (or `%s`) in a template with a token.
fn fill_template(template: &str, token: &str) -> String {
    let slot = ["%d", "%s"]
        .iter()
        .filter_map(|verb| template.find(*verb))
        .min();
    match slot {
        Some(index) => {
            let mut filled = String::with_capacity(template.len() + token.len());
            filled.push_str(&template[..index]);
            filled.push_str(token);
            filled.push_str(&template[index + 2..]);
            filled
        }
        None => template.to_string(),
    }
}

/// Render an inclusive range in MinIO's brace syntax. A singleton range
/// collapses to the bare index.
fn range_token(begin: u32, end: u32) -> String {
    if begin == end {
        begin.to_string()
    } else {
        format!("{{{begin}...{end}}}")
    }
}

fn join_data_path(pool: &str, dir: &str) -> String {
    if dir.starts_with('/') {
        format!("{pool}{dir}")
    } else {
        format!("{pool}/{dir}")
    }
}

impl ServerPool {
    /// Hosts this pool contributes to the fleet.
    pub fn host_count(&self) -> u64 {
        u64::from(self.server_count_end - self.server_count_begin + 1)
    }

    /// Render the pool as one MinIO server argument, with an optional
    /// per-tenant data path appended to each mount.
    pub fn stringify(&self, data_path: Option<&str>) -> String {
        let domain = fill_template(
            &self.domain_template,
            &range_token(self.server_count_begin, self.server_count_end),
        );
        let mounts = fill_template(&self.mount_path_template, &range_token(1, self.mount_count));
        let mut rendered = format!("https://{domain}:{port}{mounts}", port = self.api_port);
        if let Some(dir) = data_path
            && !dir.is_empty()
        {
            rendered = join_data_path(&rendered, dir);
        }
        rendered
    }

    fn validate(&self) -> Result<()> {
        if self.api_port == 0 {
            bail!("server pool api_port must be between 1 and 65535");
        }
        if self.server_count_begin > self.server_count_end {
            bail!(
                "server pool range is inverted: {} > {}",
                self.server_count_begin,
                self.server_count_end
            );
        }
        if self.mount_count == 0 {
            bail!("server pool mount_count must be positive");
        }
        Ok(())
    }
}

/// A versioned set of server pools. The version is the rollout identity:
/// two topologies are the same rollout iff their versions are equal.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Topology {
    pub version: String,
    #[serde(default)]
    pub pools: Vec<ServerPool>,
}

impl Topology {
    /// Fleet size: the barrier threshold for every rollout phase.
    pub fn count_hosts(&self) -> u64 {
        self.pools.iter().map(ServerPool::host_count).sum()
    }

    /// Render the whole pool set as a space-separated argument list.
    pub fn stringify(&self, data_path: Option<&str>) -> String {
        self.pools
            .iter()
            .map(|pool| pool.stringify(data_path))
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn validate(&self) -> Result<()> {
        if self.version.is_empty() {
            bail!("server pools version must not be empty");
        }
        for pool in &self.pools {
            pool.validate()?;
        }
        Ok(())
    }
}

/// Parse and validate a server pools document.
pub fn parse_topology(raw: &str) -> Result<Topology> {
    let topology: Topology =
        serde_yaml::from_str(raw).context("error parsing the server pools configuration")?;
    topology.validate()?;
    Ok(topology)
}

/// Read the current topology from the coordinator.
pub async fn get_topology(
    coordinator: &dyn Coordinator,
    config_prefix: &str,
) -> Result<(Topology, i64)> {
    let key = keys::pools_key(config_prefix);
    let info = coordinator
        .get(&key)
        .await
        .context("failed to read the server pools configuration")?;
    if !info.found {
        bail!("server pools configuration is not set");
    }
    let topology = parse_topology(&info.value)?;
    Ok((topology, info.mod_revision))
}
