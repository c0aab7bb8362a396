//! Release model: which binary the fleet should run.

use anyhow::{Context, Result, bail};
use convoy_coordinator::Coordinator;
use serde::Deserialize;

use crate::keys;

/// A versioned server binary: where to fetch it and what it must hash to.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Release {
    pub version: String,
    pub url: String,
    /// Expected SHA-256 of the binary at `url`, as lowercase hex.
    pub checksum: String,
}

impl Release {
    pub fn validate(&self) -> Result<()> {
        if self.version.is_empty() {
            bail!("release version must not be empty");
        }
        if self.url.is_empty() {
            bail!("release url must not be empty");
        }
        let checksum_ok = self.checksum.len() == 64
            && self
                .checksum
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if !checksum_ok {
            bail!("release checksum must be a lowercase hex sha-256 digest");
        }
        Ok(())
    }
}

/// Parse and validate a release document.
pub fn parse_release(raw: &str) -> Result<Release> {
    let release: Release =
        serde_yaml::from_str(raw).context("error parsing the minio release configuration")?;
    release.validate()?;
    Ok(release)
}

/// Read the current release from the coordinator.
pub async fn get_release(
    coordinator: &dyn Coordinator,
    config_prefix: &str,
) -> Result<(Release, i64)> {
    let key = keys::release_key(config_prefix);
    let info = coordinator
        .get(&key)
        .await
        .context("failed to read the minio release configuration")?;
    if !info.found {
        bail!("minio release configuration is not set");
    }
    let release = parse_release(&info.value)?;
    Ok((release, info.mod_revision))
}
