//! Binary cache: download, verify, prune.
//!
//! Binaries are cached under `<binaries_dir>/<release-version>/<name>`.
//! Version directories accumulate across rollouts and are pruned down to
//! the newest after a release rollout completes.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tokio::io::AsyncWriteExt;

use crate::fs;
use crate::logger::Logger;

/// Transport errors and HTTP error statuses are retried this many times.
const DOWNLOAD_ATTEMPTS: u32 = 3;

/// How many version directories survive a prune.
const BINARIES_KEPT: usize = 1;

/// Where a release's binary lives in the cache.
pub fn minio_path(binaries_dir: &Path, version: &str, binary_name: &str) -> PathBuf {
    binaries_dir.join(version).join(binary_name)
}

/// Fetch a release binary into the cache and verify its checksum.
///
/// A pre-existing file with a matching checksum short-circuits the
/// download; one with a mismatched checksum is removed first. A
/// mismatched download is removed and fatal.
pub async fn fetch_binary(
    url: &str,
    version: &str,
    expected_sha: &str,
    binaries_dir: &Path,
    binary_name: &str,
    log: &Logger,
) -> Result<()> {
    let binary_dir = binaries_dir.join(version);
    let binary_path = binary_dir.join(binary_name);

    if fs::path_exists(&binary_path)? {
        let sha = fs::file_sha256(&binary_path)
            .context("failed to checksum the pre-existing download")?;
        if sha == expected_sha {
            log.info(format!(
                "[binary] {} already downloaded with a matching checksum",
                binary_path.display()
            ));
            return Ok(());
        }
        log.warn(format!(
            "[binary] removing pre-existing download {} with a mismatched checksum",
            binary_path.display()
        ));
        std::fs::remove_file(&binary_path)
            .context("failed to remove the mismatched pre-existing download")?;
    }

    tokio::fs::create_dir_all(&binary_dir)
        .await
        .with_context(|| format!("failed to create {}", binary_dir.display()))?;

    log.info(format!("[binary] downloading {url} to {}", binary_path.display()));
    download(url, &binary_path, log).await?;

    let sha = fs::file_sha256(&binary_path).context("failed to checksum the downloaded binary")?;
    if sha != expected_sha {
        std::fs::remove_file(&binary_path).with_context(|| {
            format!("failed to remove {} after a checksum mismatch", binary_path.display())
        })?;
        bail!("downloaded binary checksum did not match the expected value: {sha} != {expected_sha}");
    }

    std::fs::set_permissions(&binary_path, std::fs::Permissions::from_mode(0o755))
        .with_context(|| format!("failed to mark {} executable", binary_path.display()))?;
    Ok(())
}

async fn download(url: &str, path: &Path, log: &Logger) -> Result<()> {
    let client = reqwest::Client::new();
    let mut last_error = anyhow::anyhow!("no download attempts were made");
    for attempt in 1..=DOWNLOAD_ATTEMPTS {
        if attempt > 1 {
            log.warn(format!(
                "[binary] retrying download of {url} (attempt {attempt}/{DOWNLOAD_ATTEMPTS})"
            ));
        }
        match try_download(&client, url, path).await {
            Ok(()) => return Ok(()),
            Err(err) => last_error = err,
        }
    }
    Err(last_error.context(format!("error downloading {url}")))
}

async fn try_download(client: &reqwest::Client, url: &str, path: &Path) -> Result<()> {
    let mut response = client.get(url).send().await.context("request failed")?;
    let status = response.status();
    if status.as_u16() >= 400 {
        bail!("server returned error code {status}");
    }

    let mut file = tokio::fs::File::create(path)
        .await
        .with_context(|| format!("failed to open {} for writing", path.display()))?;
    while let Some(chunk) = response.chunk().await.context("failed reading the response body")? {
        file.write_all(&chunk)
            .await
            .with_context(|| format!("failed writing to {}", path.display()))?;
    }
    file.flush()
        .await
        .with_context(|| format!("failed writing to {}", path.display()))?;
    Ok(())
}

/// Remove all but the newest version directory from the cache.
pub fn cleanup_old_binaries(binaries_dir: &Path, log: &Logger) -> Result<()> {
    log.info("[binary] pruning old binary directories");
    let dirs =
        fs::sorted_subdirectories(binaries_dir).context("error cleaning up old binaries")?;
    fs::keep_last_directories(BINARIES_KEPT, &dirs).context("error cleaning up old binaries")
}
