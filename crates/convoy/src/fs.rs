//! Filesystem helpers for the binary cache.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

/// Whether a path exists, distinguishing "not there" from stat errors.
pub fn path_exists(path: &Path) -> Result<bool> {
    match fs::metadata(path) {
        Ok(_) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err).with_context(|| format!("failed to stat {}", path.display())),
    }
}

/// Streaming SHA-256 of a file, as lowercase hex.
pub fn file_sha256(path: &Path) -> Result<String> {
    let mut file =
        fs::File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)
        .with_context(|| format!("failed to read {}", path.display()))?;
    Ok(hex::encode(hasher.finalize()))
}

/// Immediate subdirectories of `parent`, sorted by name ascending.
pub fn sorted_subdirectories(parent: &Path) -> Result<Vec<PathBuf>> {
    let entries =
        fs::read_dir(parent).with_context(|| format!("failed to list {}", parent.display()))?;
    let mut dirs = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to list {}", parent.display()))?;
        let file_type = entry
            .file_type()
            .with_context(|| format!("failed to stat {}", entry.path().display()))?;
        if file_type.is_dir() {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

/// Remove every directory except the last `keep` of an ascending-sorted
/// list. Operators pick sortable version strings; the tail is the newest.
pub fn keep_last_directories(keep: usize, dirs: &[PathBuf]) -> Result<()> {
    if dirs.len() <= keep {
        return Ok(());
    }
    for dir in &dirs[..dirs.len() - keep] {
        fs::remove_dir_all(dir).with_context(|| format!("failed to remove {}", dir.display()))?;
    }
    Ok(())
}
