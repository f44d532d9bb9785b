//! Content-addressed cache of `.torrent` files under the data root.
//!
//! Layout: `torrents/<first two hash chars>/<hash>.torrent`, lower-case.
//! Paths stored in items and manifests are relative to the data root.

use crate::error::{BackupError, Result};
use crate::models::backup_item;
use crate::utils::safe_path;
use rusqlite::Connection;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const BLOB_DIR: &str = "torrents";

/// Relative store path for a torrent hash.
pub fn blob_rel_path(hash: &str) -> Result<String> {
    let hash = hash.trim().to_ascii_lowercase();
    if hash.is_empty() || !hash.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(BackupError::PathUnsafe(format!("invalid torrent hash {hash:?}")));
    }
    let shard: String = hash.chars().take(2).collect();
    Ok(format!("{BLOB_DIR}/{shard}/{hash}.torrent"))
}

/// Write to a sibling temp file, fsync, then rename over `path`.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| BackupError::PathUnsafe(path.display().to_string()))?;
    fs::create_dir_all(parent)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Store `bytes` for `hash` and return the relative path.
pub fn store(data_dir: &Path, hash: &str, bytes: &[u8]) -> Result<String> {
    let rel = blob_rel_path(hash)?;
    let path = safe_path::resolve_within(data_dir, &rel)?;
    write_atomic(&path, bytes)?;
    Ok(rel)
}

/// Copy an extracted file into the store for `hash`.
pub fn copy_in(data_dir: &Path, hash: &str, source: &Path) -> Result<String> {
    let bytes = fs::read(source)?;
    store(data_dir, hash, &bytes)
}

/// Absolute path of a stored blob, validated against the data root.
pub fn resolve(data_dir: &Path, rel: &str) -> Result<PathBuf> {
    safe_path::resolve_within(data_dir, rel)
}

/// Remove the given blobs unless some item still references them.
/// Returns how many files were deleted.
pub fn collect_garbage(conn: &Connection, data_dir: &Path, candidates: &[String]) -> anyhow::Result<usize> {
    let mut removed = 0;
    for rel in candidates {
        if backup_item::count_blob_references(conn, rel)? > 0 {
            continue;
        }
        let path = match resolve(data_dir, rel) {
            Ok(path) => path,
            Err(e) => {
                tracing::warn!(blob = %rel, error = %e, "Refusing to remove unsafe blob path");
                continue;
            }
        };
        match fs::remove_file(&path) {
            Ok(()) => {
                removed += 1;
                if let Some(parent) = path.parent() {
                    // Only succeeds once the shard directory is empty.
                    let _ = fs::remove_dir(parent);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(blob = %rel, error = %e, "Failed to remove blob"),
        }
    }
    if removed > 0 {
        tracing::info!(removed, "Removed unreferenced blobs");
    }
    Ok(removed)
}
