//! One-time move of blobs stored under the old `backups/` prefix.
//!
//! Older layouts kept the blob cache at `backups/<rel>` while items recorded
//! `<rel>`. This moves each such file to `<rel>` so reads need only one path.
//! Running it again is a no-op.

use crate::db::connection::DbPool;
use crate::models::backup_item;
use crate::utils::safe_path;
use serde::Serialize;
use std::fs;
use std::path::Path;

const LEGACY_PREFIX: &str = "backups";

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct LegacyMigrationReport {
    pub moved: usize,
    pub already_in_place: usize,
    pub missing: usize,
}

pub fn migrate_legacy_blob_paths(pool: &DbPool, data_dir: &Path) -> anyhow::Result<LegacyMigrationReport> {
    let conn = pool.get()?;
    let mut report = LegacyMigrationReport::default();

    for rel in backup_item::all_blob_paths(&conn)? {
        let (canonical, legacy) = match (
            safe_path::resolve_within(data_dir, &rel),
            safe_path::resolve_within(data_dir, &format!("{LEGACY_PREFIX}/{rel}")),
        ) {
            (Ok(c), Ok(l)) => (c, l),
            _ => {
                tracing::warn!(blob = %rel, "[BLOB_MIGRATION] Unsafe blob path, skipping");
                report.missing += 1;
                continue;
            }
        };

        if canonical.exists() {
            report.already_in_place += 1;
            continue;
        }
        if !legacy.exists() {
            tracing::warn!(blob = %rel, "[BLOB_MIGRATION] Blob missing from both layouts");
            report.missing += 1;
            continue;
        }

        if let Some(parent) = canonical.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&legacy, &canonical)?;
        tracing::info!(blob = %rel, "[BLOB_MIGRATION] Moved legacy blob");
        report.moved += 1;
    }

    if report.moved > 0 || report.missing > 0 {
        tracing::info!(
            moved = report.moved,
            missing = report.missing,
            "[BLOB_MIGRATION] Legacy blob migration finished"
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::migrate::test_pool;
    use crate::models::backup_item::BackupItem;
    use crate::models::backup_run::{self, RunKind};
    use tempfile::TempDir;

    #[test]
    fn test_moves_legacy_blobs_once() {
        let dir = TempDir::new().unwrap();
        let pool = test_pool(dir.path());
        {
            let conn = pool.get().unwrap();
            let run = backup_run::create(&conn, 1, RunKind::Manual, "t").unwrap();
            let item = |hash: &str| BackupItem {
                run_id: run.id,
                torrent_hash: hash.into(),
                name: hash.into(),
                size_bytes: 1,
                archive_rel_path: Some(format!("torrents/{hash}.torrent")),
                torrent_blob_path: Some(format!("torrents/{}/{hash}.torrent", &hash[..2])),
            };
            backup_item::insert_all(&conn, &[item("aa11"), item("bb22"), item("cc33")]).unwrap();
        }
        let legacy = dir.path().join("backups/torrents/aa");
        fs::create_dir_all(&legacy).unwrap();
        fs::write(legacy.join("aa11.torrent"), b"a").unwrap();
        fs::create_dir_all(dir.path().join("torrents/bb")).unwrap();
        fs::write(dir.path().join("torrents/bb/bb22.torrent"), b"b").unwrap();

        let report = migrate_legacy_blob_paths(&pool, dir.path()).unwrap();
        assert_eq!(
            report,
            LegacyMigrationReport {
                moved: 1,
                already_in_place: 1,
                missing: 1
            }
        );
        assert_eq!(fs::read(dir.path().join("torrents/aa/aa11.torrent")).unwrap(), b"a");
        assert!(!legacy.join("aa11.torrent").exists());

        let again = migrate_legacy_blob_paths(&pool, dir.path()).unwrap();
        assert_eq!(again.moved, 0);
        assert_eq!(again.already_in_place, 2);
    }
}
