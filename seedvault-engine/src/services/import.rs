//! Turn an uploaded archive into an `import` run.

use crate::archive::reader::SkippedEntry;
use crate::archive::upload::read_upload;
use crate::error::{BackupError, Result};
use crate::manifest::{archive_path_for, Manifest};
use crate::models::backup_run::{self, BackupRun, RunKind, RunStatus};
use crate::services::{blob_store, run_lifecycle, run_worker};
use crate::state::{ActiveOp, AppState};
use bytes::Bytes;
use futures_util::Stream;
use serde::Serialize;
use std::io;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportOutcome {
    pub run: BackupRun,
    /// Items whose blob was recovered from the archive.
    pub recovered_blobs: usize,
    pub skipped_entries: Vec<SkippedEntry>,
}

/// Read an uploaded archive and persist it as a successful `import` run of
/// `instance_id`.
///
/// The instance slot is held for the whole import. Blobs found in the
/// archive are copied into the blob store before the extraction directory
/// is removed; items without one stay metadata-only.
pub async fn import_manifest<S>(
    state: &Arc<AppState>,
    instance_id: i64,
    upload: S,
    filename: &str,
    requested_by: &str,
) -> Result<ImportOutcome>
where
    S: Stream<Item = io::Result<Bytes>>,
{
    let scratch = state.config.data_dir.join("tmp");
    let imported = read_upload(upload, filename, state.config.max_manifest_bytes, &scratch).await?;
    let mut manifest = Manifest::from_slice(&imported.manifest)?;

    // Claim the slot and create the run as one step, as queueing does.
    let mut active = state.active.lock().await;
    if active.contains_key(&instance_id) {
        return Err(BackupError::InstanceBusy(instance_id));
    }
    let db = state.db.clone();
    let by = requested_by.to_string();
    let created = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        if backup_run::find_active(&conn, instance_id)?.is_some() {
            return Ok(None);
        }
        let run = backup_run::create(&conn, instance_id, RunKind::Import, &by)?;
        backup_run::claim(&conn, run.id)?;
        backup_run::find_by_id(&conn, run.id)
    })
    .await??;
    let Some(run) = created else {
        return Err(BackupError::InstanceBusy(instance_id));
    };
    active.insert(instance_id, ActiveOp::Run(run.id));
    drop(active);

    let mut stored = Vec::new();
    let recovered_blobs = match persist_import(state, &run, &mut manifest, &imported.blobs, &mut stored).await {
        Ok(recovered) => {
            state.release(instance_id, ActiveOp::Run(run.id)).await;
            recovered
        }
        Err(e) => {
            tracing::error!(run_id = run.id, error = %e, "Import failed");
            // If the failure can't be written the row still reads as active,
            // so the slot stays held for startup recovery.
            if run_lifecycle::record_unsuccessful(state, run.id, RunStatus::Failed, &e.to_string()).await {
                run_lifecycle::discard_attempt(state, &run, stored).await;
                state.release(instance_id, ActiveOp::Run(run.id)).await;
            }
            return Err(e);
        }
    };

    let run = run_lifecycle::get_run(state, run.id).await?;
    tracing::info!(
        run_id = run.id,
        instance_id,
        torrents = run.torrent_count,
        recovered_blobs,
        "Import completed"
    );
    Ok(ImportOutcome {
        run,
        recovered_blobs,
        skipped_entries: imported.skipped,
    })
}

async fn persist_import(
    state: &Arc<AppState>,
    run: &BackupRun,
    manifest: &mut Manifest,
    blobs: &std::collections::HashMap<String, std::path::PathBuf>,
    stored: &mut Vec<String>,
) -> Result<usize> {
    manifest.instance_id = run.instance_id;
    manifest.kind = RunKind::Import;

    let mut recovered = 0;
    for item in &mut manifest.items {
        item.archive_path = archive_path_for(&item.hash);
        item.torrent_blob = match blobs.get(&item.hash.to_ascii_lowercase()) {
            Some(source) => {
                let data_dir = state.config.data_dir.clone();
                let (hash, source) = (item.hash.clone(), source.clone());
                let rel = tokio::task::spawn_blocking(move || blob_store::copy_in(&data_dir, &hash, &source))
                    .await??;
                stored.push(rel.clone());
                recovered += 1;
                Some(rel)
            }
            None => None,
        };
    }

    run_worker::persist_success(state, run, manifest).await?;
    Ok(recovered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::writer::{write_archive, RunMetadata};
    use crate::archive::{ArchiveFormat, Compression, ContainerCodec};
    use crate::instance::fake::FakeInstance;
    use crate::manifest::sample_item;
    use crate::services::run_lifecycle::{list_run_items, load_manifest, open_torrent_blob};
    use crate::services::test_support::{block_transition, state_with};
    use chrono::Utc;
    use futures_util::stream;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    fn upload(data: Vec<u8>) -> impl Stream<Item = io::Result<Bytes>> {
        stream::iter(vec![Ok(Bytes::from(data))])
    }

    /// Two items, only `hash2` has a blob on disk.
    fn archive(src: &std::path::Path, format: ArchiveFormat) -> Vec<u8> {
        std::fs::create_dir_all(src.join("torrents/ha")).unwrap();
        std::fs::write(src.join("torrents/ha/hash2.torrent"), b"d4:infoe").unwrap();
        let mut manifest = Manifest::new(9, RunKind::Manual, Utc::now());
        manifest.push_item(sample_item("hash1", Some("torrents/ha/hash1.torrent")));
        manifest.push_item(sample_item("hash2", Some("torrents/ha/hash2.torrent")));
        let meta = RunMetadata {
            run_id: 1,
            instance_id: 9,
            kind: RunKind::Manual,
            requested_at: manifest.generated_at,
        };
        let mut out = Vec::new();
        write_archive(&mut out, &manifest, &meta, format, "seedvault", src, &CancellationToken::new()).unwrap();
        out
    }

    #[tokio::test]
    async fn test_tar_gz_round_trip_recovers_present_blobs() {
        let src = TempDir::new().unwrap();
        let dir = TempDir::new().unwrap();
        let state = state_with(dir.path(), FakeInstance::new());
        let data = archive(src.path(), ArchiveFormat::Container(ContainerCodec::Tar(Compression::Gzip)));

        let outcome = import_manifest(&state, 5, upload(data), "backup.tar.gz", "alice").await.unwrap();
        assert_eq!(outcome.recovered_blobs, 1);
        assert_eq!(outcome.run.kind, RunKind::Import);
        assert_eq!(outcome.run.status, RunStatus::Success);
        assert_eq!(outcome.run.instance_id, 5);
        assert_eq!(outcome.run.torrent_count, 2);

        let manifest = load_manifest(&state, outcome.run.id).await.unwrap();
        assert_eq!(manifest.torrent_count, 2);
        assert_eq!(manifest.kind, RunKind::Import);
        assert!(manifest.item("hash1").unwrap().blob().is_none());
        assert_eq!(manifest.item("hash2").unwrap().blob(), Some("torrents/ha/hash2.torrent"));

        let items = list_run_items(&state, outcome.run.id).await.unwrap();
        assert_eq!(items.iter().filter(|i| i.torrent_blob_path.is_some()).count(), 1);
        assert_eq!(open_torrent_blob(&state, outcome.run.id, "hash2").await.unwrap(), b"d4:infoe");

        // Extraction scratch space is gone.
        let tmp = dir.path().join("tmp");
        assert_eq!(std::fs::read_dir(&tmp).map(|d| d.count()).unwrap_or(0), 0);
        assert!(state.active.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_manifest_only_import_is_metadata_only() {
        let src = TempDir::new().unwrap();
        let dir = TempDir::new().unwrap();
        let state = state_with(dir.path(), FakeInstance::new());
        let data = archive(src.path(), ArchiveFormat::ManifestOnly);

        let outcome = import_manifest(&state, 5, upload(data), "snapshot.json", "alice").await.unwrap();
        assert_eq!(outcome.recovered_blobs, 0);
        let items = list_run_items(&state, outcome.run.id).await.unwrap();
        assert_eq!(items.len(), 2);
        assert!(items.iter().all(|i| i.torrent_blob_path.is_none()));
    }

    #[tokio::test]
    async fn test_import_respects_instance_slot() {
        let src = TempDir::new().unwrap();
        let dir = TempDir::new().unwrap();
        let state = state_with(dir.path(), FakeInstance::new());
        let data = archive(src.path(), ArchiveFormat::Container(ContainerCodec::Zip));

        assert!(state.try_acquire(5, ActiveOp::Deletion).await);
        let result = import_manifest(&state, 5, upload(data), "backup.zip", "alice").await;
        assert!(matches!(result, Err(BackupError::InstanceBusy(5))));
    }

    #[tokio::test]
    async fn test_failed_import_discards_blobs_and_frees_slot() {
        let src = TempDir::new().unwrap();
        let dir = TempDir::new().unwrap();
        let state = state_with(dir.path(), FakeInstance::new());
        let data = archive(src.path(), ArchiveFormat::Container(ContainerCodec::Tar(Compression::None)));
        block_transition(&state, "success");

        let result = import_manifest(&state, 5, upload(data), "backup.tar", "alice").await;
        assert!(result.is_err());

        let runs = run_lifecycle::list_runs(&state, 5, 10, 0).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Failed);
        assert!(!dir.path().join("torrents/ha/hash2.torrent").exists());
        assert!(!run_lifecycle::run_dir(dir.path(), 5, runs[0].id).exists());
        assert!(state.active.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_manifest_creates_no_run() {
        let dir = TempDir::new().unwrap();
        let state = state_with(dir.path(), FakeInstance::new());
        let result = import_manifest(&state, 5, upload(b"{\"nope\":1}".to_vec()), "x.json", "alice").await;
        assert!(matches!(result, Err(BackupError::InvalidManifest(_))));
        assert!(run_lifecycle::list_runs(&state, 5, 10, 0).await.unwrap().is_empty());
    }
}
