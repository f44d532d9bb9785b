//! Worker pool that executes queued runs end to end.

use crate::error::{BackupError, Result};
use crate::instance::collect_live_state;
use crate::manifest::{archive_path_for, normalize_tags, CategorySnapshot, Manifest, ManifestItem, MANIFEST_FILE_NAME};
use crate::models::backup_item::{self, BackupItem};
use crate::models::backup_run::{self, BackupRun, RunStatus, SuccessData};
use crate::services::{blob_store, retention, run_lifecycle};
use crate::state::{ActiveOp, AppState};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Spawn `config.workers` workers draining the run queue.
pub fn start_workers(state: Arc<AppState>) -> anyhow::Result<Vec<JoinHandle<()>>> {
    let rx = state
        .take_queue()
        .ok_or_else(|| anyhow::anyhow!("workers already started"))?;
    let rx = Arc::new(Mutex::new(rx));

    let handles = (0..state.config.workers)
        .map(|worker| {
            let state = state.clone();
            let rx = rx.clone();
            tokio::spawn(async move {
                tracing::debug!(worker, "Run worker started");
                loop {
                    let next = tokio::select! {
                        _ = state.shutdown.cancelled() => None,
                        id = async { rx.lock().await.recv().await } => id,
                    };
                    let Some(run_id) = next else { break };
                    execute_run(state.clone(), run_id).await;
                }
                tracing::debug!(worker, "Run worker stopped");
            })
        })
        .collect();
    Ok(handles)
}

/// Execute one queued run, leaving it in a terminal state and releasing the
/// instance slot. Only when the outcome can't be written does the slot stay
/// held, matching a row that still reads as active.
pub async fn execute_run(state: Arc<AppState>, run_id: i64) {
    let db = state.db.clone();
    let claimed = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        if !backup_run::claim(&conn, run_id)? {
            return Ok::<_, anyhow::Error>((false, backup_run::find_by_id(&conn, run_id)?));
        }
        Ok((true, backup_run::find_by_id(&conn, run_id)?))
    })
    .await;

    let run = match claimed {
        Ok(Ok((true, Some(run)))) => run,
        Ok(Ok((false, Some(run)))) => {
            // Canceled while queued.
            tracing::info!(run_id, status = %run.status, "Skipping run that is no longer pending");
            state.cancels.remove(&run_id);
            state.release(run.instance_id, ActiveOp::Run(run_id)).await;
            return;
        }
        Ok(Ok((_, None))) => {
            tracing::warn!(run_id, "Queued run disappeared");
            state.cancels.remove(&run_id);
            state.release_run(run_id).await;
            return;
        }
        Ok(Err(e)) => {
            tracing::error!(run_id, error = %e, "Failed to claim run");
            fail_unclaimed(&state, run_id, &e.to_string()).await;
            return;
        }
        Err(e) => {
            tracing::error!(run_id, error = %e, "Claim task panicked");
            fail_unclaimed(&state, run_id, &e.to_string()).await;
            return;
        }
    };

    let token = state.cancel_token(run_id);
    state.progress.start(run_id);
    tracing::info!(run_id, instance_id = run.instance_id, kind = %run.kind, "Run started");

    let mut stored = Vec::new();
    let result = tokio::select! {
        _ = token.cancelled() => Err(BackupError::Canceled),
        r = capture_run(&state, &run, &token, &mut stored) => r,
    };

    state.progress.finish(run_id);
    state.cancels.remove(&run_id);
    match result {
        Ok(torrents) => {
            tracing::info!(run_id, torrents, "Run completed");
            if run.kind.is_scheduled() {
                if let Err(e) = prune_after(&state, &run).await {
                    tracing::warn!(run_id, error = %e, "Retention pruning failed");
                }
            }
        }
        Err(e) => {
            let status = if matches!(e, BackupError::Canceled) {
                RunStatus::Canceled
            } else {
                RunStatus::Failed
            };
            if status == RunStatus::Failed {
                tracing::error!(run_id, error = %e, "Run failed");
            } else {
                tracing::info!(run_id, "Run canceled");
            }
            if !run_lifecycle::record_unsuccessful(&state, run_id, status, &e.to_string()).await {
                // The row still reads as active; keep the slot for startup recovery.
                return;
            }
            run_lifecycle::discard_attempt(&state, &run, stored).await;
        }
    }
    state.release(run.instance_id, ActiveOp::Run(run_id)).await;
}

/// Fail a run the worker could not claim so its instance does not stay busy.
async fn fail_unclaimed(state: &Arc<AppState>, run_id: i64, reason: &str) {
    state.cancels.remove(&run_id);
    let reason = format!("could not start run: {reason}");
    if run_lifecycle::record_unsuccessful(state, run_id, RunStatus::Failed, &reason).await {
        state.release_run(run_id).await;
    }
}

/// Capture live state into a manifest and persist it. Returns the number
/// of torrents captured. Blobs written along the way are pushed to `stored`.
async fn capture_run(
    state: &Arc<AppState>,
    run: &BackupRun,
    cancel: &CancellationToken,
    stored: &mut Vec<String>,
) -> Result<usize> {
    let client = state.clients.client(run.instance_id).await?;
    let live = collect_live_state(client.as_ref()).await?;
    state.progress.set_total(run.id, live.torrents.len() as u64);

    let mut manifest = Manifest::new(run.instance_id, run.kind, Utc::now());
    manifest.categories = live
        .categories
        .iter()
        .map(|(name, path)| (name.clone(), CategorySnapshot { save_path: path.clone() }))
        .collect();
    manifest.tags = normalize_tags(&live.tags);

    for torrent in &live.torrents {
        if cancel.is_cancelled() {
            return Err(BackupError::Canceled);
        }
        let torrent_blob = match client.export_torrent(&torrent.hash).await {
            Ok(bytes) => {
                let data_dir = state.config.data_dir.clone();
                let hash = torrent.hash.clone();
                let rel = tokio::task::spawn_blocking(move || blob_store::store(&data_dir, &hash, &bytes)).await??;
                stored.push(rel.clone());
                Some(rel)
            }
            Err(e) => {
                tracing::warn!(run_id = run.id, hash = %torrent.hash, error = %e, "No .torrent exported, keeping metadata only");
                None
            }
        };
        manifest.push_item(ManifestItem {
            hash: torrent.hash.to_ascii_lowercase(),
            name: torrent.name.clone(),
            archive_path: archive_path_for(&torrent.hash),
            size_bytes: torrent.size_bytes,
            torrent_blob,
            category: Some(torrent.category.clone()).filter(|c| !c.is_empty()),
            tags: Some(normalize_tags(&torrent.tags)).filter(|t| !t.is_empty()),
            infohash_v1: torrent.infohash_v1.clone(),
            infohash_v2: torrent.infohash_v2.clone(),
        });
        state.progress.advance(run.id);
    }

    if cancel.is_cancelled() {
        return Err(BackupError::Canceled);
    }
    persist_success(state, run, &manifest).await?;
    Ok(manifest.torrent_count)
}

/// Write the manifest durably, then insert items and mark the run successful
/// in one transaction. The run must be `running`.
pub(crate) async fn persist_success(state: &Arc<AppState>, run: &BackupRun, manifest: &Manifest) -> Result<()> {
    let json = manifest.to_json()?;
    let rel = format!(
        "{}/{}",
        run_lifecycle::run_dir_rel(run.instance_id, run.id),
        MANIFEST_FILE_NAME
    );
    let items: Vec<BackupItem> = manifest
        .items
        .iter()
        .map(|i| BackupItem {
            run_id: run.id,
            torrent_hash: i.hash.to_ascii_lowercase(),
            name: i.name.clone(),
            size_bytes: i.size_bytes,
            archive_rel_path: i.blob().map(|_| i.archive_path.clone()),
            torrent_blob_path: i.blob().map(String::from),
        })
        .collect();
    let total_bytes = manifest.total_bytes();
    let torrent_count = manifest.torrent_count as i64;

    let db = state.db.clone();
    let data_dir = state.config.data_dir.clone();
    let run_id = run.id;
    tokio::task::spawn_blocking(move || {
        let path = crate::utils::safe_path::resolve_within(&data_dir, &rel)?;
        blob_store::write_atomic(&path, &json)?;

        let mut conn = db.get().map_err(anyhow::Error::from)?;
        let tx = conn.transaction().map_err(anyhow::Error::from)?;
        backup_item::insert_all(&tx, &items)?;
        backup_run::mark_success(
            &tx,
            run_id,
            &SuccessData {
                manifest_path: &rel,
                total_bytes,
                torrent_count,
            },
        )?;
        tx.commit().map_err(anyhow::Error::from)?;
        Ok::<_, BackupError>(())
    })
    .await??;
    Ok(())
}

async fn prune_after(state: &Arc<AppState>, run: &BackupRun) -> Result<()> {
    let db = state.db.clone();
    let data_dir = state.config.data_dir.clone();
    let defaults = state.config.retention;
    let (instance_id, kind) = (run.instance_id, run.kind);
    let pruned = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        let ids = retention::runs_to_prune(&conn, &defaults, instance_id, kind)?;
        for id in &ids {
            if let Some(old) = backup_run::find_by_id(&conn, *id)? {
                run_lifecycle::delete_run_artifacts(&conn, &data_dir, &old)?;
            }
        }
        Ok::<_, anyhow::Error>(ids)
    })
    .await??;
    if !pruned.is_empty() {
        tracing::info!(instance_id, kind = %kind, pruned = ?pruned, "Pruned old runs");
    }
    Ok(())
}
