//! Run records: queueing, lookup, cancellation, deletion.
//!
//! Each instance has one exclusive slot held by either a pending/running run
//! or a deletion. The slot is claimed with a check-and-set under
//! `AppState::active` before any row is created or removed.

use crate::error::{BackupError, Result};
use crate::manifest::Manifest;
use crate::models::backup_item::{self, BackupItem};
use crate::models::backup_run::{self, BackupRun, RunKind, RunStatus};
use crate::services::blob_store;
use crate::services::progress::RunProgress;
use crate::state::{ActiveOp, AppState};
use crate::utils::safe_path;
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Directory holding a run's manifest, relative to the data root.
pub fn run_dir_rel(instance_id: i64, run_id: i64) -> String {
    format!("runs/{instance_id}/{run_id}")
}

pub(crate) fn run_dir(data_dir: &Path, instance_id: i64, run_id: i64) -> PathBuf {
    data_dir.join(run_dir_rel(instance_id, run_id))
}

async fn load_run(state: &Arc<AppState>, run_id: i64) -> Result<BackupRun> {
    let db = state.db.clone();
    let run = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        backup_run::find_by_id(&conn, run_id)
    })
    .await??;
    run.ok_or(BackupError::RunNotFound(run_id))
}

/// Create a pending run and put it on the worker queue.
pub async fn queue_run(
    state: &Arc<AppState>,
    instance_id: i64,
    kind: RunKind,
    requested_by: &str,
) -> Result<BackupRun> {
    if kind == RunKind::Import {
        return Err(BackupError::InvalidRequest(
            "import runs are created by uploading an archive".into(),
        ));
    }

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
        backup_run::create(&conn, instance_id, kind, &by).map(Some)
    })
    .await??;
    let Some(run) = created else {
        return Err(BackupError::InstanceBusy(instance_id));
    };
    active.insert(instance_id, ActiveOp::Run(run.id));
    drop(active);

    state.cancel_token(run.id);
    if let Err(e) = state.enqueue(run.id).await {
        tracing::error!(run_id = run.id, error = %e, "Failed to enqueue run");
        abandon(state, &run, &e.to_string()).await;
        return Err(e.into());
    }

    tracing::info!(run_id = run.id, instance_id, kind = %kind, requested_by, "Run queued");
    Ok(run)
}

/// Fail a run that never reached a worker and free its slot.
///
/// If the failure can't be written the slot stays held, since the row still
/// reads as active; startup recovery settles both.
async fn abandon(state: &Arc<AppState>, run: &BackupRun, reason: &str) {
    state.cancels.remove(&run.id);
    if record_unsuccessful(state, run.id, RunStatus::Failed, reason).await {
        state.release(run.instance_id, ActiveOp::Run(run.id)).await;
    }
}

/// Move an active run to `status`, retrying once. Returns false if the row
/// could not be written.
pub(crate) async fn record_unsuccessful(state: &Arc<AppState>, run_id: i64, status: RunStatus, reason: &str) -> bool {
    for attempt in 1..=2 {
        if attempt > 1 {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
        let db = state.db.clone();
        let reason = reason.to_string();
        let written = tokio::task::spawn_blocking(move || {
            let conn = db.get()?;
            backup_run::mark_finished(&conn, run_id, status, Some(&reason))
        })
        .await;
        match written.map_err(BackupError::from).and_then(|r| r.map_err(BackupError::from)) {
            Ok(()) => return true,
            Err(e) => tracing::error!(run_id, attempt, error = %e, "Failed to record run outcome"),
        }
    }
    false
}

/// Remove what an unsuccessful attempt left on disk: its run directory and
/// the blobs it stored that nothing references.
///
/// Blob collection is skipped while another run is in flight, because that
/// run may have stored the same blob without committing its items yet.
pub(crate) async fn discard_attempt(state: &Arc<AppState>, run: &BackupRun, stored: Vec<String>) {
    let (id, instance_id) = (run.id, run.instance_id);
    let db = state.db.clone();
    let data_dir = state.config.data_dir.clone();

    // Held so no run starts storing blobs during collection.
    let active = state.active.lock().await;
    let others_in_flight = active
        .values()
        .any(|op| matches!(op, ActiveOp::Run(other) if *other != id));
    if others_in_flight && !stored.is_empty() {
        tracing::debug!(run_id = id, blobs = stored.len(), "Leaving blobs while other runs are in flight");
    }
    let cleaned = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        // A cancel that raced the final commit leaves a successful run alone.
        if backup_run::find_by_id(&conn, id)?.is_some_and(|r| r.status == RunStatus::Success) {
            return Ok(());
        }
        let _ = std::fs::remove_dir_all(run_dir(&data_dir, instance_id, id));
        if !others_in_flight {
            blob_store::collect_garbage(&conn, &data_dir, &stored)?;
        }
        Ok::<_, anyhow::Error>(())
    })
    .await;
    drop(active);

    if let Err(e) = cleaned.map_err(BackupError::from).and_then(|r| r.map_err(BackupError::from)) {
        tracing::warn!(run_id = id, error = %e, "Failed to clean up after run");
    }
}

pub async fn get_run(state: &Arc<AppState>, run_id: i64) -> Result<BackupRun> {
    load_run(state, run_id).await
}

/// Runs of an instance, newest first.
pub async fn list_runs(
    state: &Arc<AppState>,
    instance_id: i64,
    limit: i64,
    offset: i64,
) -> Result<Vec<BackupRun>> {
    let db = state.db.clone();
    let runs = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        backup_run::find_by_instance(&conn, instance_id, limit, offset)
    })
    .await??;
    Ok(runs)
}

pub async fn list_run_items(state: &Arc<AppState>, run_id: i64) -> Result<Vec<BackupItem>> {
    load_run(state, run_id).await?;
    let db = state.db.clone();
    let items = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        backup_item::find_by_run(&conn, run_id)
    })
    .await??;
    Ok(items)
}

pub fn get_progress(state: &AppState, run_id: i64) -> Option<RunProgress> {
    state.progress.get(run_id)
}

/// Cancel a pending or running run.
///
/// A running run is only signalled; its worker records the outcome. Import
/// runs have no worker and can't be canceled once running.
pub async fn cancel_run(state: &Arc<AppState>, run_id: i64) -> Result<BackupRun> {
    let run = load_run(state, run_id).await?;
    match run.status {
        RunStatus::Pending => {
            let db = state.db.clone();
            let canceled = tokio::task::spawn_blocking(move || {
                let conn = db.get()?;
                backup_run::cancel_pending(&conn, run_id)
            })
            .await??;
            if canceled {
                if let Some((_, token)) = state.cancels.remove(&run_id) {
                    token.cancel();
                }
                state.release(run.instance_id, ActiveOp::Run(run_id)).await;
                tracing::info!(run_id, "Pending run canceled");
            } else if let Some(token) = state.cancels.get(&run_id) {
                // A worker claimed it in the meantime.
                token.cancel();
            }
        }
        RunStatus::Running => {
            match state.cancels.get(&run_id) {
                Some(token) => token.cancel(),
                None => {
                    return Err(BackupError::InvalidRunStatus {
                        id: run_id,
                        status: run.status,
                    })
                }
            }
            tracing::info!(run_id, "Cancellation requested for running run");
        }
        status => return Err(BackupError::InvalidRunStatus { id: run_id, status }),
    }
    load_run(state, run_id).await
}

/// Remove a run's row, items, manifest directory and unreferenced blobs.
/// The caller holds the instance slot.
pub(crate) fn delete_run_artifacts(conn: &Connection, data_dir: &Path, run: &BackupRun) -> anyhow::Result<()> {
    let blobs = backup_item::blob_paths_for_run(conn, run.id)?;
    backup_run::delete(conn, run.id)?;
    blob_store::collect_garbage(conn, data_dir, &blobs)?;

    let dir = run_dir(data_dir, run.instance_id, run.id);
    match std::fs::remove_dir_all(&dir) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(run_id = run.id, path = %dir.display(), error = %e, "Failed to remove run directory"),
    }
    tracing::info!(run_id = run.id, instance_id = run.instance_id, "Run deleted");
    Ok(())
}

async fn with_deletion_slot<T, F>(state: &Arc<AppState>, instance_id: i64, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&Connection, &Path) -> Result<T> + Send + 'static,
{
    if !state.try_acquire(instance_id, ActiveOp::Deletion).await {
        return Err(BackupError::InstanceBusy(instance_id));
    }
    let db = state.db.clone();
    let data_dir = state.config.data_dir.clone();
    let result = tokio::task::spawn_blocking(move || {
        let conn = db.get().map_err(anyhow::Error::from)?;
        f(&conn, &data_dir)
    })
    .await;
    state.release(instance_id, ActiveOp::Deletion).await;
    result?
}

pub async fn delete_run(state: &Arc<AppState>, run_id: i64) -> Result<()> {
    let run = load_run(state, run_id).await?;
    if run.status.is_active() {
        return Err(BackupError::InstanceBusy(run.instance_id));
    }
    with_deletion_slot(state, run.instance_id, move |conn, data_dir| {
        // Re-read under the slot; the row may be gone already.
        match backup_run::find_by_id(conn, run_id)? {
            Some(run) => Ok(delete_run_artifacts(conn, data_dir, &run)?),
            None => Err(BackupError::RunNotFound(run_id)),
        }
    })
    .await
}

/// Delete every finished run of an instance. Returns how many were removed.
pub async fn delete_all_runs(state: &Arc<AppState>, instance_id: i64) -> Result<usize> {
    with_deletion_slot(state, instance_id, move |conn, data_dir| {
        let runs = backup_run::find_all_by_instance(conn, instance_id)?;
        let mut deleted = 0;
        for run in runs.iter().filter(|r| !r.status.is_active()) {
            delete_run_artifacts(conn, data_dir, run)?;
            deleted += 1;
        }
        Ok(deleted)
    })
    .await
}

/// Read and validate the manifest of a successful run.
pub async fn load_manifest(state: &Arc<AppState>, run_id: i64) -> Result<Manifest> {
    let run = load_run(state, run_id).await?;
    let rel = match (&run.status, &run.manifest_path) {
        (RunStatus::Success, Some(rel)) => rel.clone(),
        _ => {
            return Err(BackupError::InvalidRunStatus {
                id: run_id,
                status: run.status,
            })
        }
    };
    let path = safe_path::resolve_within(&state.config.data_dir, &rel)?;
    let bytes = tokio::fs::read(&path).await?;
    Manifest::from_slice(&bytes)
}

/// Raw `.torrent` bytes captured for `hash` in a run.
pub async fn open_torrent_blob(state: &Arc<AppState>, run_id: i64, hash: &str) -> Result<Vec<u8>> {
    load_run(state, run_id).await?;
    let db = state.db.clone();
    let h = hash.to_string();
    let item = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        match backup_item::find_by_hash(&conn, run_id, &h)? {
            Some(item) => Ok(Some(item)),
            None => backup_item::find_by_hash(&conn, run_id, &h.to_ascii_lowercase()),
        }
    })
    .await??;
    let rel = item
        .and_then(|i| i.torrent_blob_path)
        .ok_or_else(|| BackupError::InvalidRequest(format!("run {run_id} has no blob for {hash}")))?;
    let path = blob_store::resolve(&state.config.data_dir, &rel)?;
    Ok(tokio::fs::read(&path).await?)
}

/// Fail runs a previous process left pending or running.
pub async fn recover_interrupted_runs(state: &Arc<AppState>) -> Result<usize> {
    let db = state.db.clone();
    let data_dir = state.config.data_dir.clone();
    let recovered = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        let stuck = backup_run::find_all_active(&conn)?;
        let count = backup_run::fail_interrupted(&conn)?;
        for run in &stuck {
            // Partial manifests from the interrupted attempt.
            let _ = std::fs::remove_dir_all(run_dir(&data_dir, run.instance_id, run.id));
        }
        Ok::<_, anyhow::Error>(count)
    })
    .await??;
    if recovered > 0 {
        tracing::warn!(recovered, "Marked interrupted runs as failed");
    }
    Ok(recovered)
}
