//! Restore a stored run onto its instance.

use crate::error::Result;
use crate::instance::collect_live_state;
use crate::restore::{self, RestoreMode, RestoreOptions, RestorePlan, RestoreResult, ResumeSettings};
use crate::services::run_lifecycle::{get_run, load_manifest};
use crate::state::AppState;
use std::sync::Arc;
use std::time::Duration;

fn resume_settings(state: &AppState) -> ResumeSettings {
    ResumeSettings {
        poll_interval: Duration::from_secs(state.config.resume_poll_secs.max(1)),
        timeout: Duration::from_secs(state.config.resume_timeout_secs),
    }
}

/// Diff run `run_id` against the live state of its instance.
pub async fn plan_restore(
    state: &Arc<AppState>,
    run_id: i64,
    mode: RestoreMode,
    exclude_hashes: &[String],
) -> Result<RestorePlan> {
    let run = get_run(state, run_id).await?;
    let manifest = load_manifest(state, run_id).await?;
    let client = state.clients.client(run.instance_id).await?;
    let live = collect_live_state(client.as_ref()).await?;

    let plan = restore::plan(&manifest, &live, mode, exclude_hashes);
    tracing::info!(
        run_id,
        instance_id = run.instance_id,
        mode = %mode,
        add = plan.torrents.add.len(),
        update = plan.torrents.update.len(),
        delete = plan.torrents.delete.len(),
        "Restore planned"
    );
    Ok(plan)
}

/// Plan against current live state and apply it.
pub async fn execute_restore(
    state: &Arc<AppState>,
    run_id: i64,
    mode: RestoreMode,
    options: &RestoreOptions,
) -> Result<RestoreResult> {
    let run = get_run(state, run_id).await?;
    let manifest = load_manifest(state, run_id).await?;
    let client = state.clients.client(run.instance_id).await?;
    let live = collect_live_state(client.as_ref()).await?;

    let plan = restore::plan(&manifest, &live, mode, &options.exclude_hashes);
    Ok(restore::execute(
        client,
        &manifest,
        &plan,
        options,
        &state.config.data_dir,
        resume_settings(state),
    )
    .await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::fake::{torrent, FakeInstance};
    use crate::services::test_support::{state_with, succeed_run};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_restore_missing_torrent_from_run() {
        let dir = TempDir::new().unwrap();
        let fake = FakeInstance::new().with_torrent(torrent("cc33"), None);
        let state = state_with(dir.path(), fake.clone());
        // Blob bytes double as the hash for the fake's add_torrent.
        let run = succeed_run(&state, 1, &[("aa11", Some(b"aa11".as_slice())), ("cc33", None)]).await;

        let p = plan_restore(&state, run.id, RestoreMode::Complete, &[]).await.unwrap();
        assert_eq!(p.torrents.add.len(), 1);
        assert!(p.torrents.delete.is_empty());

        let dry = execute_restore(
            &state,
            run.id,
            RestoreMode::Complete,
            &RestoreOptions { dry_run: true, ..Default::default() },
        )
        .await
        .unwrap();
        assert_eq!(dry.applied.torrents.created, vec!["aa11"]);
        assert!(fake.mutating_calls().is_empty());

        let applied = execute_restore(&state, run.id, RestoreMode::Complete, &RestoreOptions::default())
            .await
            .unwrap();
        assert!(applied.errors.is_empty(), "{:?}", applied.errors);
        assert_eq!(fake.mutating_calls(), vec!["add_torrent aa11"]);

        let again = plan_restore(&state, run.id, RestoreMode::Complete, &[]).await.unwrap();
        assert!(again.is_empty(), "{again:?}");
    }
}
