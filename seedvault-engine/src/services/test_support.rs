//! Shared fixtures for service tests.

use crate::config::EngineConfig;
use crate::db::migrate::test_pool;
use crate::instance::fake::{FakeInstance, FakeProvider};
use crate::manifest::{sample_item, Manifest};
use crate::models::backup_run::{self, BackupRun, RunKind};
use crate::services::{blob_store, run_worker};
use crate::state::AppState;
use chrono::Utc;
use std::path::Path;
use std::sync::Arc;

pub fn state_with(dir: &Path, fake: Arc<FakeInstance>) -> Arc<AppState> {
    let pool = test_pool(dir);
    let config = EngineConfig::with_data_dir(dir);
    Arc::new(AppState::new(pool, config, Arc::new(FakeProvider(fake))))
}

/// Persist a successful manual run holding `items` (hash, blob bytes).
pub async fn succeed_run(state: &Arc<AppState>, instance_id: i64, items: &[(&str, Option<&[u8]>)]) -> BackupRun {
    let run = {
        let conn = state.db.get().unwrap();
        let run = backup_run::create(&conn, instance_id, RunKind::Manual, "test").unwrap();
        assert!(backup_run::claim(&conn, run.id).unwrap());
        backup_run::find_by_id(&conn, run.id).unwrap().unwrap()
    };

    let mut manifest = Manifest::new(instance_id, RunKind::Manual, Utc::now());
    for (hash, blob) in items {
        let rel = blob.map(|bytes| blob_store::store(&state.config.data_dir, hash, bytes).unwrap());
        manifest.push_item(sample_item(hash, rel.as_deref()));
    }
    run_worker::persist_success(state, &run, &manifest).await.unwrap();

    let conn = state.db.get().unwrap();
    backup_run::find_by_id(&conn, run.id).unwrap().unwrap()
}

/// Make every update that moves a run to `status` fail.
pub fn block_transition(state: &AppState, status: &str) {
    let conn = state.db.get().unwrap();
    conn.execute_batch(&format!(
        "CREATE TRIGGER block_{status} BEFORE UPDATE OF status ON backup_runs
         WHEN NEW.status = '{status}'
         BEGIN SELECT RAISE(ABORT, 'blocked transition to {status}'); END;"
    ))
    .unwrap();
}
