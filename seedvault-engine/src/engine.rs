//! Process-level startup and shutdown of the backup engine.

use crate::config::EngineConfig;
use crate::db::connection::{close_pool, create_pool};
use crate::db::migrate::migrate;
use crate::instance::ClientProvider;
use crate::services::legacy_blobs::migrate_legacy_blob_paths;
use crate::services::run_lifecycle::recover_interrupted_runs;
use crate::services::run_worker::start_workers;
use crate::state::AppState;
use std::sync::Arc;
use tokio::task::JoinHandle;

pub struct Engine {
    pub state: Arc<AppState>,
    workers: Vec<JoinHandle<()>>,
}

impl Engine {
    /// Open the database, run migrations, recover from a previous crash and
    /// start the worker pool.
    pub async fn start(config: EngineConfig, clients: Arc<dyn ClientProvider>) -> anyhow::Result<Self> {
        tracing::info!(data_dir = %config.data_dir.display(), workers = config.workers, "Starting backup engine");

        std::fs::create_dir_all(&config.data_dir)?;
        let pool = create_pool(&config.db_path)?;
        migrate(&pool, &config.data_dir)?;

        // Data migrations (one-time, idempotent)
        if let Err(e) = migrate_legacy_blob_paths(&pool, &config.data_dir) {
            tracing::warn!("Legacy blob migration failed: {}", e);
        }

        // Leftover upload spools from a previous process.
        let scratch = config.data_dir.join("tmp");
        if scratch.exists() {
            if let Err(e) = std::fs::remove_dir_all(&scratch) {
                tracing::warn!(path = %scratch.display(), error = %e, "Failed to clear scratch directory");
            }
        }

        let state = Arc::new(AppState::new(pool, config, clients));
        recover_interrupted_runs(&state).await?;
        let workers = start_workers(state.clone())?;

        Ok(Self { state, workers })
    }

    /// Stop accepting work, cancel running runs and wait for the workers.
    pub async fn shutdown(self) {
        tracing::info!("Shutting down...");
        self.state.shutdown.cancel();
        for worker in self.workers {
            if let Err(e) = worker.await {
                tracing::warn!(error = %e, "Run worker ended abnormally");
            }
        }
        close_pool(&self.state.db);
        tracing::info!("Backup engine stopped");
    }
}
