use crate::config::EngineConfig;
use crate::db::connection::DbPool;
use crate::instance::ClientProvider;
use crate::services::progress::ProgressTable;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// What currently holds an instance's exclusive slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveOp {
    Run(i64),
    Deletion,
}

pub struct AppState {
    pub db: DbPool,
    pub config: EngineConfig,
    pub clients: Arc<dyn ClientProvider>,
    pub progress: ProgressTable,
    /// Instance id to the operation holding it.
    pub active: Mutex<HashMap<i64, ActiveOp>>,
    /// Cancellation tokens of queued and running runs.
    pub cancels: DashMap<i64, CancellationToken>,
    pub shutdown: CancellationToken,
    queue_tx: mpsc::Sender<i64>,
    queue_rx: std::sync::Mutex<Option<mpsc::Receiver<i64>>>,
}

impl AppState {
    pub fn new(db: DbPool, config: EngineConfig, clients: Arc<dyn ClientProvider>) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity);
        Self {
            db,
            config,
            clients,
            progress: ProgressTable::default(),
            active: Mutex::new(HashMap::new()),
            cancels: DashMap::new(),
            shutdown: CancellationToken::new(),
            queue_tx,
            queue_rx: std::sync::Mutex::new(Some(queue_rx)),
        }
    }

    pub(crate) async fn enqueue(&self, run_id: i64) -> anyhow::Result<()> {
        self.queue_tx
            .send(run_id)
            .await
            .map_err(|_| anyhow::anyhow!("run queue is closed"))
    }

    /// Hand the queue receiver to the worker pool. Only the first call gets it.
    pub(crate) fn take_queue(&self) -> Option<mpsc::Receiver<i64>> {
        self.queue_rx.lock().ok().and_then(|mut rx| rx.take())
    }

    /// Claim the instance for `op`. Fails if anything else holds it.
    pub(crate) async fn try_acquire(&self, instance_id: i64, op: ActiveOp) -> bool {
        let mut active = self.active.lock().await;
        if active.contains_key(&instance_id) {
            return false;
        }
        active.insert(instance_id, op);
        true
    }

    /// Release the instance if `op` still holds it.
    pub(crate) async fn release(&self, instance_id: i64, op: ActiveOp) {
        let mut active = self.active.lock().await;
        if active.get(&instance_id) == Some(&op) {
            active.remove(&instance_id);
        }
    }

    /// Release whichever instance `run_id` holds, if any.
    pub(crate) async fn release_run(&self, run_id: i64) {
        self.active.lock().await.retain(|_, op| *op != ActiveOp::Run(run_id));
    }

    pub(crate) fn cancel_token(&self, run_id: i64) -> CancellationToken {
        self.cancels
            .entry(run_id)
            .or_insert_with(|| self.shutdown.child_token())
            .clone()
    }
}
