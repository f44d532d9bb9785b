//! Error taxonomy for the backup engine.

use crate::models::backup_run::RunStatus;

#[derive(thiserror::Error, Debug)]
pub enum BackupError {
    #[error("instance {0} already has a backup run or deletion in progress")]
    InstanceBusy(i64),

    #[error("backup run {0} not found")]
    RunNotFound(i64),

    #[error("operation not valid for run {id} in status {status}")]
    InvalidRunStatus { id: i64, status: RunStatus },

    #[error("unsupported archive format: {0}")]
    UnsupportedFormat(String),

    #[error("unsafe path rejected: {0}")]
    PathUnsafe(String),

    #[error("archive does not contain manifest.json")]
    ManifestMissing,

    #[error("torrent blob for {hash} could not be read: {reason}")]
    PartialBlobLoss { hash: String, reason: String },

    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("{0}")]
    InvalidRequest(String),

    #[error("upload exceeds limit of {limit} bytes")]
    UploadTooLarge { limit: u64 },

    #[error("operation canceled")]
    Canceled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl BackupError {
    /// Whether the caller may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BackupError::InstanceBusy(_))
    }
}

impl From<tokio::task::JoinError> for BackupError {
    fn from(e: tokio::task::JoinError) -> Self {
        BackupError::Internal(anyhow::anyhow!(e))
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
