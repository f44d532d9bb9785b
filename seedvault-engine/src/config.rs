use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub product: String,
    pub log_level: String,
    pub workers: usize,
    pub queue_capacity: usize,
    pub max_manifest_bytes: u64,
    pub retention: RetentionDefaults,
    pub resume_poll_secs: u64,
    pub resume_timeout_secs: u64,
}

/// Keep-counts per scheduled cadence, used when no setting overrides them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionDefaults {
    pub hourly: usize,
    pub daily: usize,
    pub weekly: usize,
    pub monthly: usize,
}

impl Default for RetentionDefaults {
    fn default() -> Self {
        Self {
            hourly: 24,
            daily: 7,
            weekly: 4,
            monthly: 12,
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        let data_dir = PathBuf::from(
            std::env::var("SEEDVAULT_DATA_DIR").unwrap_or_else(|_| "./data".into()),
        );
        let defaults = RetentionDefaults::default();

        Self {
            db_path: std::env::var("SEEDVAULT_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("seedvault.db")),
            data_dir,
            product: std::env::var("SEEDVAULT_PRODUCT").unwrap_or_else(|_| "seedvault".into()),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()),
            workers: env_or("SEEDVAULT_WORKERS", 2usize).max(1),
            queue_capacity: env_or("SEEDVAULT_QUEUE_CAPACITY", 64usize).max(1),
            max_manifest_bytes: env_or("SEEDVAULT_MAX_MANIFEST_BYTES", 16 * 1024 * 1024),
            retention: RetentionDefaults {
                hourly: env_or("SEEDVAULT_KEEP_HOURLY", defaults.hourly),
                daily: env_or("SEEDVAULT_KEEP_DAILY", defaults.daily),
                weekly: env_or("SEEDVAULT_KEEP_WEEKLY", defaults.weekly),
                monthly: env_or("SEEDVAULT_KEEP_MONTHLY", defaults.monthly),
            },
            resume_poll_secs: env_or("SEEDVAULT_RESUME_POLL_SECS", 5),
            resume_timeout_secs: env_or("SEEDVAULT_RESUME_TIMEOUT_SECS", 600),
        }
    }

    /// Configuration rooted at `data_dir`, with defaults for everything else.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            db_path: data_dir.join("seedvault.db"),
            data_dir,
            product: "seedvault".into(),
            log_level: "info".into(),
            workers: 2,
            queue_capacity: 64,
            max_manifest_bytes: 16 * 1024 * 1024,
            retention: RetentionDefaults::default(),
            resume_poll_secs: 5,
            resume_timeout_secs: 600,
        }
    }
}
