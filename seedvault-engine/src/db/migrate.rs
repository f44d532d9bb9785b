use crate::db::connection::DbPool;
use std::fs;
use std::path::Path;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS backup_runs (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  instance_id INTEGER NOT NULL,
  kind TEXT NOT NULL CHECK(kind IN ('manual','hourly','daily','weekly','monthly','import')),
  status TEXT NOT NULL DEFAULT 'pending' CHECK(status IN ('pending','running','success','failed','canceled')),
  requested_by TEXT NOT NULL,
  requested_at TEXT NOT NULL,
  started_at TEXT,
  completed_at TEXT,
  total_bytes INTEGER NOT NULL DEFAULT 0,
  torrent_count INTEGER NOT NULL DEFAULT 0,
  manifest_path TEXT,
  error_message TEXT
);

CREATE TABLE IF NOT EXISTS backup_items (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  run_id INTEGER NOT NULL REFERENCES backup_runs(id) ON DELETE CASCADE,
  torrent_hash TEXT NOT NULL,
  name TEXT NOT NULL,
  size_bytes INTEGER NOT NULL DEFAULT 0,
  archive_rel_path TEXT,
  torrent_blob_path TEXT,
  UNIQUE(run_id, torrent_hash)
);

CREATE TABLE IF NOT EXISTS settings (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_backup_runs_instance ON backup_runs(instance_id, requested_at DESC);
CREATE INDEX IF NOT EXISTS idx_backup_runs_status ON backup_runs(status);
CREATE INDEX IF NOT EXISTS idx_backup_items_run ON backup_items(run_id);
CREATE INDEX IF NOT EXISTS idx_backup_items_blob ON backup_items(torrent_blob_path);
"#;

pub fn migrate(pool: &DbPool, data_dir: &Path) -> anyhow::Result<()> {
    tracing::info!("[DB] Starting database migration...");

    fs::create_dir_all(data_dir)?;

    let conn = pool.get()?;
    conn.execute_batch(SCHEMA)?;

    let has_column = |table: &str, column: &str| -> anyhow::Result<bool> {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
        let columns: Vec<String> = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(columns.iter().any(|c| c == column))
    };

    // Databases created before failure reasons were recorded.
    if !has_column("backup_runs", "error_message")? {
        conn.execute_batch("ALTER TABLE backup_runs ADD COLUMN error_message TEXT")?;
    }

    tracing::info!("[DB] Migration completed successfully");
    Ok(())
}

#[cfg(test)]
pub(crate) fn test_pool(dir: &Path) -> DbPool {
    let pool = crate::db::connection::create_pool(&dir.join("test.db")).unwrap();
    migrate(&pool, dir).unwrap();
    pool
}
