use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupItem {
    #[serde(rename = "runID")]
    pub run_id: i64,
    pub torrent_hash: String,
    pub name: String,
    pub size_bytes: i64,
    pub archive_rel_path: Option<String>,
    pub torrent_blob_path: Option<String>,
}

fn row_to_item(row: &Row) -> rusqlite::Result<BackupItem> {
    Ok(BackupItem {
        run_id: row.get("run_id")?,
        torrent_hash: row.get("torrent_hash")?,
        name: row.get("name")?,
        size_bytes: row.get("size_bytes")?,
        archive_rel_path: row.get("archive_rel_path")?,
        torrent_blob_path: row.get("torrent_blob_path")?,
    })
}

pub fn find_by_run(conn: &Connection, run_id: i64) -> anyhow::Result<Vec<BackupItem>> {
    let mut stmt = conn.prepare("SELECT * FROM backup_items WHERE run_id = ? ORDER BY id")?;
    let rows = stmt.query_map(params![run_id], row_to_item)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn find_by_hash(
    conn: &Connection,
    run_id: i64,
    torrent_hash: &str,
) -> anyhow::Result<Option<BackupItem>> {
    let mut stmt =
        conn.prepare("SELECT * FROM backup_items WHERE run_id = ? AND torrent_hash = ?")?;
    let mut rows = stmt.query_map(params![run_id, torrent_hash], row_to_item)?;
    Ok(rows.next().transpose()?)
}

/// Insert all items of a run. Callers wrap this in the same transaction as the
/// run's success transition so items never exist for an unfinished run.
pub fn insert_all(conn: &Connection, items: &[BackupItem]) -> anyhow::Result<usize> {
    let mut stmt = conn.prepare(
        "INSERT INTO backup_items (run_id, torrent_hash, name, size_bytes, archive_rel_path, torrent_blob_path)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )?;
    for item in items {
        stmt.execute(params![
            item.run_id,
            item.torrent_hash,
            item.name,
            item.size_bytes,
            item.archive_rel_path,
            item.torrent_blob_path,
        ])?;
    }
    Ok(items.len())
}

/// Distinct blob paths referenced by the given run.
pub fn blob_paths_for_run(conn: &Connection, run_id: i64) -> anyhow::Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT torrent_blob_path FROM backup_items WHERE run_id = ? AND torrent_blob_path IS NOT NULL",
    )?;
    let rows = stmt.query_map(params![run_id], |row| row.get::<_, String>(0))?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// All distinct blob paths referenced by any item.
pub fn all_blob_paths(conn: &Connection) -> anyhow::Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT torrent_blob_path FROM backup_items WHERE torrent_blob_path IS NOT NULL",
    )?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn count_blob_references(conn: &Connection, blob_path: &str) -> anyhow::Result<i64> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM backup_items WHERE torrent_blob_path = ?",
        params![blob_path],
        |row| row.get(0),
    )?;
    Ok(count)
}
