use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ── RunKind / RunStatus ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunKind {
    Manual,
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Import,
}

impl RunKind {
    pub const ALL: [RunKind; 6] = [
        RunKind::Manual,
        RunKind::Hourly,
        RunKind::Daily,
        RunKind::Weekly,
        RunKind::Monthly,
        RunKind::Import,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RunKind::Manual => "manual",
            RunKind::Hourly => "hourly",
            RunKind::Daily => "daily",
            RunKind::Weekly => "weekly",
            RunKind::Monthly => "monthly",
            RunKind::Import => "import",
        }
    }

    /// Scheduled cadences are subject to retention pruning.
    pub fn is_scheduled(&self) -> bool {
        matches!(
            self,
            RunKind::Hourly | RunKind::Daily | RunKind::Weekly | RunKind::Monthly
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    Failed,
    Canceled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
            RunStatus::Canceled => "canceled",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, RunStatus::Pending | RunStatus::Running)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown value {0:?}")]
pub struct ParseEnumError(String);

impl FromStr for RunKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RunKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| ParseEnumError(s.to_string()))
    }
}

impl FromStr for RunStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            "failed" => Ok(RunStatus::Failed),
            "canceled" => Ok(RunStatus::Canceled),
            other => Err(ParseEnumError(other.to_string())),
        }
    }
}

impl fmt::Display for RunKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

macro_rules! text_column {
    ($ty:ty) => {
        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e| FromSqlError::Other(Box::new(e)))
            }
        }
    };
}

text_column!(RunKind);
text_column!(RunStatus);

// ── BackupRun ──

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupRun {
    pub id: i64,
    #[serde(rename = "instanceID")]
    pub instance_id: i64,
    pub kind: RunKind,
    pub status: RunStatus,
    pub requested_by: String,
    pub requested_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_bytes: i64,
    pub torrent_count: i64,
    pub manifest_path: Option<String>,
    pub error_message: Option<String>,
}

fn row_to_run(row: &Row) -> rusqlite::Result<BackupRun> {
    Ok(BackupRun {
        id: row.get("id")?,
        instance_id: row.get("instance_id")?,
        kind: row.get("kind")?,
        status: row.get("status")?,
        requested_by: row.get("requested_by")?,
        requested_at: row.get("requested_at")?,
        started_at: row.get("started_at")?,
        completed_at: row.get("completed_at")?,
        total_bytes: row.get("total_bytes")?,
        torrent_count: row.get("torrent_count")?,
        manifest_path: row.get("manifest_path")?,
        error_message: row.get("error_message")?,
    })
}

pub fn find_by_id(conn: &Connection, id: i64) -> anyhow::Result<Option<BackupRun>> {
    let run = conn
        .query_row("SELECT * FROM backup_runs WHERE id = ?", params![id], row_to_run)
        .optional()?;
    Ok(run)
}

pub fn find_by_instance(
    conn: &Connection,
    instance_id: i64,
    limit: i64,
    offset: i64,
) -> anyhow::Result<Vec<BackupRun>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM backup_runs WHERE instance_id = ? ORDER BY requested_at DESC, id DESC LIMIT ? OFFSET ?",
    )?;
    let rows = stmt.query_map(params![instance_id, limit, offset], row_to_run)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn find_all_by_instance(conn: &Connection, instance_id: i64) -> anyhow::Result<Vec<BackupRun>> {
    find_by_instance(conn, instance_id, -1, 0)
}

pub fn find_active(conn: &Connection, instance_id: i64) -> anyhow::Result<Option<BackupRun>> {
    let run = conn
        .query_row(
            "SELECT * FROM backup_runs WHERE instance_id = ? AND status IN ('pending','running') ORDER BY id LIMIT 1",
            params![instance_id],
            row_to_run,
        )
        .optional()?;
    Ok(run)
}

pub fn find_all_active(conn: &Connection) -> anyhow::Result<Vec<BackupRun>> {
    let mut stmt =
        conn.prepare("SELECT * FROM backup_runs WHERE status IN ('pending','running') ORDER BY id")?;
    let rows = stmt.query_map([], row_to_run)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Successful runs of one cadence for one instance, newest first.
pub fn find_successful_by_kind(
    conn: &Connection,
    instance_id: i64,
    kind: RunKind,
) -> anyhow::Result<Vec<BackupRun>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM backup_runs WHERE instance_id = ? AND kind = ? AND status = 'success'
         ORDER BY requested_at DESC, id DESC",
    )?;
    let rows = stmt.query_map(params![instance_id, kind], row_to_run)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn create(
    conn: &Connection,
    instance_id: i64,
    kind: RunKind,
    requested_by: &str,
) -> anyhow::Result<BackupRun> {
    let now = Utc::now();
    conn.execute(
        "INSERT INTO backup_runs (instance_id, kind, status, requested_by, requested_at)
         VALUES (?1, ?2, 'pending', ?3, ?4)",
        params![instance_id, kind, requested_by, now],
    )?;
    let id = conn.last_insert_rowid();
    find_by_id(conn, id)?.ok_or_else(|| anyhow::anyhow!("Failed to retrieve created run"))
}

/// Move a pending run to running. Returns false if another caller got there
/// first or the run was canceled while queued.
pub fn claim(conn: &Connection, id: i64) -> anyhow::Result<bool> {
    let changes = conn.execute(
        "UPDATE backup_runs SET status = 'running', started_at = ? WHERE id = ? AND status = 'pending'",
        params![Utc::now(), id],
    )?;
    Ok(changes == 1)
}

pub fn cancel_pending(conn: &Connection, id: i64) -> anyhow::Result<bool> {
    let changes = conn.execute(
        "UPDATE backup_runs SET status = 'canceled', completed_at = ? WHERE id = ? AND status = 'pending'",
        params![Utc::now(), id],
    )?;
    Ok(changes == 1)
}

/// Terminal transition for a run that did not produce a manifest.
pub fn mark_finished(
    conn: &Connection,
    id: i64,
    status: RunStatus,
    error_message: Option<&str>,
) -> anyhow::Result<()> {
    anyhow::ensure!(
        matches!(status, RunStatus::Failed | RunStatus::Canceled),
        "mark_finished only records failed or canceled runs"
    );
    conn.execute(
        "UPDATE backup_runs SET status = ?, completed_at = ?, error_message = ?, manifest_path = NULL
         WHERE id = ? AND status IN ('pending','running')",
        params![status, Utc::now(), error_message, id],
    )?;
    Ok(())
}

pub struct SuccessData<'a> {
    pub manifest_path: &'a str,
    pub total_bytes: i64,
    pub torrent_count: i64,
}

pub fn mark_success(conn: &Connection, id: i64, data: &SuccessData) -> anyhow::Result<()> {
    let changes = conn.execute(
        "UPDATE backup_runs SET status = 'success', completed_at = ?, manifest_path = ?, total_bytes = ?, torrent_count = ?, error_message = NULL
         WHERE id = ? AND status = 'running'",
        params![Utc::now(), data.manifest_path, data.total_bytes, data.torrent_count, id],
    )?;
    anyhow::ensure!(changes == 1, "run {} is no longer running", id);
    Ok(())
}

/// Fail every run a previous process left in pending/running.
pub fn fail_interrupted(conn: &Connection) -> anyhow::Result<usize> {
    let changes = conn.execute(
        "UPDATE backup_runs SET status = 'failed', completed_at = ?, error_message = 'interrupted by restart'
         WHERE status IN ('pending','running')",
        params![Utc::now()],
    )?;
    Ok(changes)
}

pub fn delete(conn: &Connection, id: i64) -> anyhow::Result<bool> {
    let changes = conn.execute("DELETE FROM backup_runs WHERE id = ?", params![id])?;
    Ok(changes > 0)
}
