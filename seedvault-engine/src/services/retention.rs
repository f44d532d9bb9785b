//! Rotation of scheduled runs.
//!
//! Keep-counts resolve from the `settings` table (per-instance key, then the
//! global key) and fall back to the configured defaults. A keep-count of
//! zero disables pruning for that cadence. Manual and import runs are never
//! pruned.

use crate::config::RetentionDefaults;
use crate::models::backup_run::{self, RunKind};
use crate::models::settings;
use rusqlite::Connection;

fn default_for(defaults: &RetentionDefaults, kind: RunKind) -> Option<usize> {
    match kind {
        RunKind::Hourly => Some(defaults.hourly),
        RunKind::Daily => Some(defaults.daily),
        RunKind::Weekly => Some(defaults.weekly),
        RunKind::Monthly => Some(defaults.monthly),
        RunKind::Manual | RunKind::Import => None,
    }
}

pub fn setting_key(kind: RunKind, instance_id: Option<i64>) -> String {
    match instance_id {
        Some(id) => format!("retention.{kind}.{id}"),
        None => format!("retention.{kind}"),
    }
}

/// How many successful runs of `kind` to keep, or `None` for no pruning.
pub fn keep_count(
    conn: &Connection,
    defaults: &RetentionDefaults,
    instance_id: i64,
    kind: RunKind,
) -> anyhow::Result<Option<usize>> {
    let Some(fallback) = default_for(defaults, kind) else {
        return Ok(None);
    };
    let keep = match settings::get_parsed::<usize>(conn, &setting_key(kind, Some(instance_id)))? {
        Some(v) => v,
        None => settings::get_parsed::<usize>(conn, &setting_key(kind, None))?.unwrap_or(fallback),
    };
    Ok((keep > 0).then_some(keep))
}

/// Successful runs of `kind` beyond the keep-count, oldest last.
pub fn runs_to_prune(
    conn: &Connection,
    defaults: &RetentionDefaults,
    instance_id: i64,
    kind: RunKind,
) -> anyhow::Result<Vec<i64>> {
    let Some(keep) = keep_count(conn, defaults, instance_id, kind)? else {
        return Ok(Vec::new());
    };
    let runs = backup_run::find_successful_by_kind(conn, instance_id, kind)?;
    Ok(runs.into_iter().skip(keep).map(|r| r.id).collect())
}
