//! Apply a restore plan to the live instance.
//!
//! Execution is best-effort per entity: each create, update or delete is
//! attempted on its own and recorded as applied or as an error.

use super::planner::exclusion_set;
use super::{RestoreMode, RestorePlan, TorrentField, TorrentUpdate};
use crate::instance::{AddTorrentOptions, InstanceClient, TorrentState};
use crate::manifest::{Manifest, ManifestItem};
use crate::utils::safe_path;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RestoreOptions {
    pub dry_run: bool,
    pub exclude_hashes: Vec<String>,
    pub start_paused: bool,
    pub skip_hash_check: bool,
    /// Only meaningful together with `skip_hash_check`.
    pub auto_resume_verified: bool,
}

/// Polling for the auto-resume follow-up.
#[derive(Debug, Clone, Copy)]
pub struct ResumeSettings {
    pub poll_interval: Duration,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedSection {
    pub created: Vec<String>,
    pub updated: Vec<String>,
    pub deleted: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Applied {
    pub categories: AppliedSection,
    pub tags: AppliedSection,
    pub torrents: AppliedSection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreError {
    pub operation: String,
    pub target: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreResult {
    pub mode: RestoreMode,
    pub dry_run: bool,
    pub applied: Applied,
    pub warnings: Vec<String>,
    pub errors: Vec<RestoreError>,
}

struct Run<'a> {
    client: Option<&'a dyn InstanceClient>,
    result: RestoreResult,
}

impl Run<'_> {
    /// Perform `op` unless dry-running. Returns whether it counts as applied.
    async fn attempt<F>(&mut self, operation: &str, target: &str, op: F) -> bool
    where
        F: for<'c> FnOnce(
            &'c dyn InstanceClient,
        ) -> futures_util::future::BoxFuture<'c, anyhow::Result<()>>,
    {
        let Some(client) = self.client else {
            return true;
        };
        match op(client).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(operation, target, error = %e, "Restore operation failed");
                self.error(operation, target, e.to_string());
                false
            }
        }
    }

    fn error(&mut self, operation: &str, target: &str, message: String) {
        self.result.errors.push(RestoreError {
            operation: operation.to_string(),
            target: target.to_string(),
            message,
        });
    }
}

fn blob_for(item: &ManifestItem, blob_root: &Path) -> Result<std::path::PathBuf, String> {
    let rel = item
        .blob()
        .ok_or_else(|| "snapshot has no cached .torrent for this item".to_string())?;
    safe_path::resolve_within(blob_root, rel).map_err(|e| e.to_string())
}

fn unsupported_warnings(update: &TorrentUpdate) -> impl Iterator<Item = String> + '_ {
    update.changes.iter().filter(|c| !c.supported).map(move |c| {
        format!(
            "torrent {}: {:?} differs (live {:?}, snapshot {:?}); {}",
            update.hash,
            c.field,
            c.current,
            c.desired,
            c.message.as_deref().unwrap_or("manual action required")
        )
    })
}

/// Apply `plan` to the instance behind `client`.
///
/// With `options.dry_run` no client call is made and the result lists what
/// would have been applied. Hashes in `options.exclude_hashes` are skipped
/// even if the plan still contains them.
pub async fn execute(
    client: Arc<dyn InstanceClient>,
    manifest: &Manifest,
    plan: &RestorePlan,
    options: &RestoreOptions,
    blob_root: &Path,
    resume: ResumeSettings,
) -> RestoreResult {
    let excluded = exclusion_set(&options.exclude_hashes);
    let is_excluded = |hash: &str| excluded.contains(&hash.to_ascii_lowercase());

    let mut run = Run {
        client: if options.dry_run { None } else { Some(client.as_ref()) },
        result: RestoreResult {
            mode: plan.mode,
            dry_run: options.dry_run,
            applied: Applied::default(),
            warnings: Vec::new(),
            errors: Vec::new(),
        },
    };

    tracing::info!(
        instance_id = manifest.instance_id,
        mode = %plan.mode,
        dry_run = options.dry_run,
        "Executing restore plan"
    );

    // Categories: deletes, then creates, then path updates.
    for name in &plan.categories.delete {
        let n = name.clone();
        if run
            .attempt("category.delete", name, move |c| Box::pin(async move { c.delete_category(&n).await }))
            .await
        {
            run.result.applied.categories.deleted.push(name.clone());
        }
    }
    for create in &plan.categories.create {
        let (n, p) = (create.name.clone(), create.save_path.clone());
        if run
            .attempt("category.create", &create.name, move |c| {
                Box::pin(async move { c.create_category(&n, &p).await })
            })
            .await
        {
            run.result.applied.categories.created.push(create.name.clone());
        }
    }
    for update in &plan.categories.update {
        let (n, p) = (update.name.clone(), update.desired_path.clone());
        if run
            .attempt("category.update", &update.name, move |c| {
                Box::pin(async move { c.edit_category(&n, &p).await })
            })
            .await
        {
            run.result.applied.categories.updated.push(update.name.clone());
        }
    }

    // Tags: deletes, then creates.
    for tag in &plan.tags.delete {
        let t = tag.clone();
        if run
            .attempt("tag.delete", tag, move |c| Box::pin(async move { c.delete_tag(&t).await }))
            .await
        {
            run.result.applied.tags.deleted.push(tag.clone());
        }
    }
    for tag in &plan.tags.create {
        let t = tag.clone();
        if run
            .attempt("tag.create", tag, move |c| Box::pin(async move { c.create_tag(&t).await }))
            .await
        {
            run.result.applied.tags.created.push(tag.clone());
        }
    }

    // Torrent deletes precede adds.
    for hash in plan.torrents.delete.iter().filter(|h| !is_excluded(h.as_str())) {
        let h = hash.clone();
        if run
            .attempt("torrent.delete", hash, move |c| Box::pin(async move { c.remove_torrent(&h).await }))
            .await
        {
            run.result.applied.torrents.deleted.push(hash.clone());
        }
    }

    let wants_resume = options.skip_hash_check && options.auto_resume_verified;
    for item in plan.torrents.add.iter().filter(|i| !is_excluded(i.hash.as_str())) {
        let path = match blob_for(item, blob_root) {
            Ok(path) => path,
            Err(message) => {
                run.error("torrent.add", &item.hash, message);
                continue;
            }
        };
        let blob = match tokio::fs::read(&path).await {
            Ok(blob) => blob,
            Err(e) => {
                run.error("torrent.add", &item.hash, format!("reading {}: {e}", path.display()));
                continue;
            }
        };
        let add_options = AddTorrentOptions {
            category: item.category.clone().filter(|c| !c.is_empty()),
            tags: item.tag_set(),
            // Added paused so the resume poller decides when it starts.
            paused: options.start_paused || wants_resume,
            skip_checking: options.skip_hash_check,
        };
        if run
            .attempt("torrent.add", &item.hash, move |c| {
                Box::pin(async move { c.add_torrent(blob, add_options).await })
            })
            .await
        {
            run.result.applied.torrents.created.push(item.hash.clone());
        }
    }

    for update in plan.torrents.update.iter().filter(|u| !is_excluded(u.hash.as_str())) {
        run.result.warnings.extend(unsupported_warnings(update));
        if !update.has_supported() {
            continue;
        }
        let mut ok = true;
        for change in update.changes.iter().filter(|c| c.supported) {
            let hash = update.hash.clone();
            ok &= match change.field {
                TorrentField::Category => {
                    let category = change.desired.clone();
                    run.attempt("torrent.setCategory", &update.hash, move |c| {
                        Box::pin(async move { c.set_category(&hash, &category).await })
                    })
                    .await
                }
                TorrentField::Tags => {
                    let tags = update.desired.tag_set();
                    run.attempt("torrent.setTags", &update.hash, move |c| {
                        Box::pin(async move { c.set_tags(&hash, &tags).await })
                    })
                    .await
                }
                _ => true,
            };
        }
        if ok {
            run.result.applied.torrents.updated.push(update.hash.clone());
        }
    }

    if wants_resume && !options.dry_run && !run.result.applied.torrents.created.is_empty() {
        let hashes = run.result.applied.torrents.created.clone();
        let start_paused = options.start_paused;
        if start_paused {
            run.result
                .warnings
                .push("autoResumeVerified ignored because startPaused is set".to_string());
        } else {
            tracing::info!(count = hashes.len(), "Scheduling auto-resume of verified torrents");
            tokio::spawn(resume_verified(client.clone(), hashes, resume));
        }
    } else if options.auto_resume_verified && !options.skip_hash_check {
        run.result
            .warnings
            .push("autoResumeVerified has no effect without skipHashCheck".to_string());
    }

    let result = run.result;
    tracing::info!(
        instance_id = manifest.instance_id,
        errors = result.errors.len(),
        warnings = result.warnings.len(),
        "Restore finished"
    );
    result
}

/// Resume `hashes` once the instance reports them complete and paused.
/// Returns the hashes that were resumed before the timeout.
pub async fn resume_verified(
    client: Arc<dyn InstanceClient>,
    hashes: Vec<String>,
    settings: ResumeSettings,
) -> Vec<String> {
    let mut pending: HashSet<String> = hashes.iter().map(|h| h.to_ascii_lowercase()).collect();
    let mut resumed = Vec::new();
    let deadline = tokio::time::Instant::now() + settings.timeout;

    while !pending.is_empty() && tokio::time::Instant::now() < deadline {
        match client.list_torrents().await {
            Ok(torrents) => {
                let ready: Vec<String> = torrents
                    .iter()
                    .filter(|t| pending.contains(&t.hash.to_ascii_lowercase()))
                    .filter(|t| t.state == TorrentState::Paused && t.progress >= 1.0)
                    .map(|t| t.hash.clone())
                    .collect();
                if !ready.is_empty() {
                    match client.resume_torrents(&ready).await {
                        Ok(()) => {
                            for h in &ready {
                                pending.remove(&h.to_ascii_lowercase());
                            }
                            resumed.extend(ready);
                        }
                        Err(e) => tracing::warn!(error = %e, "Failed to resume verified torrents"),
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "Failed to poll torrents for auto-resume"),
        }
        if pending.is_empty() {
            break;
        }
        tokio::time::sleep(settings.poll_interval).await;
    }

    if !pending.is_empty() {
        tracing::warn!(remaining = pending.len(), "Auto-resume timed out");
    }
    resumed
}
