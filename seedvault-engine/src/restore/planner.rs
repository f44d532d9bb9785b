//! Three-way diff of categories, tags and torrents.
//!
//! Output order is fixed by the inputs: category sections follow name order,
//! torrent adds and updates follow manifest order, torrent deletes follow
//! live order, and tag sections are sorted.

use super::{
    CategoryCreate, CategoryPlan, CategoryUpdate, FieldChange, RestoreMode, RestorePlan,
    TagPlan, TorrentField, TorrentPlan, TorrentUpdate,
};
use crate::instance::{LiveState, LiveTorrent};
use crate::manifest::{normalize_tags, Manifest, ManifestItem};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Lower-cased exclusion set.
pub(crate) fn exclusion_set(exclude_hashes: &[String]) -> HashSet<String> {
    exclude_hashes
        .iter()
        .map(|h| h.trim().to_ascii_lowercase())
        .filter(|h| !h.is_empty())
        .collect()
}

/// Compute the plan that would bring `live` in line with `manifest`.
pub fn plan(
    manifest: &Manifest,
    live: &LiveState,
    mode: RestoreMode,
    exclude_hashes: &[String],
) -> RestorePlan {
    let excluded = exclusion_set(exclude_hashes);
    RestorePlan {
        mode,
        categories: plan_categories(manifest, live, mode),
        tags: plan_tags(manifest, live, mode),
        torrents: plan_torrents(manifest, live, mode, &excluded),
    }
}

fn plan_categories(manifest: &Manifest, live: &LiveState, mode: RestoreMode) -> CategoryPlan {
    let mut out = CategoryPlan::default();
    for (name, snapshot) in &manifest.categories {
        match live.categories.get(name) {
            None => out.create.push(CategoryCreate {
                name: name.clone(),
                save_path: snapshot.save_path.clone(),
            }),
            Some(current) if mode.updates() && *current != snapshot.save_path => {
                out.update.push(CategoryUpdate {
                    name: name.clone(),
                    current_path: current.clone(),
                    desired_path: snapshot.save_path.clone(),
                })
            }
            Some(_) => {}
        }
    }
    if mode.deletes() {
        out.delete = live
            .categories
            .keys()
            .filter(|name| !manifest.categories.contains_key(*name))
            .cloned()
            .collect();
    }
    out
}

fn plan_tags(manifest: &Manifest, live: &LiveState, mode: RestoreMode) -> TagPlan {
    let desired: BTreeSet<String> = normalize_tags(&manifest.tags).into_iter().collect();
    let current: BTreeSet<String> = normalize_tags(&live.tags).into_iter().collect();
    TagPlan {
        create: desired.difference(&current).cloned().collect(),
        delete: if mode.deletes() {
            current.difference(&desired).cloned().collect()
        } else {
            Vec::new()
        },
    }
}

fn plan_torrents(
    manifest: &Manifest,
    live: &LiveState,
    mode: RestoreMode,
    excluded: &HashSet<String>,
) -> TorrentPlan {
    let live_by_hash: HashMap<String, &LiveTorrent> = live
        .torrents
        .iter()
        .map(|t| (t.hash.to_ascii_lowercase(), t))
        .collect();

    let mut out = TorrentPlan::default();
    for item in &manifest.items {
        let key = item.hash.to_ascii_lowercase();
        if excluded.contains(&key) {
            continue;
        }
        match live_by_hash.get(&key) {
            None => out.add.push(item.clone()),
            Some(current) if mode.updates() => {
                let changes = diff_fields(current, item);
                if !changes.is_empty() {
                    out.update.push(TorrentUpdate {
                        hash: item.hash.clone(),
                        current: (*current).clone(),
                        desired: item.clone(),
                        changes,
                    });
                }
            }
            Some(_) => {}
        }
    }

    if mode.deletes() {
        let wanted: HashSet<String> = manifest
            .items
            .iter()
            .map(|i| i.hash.to_ascii_lowercase())
            .collect();
        out.delete = live
            .torrents
            .iter()
            .map(|t| t.hash.clone())
            .filter(|h| {
                let key = h.to_ascii_lowercase();
                !wanted.contains(&key) && !excluded.contains(&key)
            })
            .collect();
    }
    out
}

fn change(field: TorrentField, current: String, desired: String) -> FieldChange {
    let supported = field.supported();
    let message = match field {
        TorrentField::Name => Some("rename the torrent in the client to match".to_string()),
        TorrentField::Size => Some("live content differs from the snapshot".to_string()),
        TorrentField::InfohashV1 | TorrentField::InfohashV2 => Some(
            "infohash mismatch: the live torrent is different content and will not be remapped"
                .to_string(),
        ),
        TorrentField::Category | TorrentField::Tags => None,
    };
    FieldChange {
        field,
        current,
        desired,
        supported,
        message,
    }
}

fn same_hash(current: Option<&str>, desired: &str) -> bool {
    current.is_some_and(|c| c.eq_ignore_ascii_case(desired))
}

/// Fields that differ between the live torrent and the snapshot item.
pub(crate) fn diff_fields(current: &LiveTorrent, desired: &ManifestItem) -> Vec<FieldChange> {
    let mut changes = Vec::new();

    if current.name != desired.name {
        changes.push(change(TorrentField::Name, current.name.clone(), desired.name.clone()));
    }

    let desired_category = desired.category.clone().unwrap_or_default();
    if current.category != desired_category {
        changes.push(change(TorrentField::Category, current.category.clone(), desired_category));
    }

    let current_tags = normalize_tags(&current.tags);
    let desired_tags = desired.tag_set();
    if current_tags != desired_tags {
        changes.push(change(TorrentField::Tags, current_tags.join(","), desired_tags.join(",")));
    }

    if current.size_bytes != desired.size_bytes {
        changes.push(change(
            TorrentField::Size,
            current.size_bytes.to_string(),
            desired.size_bytes.to_string(),
        ));
    }

    // An absent snapshot infohash carries no claim to compare.
    if let Some(v1) = desired.infohash_v1.as_deref().filter(|h| !h.is_empty()) {
        if !same_hash(current.infohash_v1.as_deref(), v1) {
            changes.push(change(
                TorrentField::InfohashV1,
                current.infohash_v1.clone().unwrap_or_default(),
                v1.to_string(),
            ));
        }
    }
    if let Some(v2) = desired.infohash_v2.as_deref().filter(|h| !h.is_empty()) {
        if !same_hash(current.infohash_v2.as_deref(), v2) {
            changes.push(change(
                TorrentField::InfohashV2,
                current.infohash_v2.clone().unwrap_or_default(),
                v2.to_string(),
            ));
        }
    }

    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::fake::torrent;
    use crate::manifest::{sample_item, CategorySnapshot};
    use crate::models::backup_run::RunKind;
    use chrono::Utc;

    fn manifest_with_categories(names: &[(&str, &str)]) -> Manifest {
        let mut m = Manifest::new(1, RunKind::Manual, Utc::now());
        for (name, path) in names {
            m.categories
                .insert(name.to_string(), CategorySnapshot { save_path: path.to_string() });
        }
        m
    }

    fn live_with_categories(names: &[(&str, &str)]) -> LiveState {
        LiveState {
            categories: names.iter().map(|(n, p)| (n.to_string(), p.to_string())).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_category_modes() {
        let manifest = manifest_with_categories(&[("A", "/a"), ("B", "/b")]);
        let live = live_with_categories(&[("B", "/b"), ("C", "/c")]);

        let incremental = plan(&manifest, &live, RestoreMode::Incremental, &[]);
        let created: Vec<_> = incremental.categories.create.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(created, vec!["A"]);
        assert!(incremental.categories.delete.is_empty());

        let complete = plan(&manifest, &live, RestoreMode::Complete, &[]);
        let created: Vec<_> = complete.categories.create.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(created, vec!["A"]);
        assert_eq!(complete.categories.delete, vec!["C"]);
        assert!(complete.categories.update.is_empty());
    }

    #[test]
    fn test_category_path_update_only_when_overwriting() {
        let manifest = manifest_with_categories(&[("B", "/new")]);
        let live = live_with_categories(&[("B", "/old")]);

        assert!(plan(&manifest, &live, RestoreMode::Incremental, &[]).categories.update.is_empty());
        let overwrite = plan(&manifest, &live, RestoreMode::Overwrite, &[]);
        assert_eq!(
            overwrite.categories.update,
            vec![CategoryUpdate {
                name: "B".into(),
                current_path: "/old".into(),
                desired_path: "/new".into(),
            }]
        );
    }

    #[test]
    fn test_tags_sorted_sets() {
        let mut manifest = Manifest::new(1, RunKind::Manual, Utc::now());
        manifest.tags = vec!["z".into(), "a".into(), "keep".into()];
        let live = LiveState {
            tags: vec!["keep".into(), "old".into()],
            ..Default::default()
        };

        let p = plan(&manifest, &live, RestoreMode::Overwrite, &[]);
        assert_eq!(p.tags.create, vec!["a", "z"]);
        assert!(p.tags.delete.is_empty());
        let p = plan(&manifest, &live, RestoreMode::Complete, &[]);
        assert_eq!(p.tags.delete, vec!["old"]);
    }

    #[test]
    fn test_torrent_sections() {
        let mut manifest = Manifest::new(1, RunKind::Manual, Utc::now());
        manifest.push_item(sample_item("new1", Some("torrents/ne/new1.torrent")));
        let mut changed = sample_item("same", None);
        changed.category = Some("movies".into());
        manifest.push_item(changed);

        // Live hash casing differs; infohash comparison is case-insensitive too.
        let mut live = LiveState {
            torrents: vec![torrent("SAME"), torrent("gone")],
            ..Default::default()
        };
        live.torrents[0].name = "same name".into();

        let p = plan(&manifest, &live, RestoreMode::Complete, &[]);
        assert_eq!(p.torrents.add.len(), 1);
        assert_eq!(p.torrents.add[0].hash, "new1");
        assert_eq!(p.torrents.update.len(), 1);
        let fields: Vec<_> = p.torrents.update[0].changes.iter().map(|c| c.field).collect();
        assert_eq!(fields, vec![TorrentField::Category]);
        assert!(p.torrents.update[0].has_supported());
        assert_eq!(p.torrents.delete, vec!["gone"]);

        let p = plan(&manifest, &live, RestoreMode::Incremental, &[]);
        assert!(p.torrents.update.is_empty());
        assert!(p.torrents.delete.is_empty());
    }

    #[test]
    fn test_infohash_mismatch_is_unsupported() {
        let item = sample_item("abc", None);
        let mut live = torrent("abc");
        live.name = item.name.clone();
        live.infohash_v1 = Some("different".into());

        let changes = diff_fields(&live, &item);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].field, TorrentField::InfohashV1);
        assert!(!changes[0].supported);
        assert!(changes[0].message.is_some());
    }

    #[test]
    fn test_planning_is_idempotent() {
        let mut manifest = manifest_with_categories(&[("A", "/a"), ("B", "/b2")]);
        manifest.tags = vec!["t1".into(), "t2".into()];
        for h in ["h1", "h2", "h3"] {
            let mut item = sample_item(h, None);
            item.tags = Some(vec!["t1".into()]);
            manifest.push_item(item);
        }
        let mut live = live_with_categories(&[("B", "/b"), ("C", "/c")]);
        live.tags = vec!["t3".into()];
        live.torrents = vec![torrent("h2"), torrent("x1"), torrent("x2")];

        for mode in [RestoreMode::Incremental, RestoreMode::Overwrite, RestoreMode::Complete] {
            let first = plan(&manifest, &live, mode, &["x2".into()]);
            let second = plan(&manifest, &live, mode, &["x2".into()]);
            assert_eq!(first, second);
            assert_eq!(
                serde_json::to_string(&first).unwrap(),
                serde_json::to_string(&second).unwrap()
            );
        }
    }

    #[test]
    fn test_excluded_hashes_never_planned() {
        let mut manifest = Manifest::new(1, RunKind::Manual, Utc::now());
        manifest.push_item(sample_item("add-me", None));
        let mut upd = sample_item("update-me", None);
        upd.category = Some("other".into());
        manifest.push_item(upd);

        let live = LiveState {
            torrents: vec![torrent("update-me"), torrent("delete-me")],
            ..Default::default()
        };
        let exclude = vec!["ADD-ME".to_string(), "update-me".into(), "delete-me".into()];
        let p = plan(&manifest, &live, RestoreMode::Complete, &exclude);
        for hash in ["add-me", "update-me", "delete-me"] {
            assert!(!p.torrents.add.iter().any(|i| i.hash.eq_ignore_ascii_case(hash)));
            assert!(!p.torrents.update.iter().any(|u| u.hash.eq_ignore_ascii_case(hash)));
            assert!(!p.torrents.delete.iter().any(|h| h.eq_ignore_ascii_case(hash)));
        }
        assert!(p.is_empty());
    }
}
