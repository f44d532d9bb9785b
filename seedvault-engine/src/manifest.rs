//! Manifest model: the codec-independent description of a run's contents.
//!
//! Serialized once per successful run as indented JSON. The same bytes are
//! written to disk and to the `manifest.json` entry of every exported
//! archive, so an export followed by an import reproduces them exactly.

use crate::error::{BackupError, Result};
use crate::models::backup_run::RunKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Archive entry name of the manifest.
pub const MANIFEST_FILE_NAME: &str = "manifest.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    #[serde(rename = "instanceID")]
    pub instance_id: i64,
    pub kind: RunKind,
    pub torrent_count: usize,
    pub generated_at: DateTime<Utc>,
    #[serde(default)]
    pub categories: BTreeMap<String, CategorySnapshot>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub items: Vec<ManifestItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategorySnapshot {
    #[serde(default)]
    pub save_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestItem {
    pub hash: String,
    pub name: String,
    #[serde(default)]
    pub archive_path: String,
    pub size_bytes: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub torrent_blob: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, rename = "infohashV1", skip_serializing_if = "Option::is_none")]
    pub infohash_v1: Option<String>,
    #[serde(default, rename = "infohashV2", skip_serializing_if = "Option::is_none")]
    pub infohash_v2: Option<String>,
}

impl ManifestItem {
    /// Blob reference, if the item carries one.
    pub fn blob(&self) -> Option<&str> {
        self.torrent_blob.as_deref().filter(|b| !b.is_empty())
    }

    /// Tags as a sorted, de-duplicated list.
    pub fn tag_set(&self) -> Vec<String> {
        normalize_tags(self.tags.as_deref().unwrap_or_default())
    }
}

/// Sort and de-duplicate tags, dropping blanks.
pub fn normalize_tags(tags: &[String]) -> Vec<String> {
    let mut out: Vec<String> = tags
        .iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();
    out.sort();
    out.dedup();
    out
}

/// Archive entry name for a torrent blob.
pub fn archive_path_for(hash: &str) -> String {
    format!("torrents/{}.torrent", hash.to_ascii_lowercase())
}

impl Manifest {
    pub fn new(instance_id: i64, kind: RunKind, generated_at: DateTime<Utc>) -> Self {
        Self {
            instance_id,
            kind,
            torrent_count: 0,
            generated_at,
            categories: BTreeMap::new(),
            tags: Vec::new(),
            items: Vec::new(),
        }
    }

    pub fn push_item(&mut self, item: ManifestItem) {
        self.items.push(item);
        self.torrent_count = self.items.len();
    }

    pub fn validate(&self) -> Result<()> {
        if self.torrent_count != self.items.len() {
            return Err(BackupError::InvalidManifest(format!(
                "torrentCount is {} but {} items are present",
                self.torrent_count,
                self.items.len()
            )));
        }
        let mut seen = HashSet::with_capacity(self.items.len());
        for item in &self.items {
            if item.hash.is_empty() {
                return Err(BackupError::InvalidManifest("item with empty hash".into()));
            }
            if !seen.insert(item.hash.to_ascii_lowercase()) {
                return Err(BackupError::InvalidManifest(format!("duplicate hash {}", item.hash)));
            }
        }
        Ok(())
    }

    /// Canonical indented JSON.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        self.validate()?;
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let manifest: Manifest = serde_json::from_slice(bytes)
            .map_err(|e| BackupError::InvalidManifest(e.to_string()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn item(&self, hash: &str) -> Option<&ManifestItem> {
        self.items.iter().find(|i| i.hash.eq_ignore_ascii_case(hash))
    }

    pub fn total_bytes(&self) -> i64 {
        self.items.iter().map(|i| i.size_bytes).sum()
    }
}

#[cfg(test)]
pub(crate) fn sample_item(hash: &str, blob: Option<&str>) -> ManifestItem {
    ManifestItem {
        hash: hash.to_string(),
        name: format!("{hash} name"),
        archive_path: archive_path_for(hash),
        size_bytes: 1024,
        torrent_blob: blob.map(String::from),
        category: None,
        tags: None,
        infohash_v1: Some(hash.to_string()),
        infohash_v2: None,
    }
}
