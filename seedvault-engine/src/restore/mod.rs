//! Restore: diff a stored manifest against a live instance and apply the
//! difference.

pub mod executor;
pub mod planner;

use crate::error::BackupError;
use crate::instance::LiveTorrent;
use crate::manifest::ManifestItem;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub use executor::{execute, RestoreOptions, RestoreResult, ResumeSettings};
pub use planner::plan;

/// How far a restore may go in changing the live instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestoreMode {
    /// Add what is missing.
    Incremental,
    /// Add, and update what differs.
    Overwrite,
    /// Add, update, and remove what the snapshot does not have.
    Complete,
}

impl RestoreMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestoreMode::Incremental => "incremental",
            RestoreMode::Overwrite => "overwrite",
            RestoreMode::Complete => "complete",
        }
    }

    pub fn updates(&self) -> bool {
        *self >= RestoreMode::Overwrite
    }

    pub fn deletes(&self) -> bool {
        *self == RestoreMode::Complete
    }
}

impl fmt::Display for RestoreMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RestoreMode {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "incremental" => Ok(RestoreMode::Incremental),
            "overwrite" => Ok(RestoreMode::Overwrite),
            "complete" => Ok(RestoreMode::Complete),
            other => Err(BackupError::InvalidRequest(format!("unknown restore mode: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryCreate {
    pub name: String,
    pub save_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryUpdate {
    pub name: String,
    pub current_path: String,
    pub desired_path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryPlan {
    pub create: Vec<CategoryCreate>,
    pub update: Vec<CategoryUpdate>,
    pub delete: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagPlan {
    pub create: Vec<String>,
    pub delete: Vec<String>,
}

/// Torrent fields the planner compares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TorrentField {
    Name,
    Category,
    Tags,
    Size,
    InfohashV1,
    InfohashV2,
}

impl TorrentField {
    /// Whether the control API can change this field in place.
    pub fn supported(&self) -> bool {
        matches!(self, TorrentField::Category | TorrentField::Tags)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldChange {
    pub field: TorrentField,
    pub current: String,
    pub desired: String,
    pub supported: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TorrentUpdate {
    pub hash: String,
    pub current: LiveTorrent,
    pub desired: ManifestItem,
    pub changes: Vec<FieldChange>,
}

impl TorrentUpdate {
    pub fn has_supported(&self) -> bool {
        self.changes.iter().any(|c| c.supported)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TorrentPlan {
    pub add: Vec<ManifestItem>,
    pub update: Vec<TorrentUpdate>,
    pub delete: Vec<String>,
}

/// Difference between a manifest and the live instance. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestorePlan {
    pub mode: RestoreMode,
    pub categories: CategoryPlan,
    pub tags: TagPlan,
    pub torrents: TorrentPlan,
}

impl RestorePlan {
    pub fn is_empty(&self) -> bool {
        self.categories.create.is_empty()
            && self.categories.update.is_empty()
            && self.categories.delete.is_empty()
            && self.tags.create.is_empty()
            && self.tags.delete.is_empty()
            && self.torrents.add.is_empty()
            && self.torrents.update.is_empty()
            && self.torrents.delete.is_empty()
    }
}
