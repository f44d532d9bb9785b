//! Control API boundary for a managed torrent client instance.
//!
//! The concrete client (HTTP, auth, sessions) lives outside this crate; the
//! engine only sees [`InstanceClient`] and obtains one per instance through a
//! [`ClientProvider`].

#[cfg(test)]
pub(crate) mod fake;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TorrentState {
    Downloading,
    Seeding,
    Paused,
    Checking,
    Queued,
    Error,
    Unknown,
}

/// A torrent as currently reported by the instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveTorrent {
    pub hash: String,
    pub name: String,
    pub size_bytes: i64,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, rename = "infohashV1")]
    pub infohash_v1: Option<String>,
    #[serde(default, rename = "infohashV2")]
    pub infohash_v2: Option<String>,
    pub state: TorrentState,
    /// Completion ratio in `0.0..=1.0`.
    pub progress: f64,
}

/// Everything the planner needs to know about the instance right now.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveState {
    /// Category name to save path.
    pub categories: BTreeMap<String, String>,
    pub tags: Vec<String>,
    pub torrents: Vec<LiveTorrent>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddTorrentOptions {
    pub category: Option<String>,
    pub tags: Vec<String>,
    pub paused: bool,
    pub skip_checking: bool,
}

#[async_trait]
pub trait InstanceClient: Send + Sync {
    async fn list_torrents(&self) -> anyhow::Result<Vec<LiveTorrent>>;

    /// Category name to save path.
    async fn list_categories(&self) -> anyhow::Result<BTreeMap<String, String>>;

    async fn list_tags(&self) -> anyhow::Result<Vec<String>>;

    /// Raw `.torrent` metadata for a torrent known to the instance.
    async fn export_torrent(&self, hash: &str) -> anyhow::Result<Vec<u8>>;

    async fn add_torrent(&self, blob: Vec<u8>, options: AddTorrentOptions) -> anyhow::Result<()>;

    /// Removes the torrent but keeps its payload on disk.
    async fn remove_torrent(&self, hash: &str) -> anyhow::Result<()>;

    async fn set_category(&self, hash: &str, category: &str) -> anyhow::Result<()>;

    /// Replace the torrent's tag set.
    async fn set_tags(&self, hash: &str, tags: &[String]) -> anyhow::Result<()>;

    async fn create_category(&self, name: &str, save_path: &str) -> anyhow::Result<()>;

    async fn edit_category(&self, name: &str, save_path: &str) -> anyhow::Result<()>;

    async fn delete_category(&self, name: &str) -> anyhow::Result<()>;

    async fn create_tag(&self, name: &str) -> anyhow::Result<()>;

    async fn delete_tag(&self, name: &str) -> anyhow::Result<()>;

    async fn resume_torrents(&self, hashes: &[String]) -> anyhow::Result<()>;
}

/// Resolves the control-API client for an instance id.
#[async_trait]
pub trait ClientProvider: Send + Sync {
    async fn client(&self, instance_id: i64) -> anyhow::Result<Arc<dyn InstanceClient>>;
}

/// Collect the full live state of an instance.
pub async fn collect_live_state(client: &dyn InstanceClient) -> anyhow::Result<LiveState> {
    let categories = client.list_categories().await?;
    let tags = client.list_tags().await?;
    let torrents = client.list_torrents().await?;
    Ok(LiveState {
        categories,
        tags,
        torrents,
    })
}
