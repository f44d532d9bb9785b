//! In-memory instance used by tests. Records every mutating call.

use super::{AddTorrentOptions, ClientProvider, InstanceClient, LiveTorrent, TorrentState};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct Inner {
    categories: BTreeMap<String, String>,
    tags: Vec<String>,
    torrents: Vec<LiveTorrent>,
    blobs: HashMap<String, Vec<u8>>,
    calls: Vec<String>,
    fail_on: HashSet<String>,
}

#[derive(Default)]
pub struct FakeInstance {
    inner: Mutex<Inner>,
}

pub fn torrent(hash: &str) -> LiveTorrent {
    LiveTorrent {
        hash: hash.to_string(),
        name: format!("{hash} name"),
        size_bytes: 1024,
        category: String::new(),
        tags: Vec::new(),
        infohash_v1: Some(hash.to_string()),
        infohash_v2: None,
        state: TorrentState::Seeding,
        progress: 1.0,
    }
}

impl FakeInstance {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_category(self: &Arc<Self>, name: &str, path: &str) -> Arc<Self> {
        self.inner.lock().unwrap().categories.insert(name.into(), path.into());
        self.clone()
    }

    pub fn with_tag(self: &Arc<Self>, tag: &str) -> Arc<Self> {
        self.inner.lock().unwrap().tags.push(tag.into());
        self.clone()
    }

    pub fn with_torrent(self: &Arc<Self>, t: LiveTorrent, blob: Option<&[u8]>) -> Arc<Self> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(b) = blob {
            inner.blobs.insert(t.hash.clone(), b.to_vec());
        }
        inner.torrents.push(t);
        drop(inner);
        self.clone()
    }

    /// Make every call whose name starts with `op` fail.
    pub fn fail(self: &Arc<Self>, op: &str) -> Arc<Self> {
        self.inner.lock().unwrap().fail_on.insert(op.into());
        self.clone()
    }

    pub fn calls(&self) -> Vec<String> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub fn mutating_calls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| !c.starts_with("list_") && !c.starts_with("export_"))
            .collect()
    }

    pub fn torrents(&self) -> Vec<LiveTorrent> {
        self.inner.lock().unwrap().torrents.clone()
    }

    pub fn categories(&self) -> BTreeMap<String, String> {
        self.inner.lock().unwrap().categories.clone()
    }

    pub fn tags(&self) -> Vec<String> {
        self.inner.lock().unwrap().tags.clone()
    }

    fn record(&self, call: String) -> anyhow::Result<std::sync::MutexGuard<'_, Inner>> {
        let mut inner = self.inner.lock().unwrap();
        let failing = inner.fail_on.iter().any(|op| call.starts_with(op.as_str()));
        inner.calls.push(call.clone());
        if failing {
            anyhow::bail!("injected failure: {call}");
        }
        Ok(inner)
    }
}

#[async_trait]
impl InstanceClient for FakeInstance {
    async fn list_torrents(&self) -> anyhow::Result<Vec<LiveTorrent>> {
        Ok(self.record("list_torrents".into())?.torrents.clone())
    }

    async fn list_categories(&self) -> anyhow::Result<BTreeMap<String, String>> {
        Ok(self.record("list_categories".into())?.categories.clone())
    }

    async fn list_tags(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.record("list_tags".into())?.tags.clone())
    }

    async fn export_torrent(&self, hash: &str) -> anyhow::Result<Vec<u8>> {
        let inner = self.record(format!("export_torrent {hash}"))?;
        inner
            .blobs
            .get(hash)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no metadata for {hash}"))
    }

    async fn add_torrent(&self, blob: Vec<u8>, options: AddTorrentOptions) -> anyhow::Result<()> {
        let hash = String::from_utf8_lossy(&blob).trim().to_string();
        let mut inner = self.record(format!("add_torrent {hash}"))?;
        let mut t = torrent(&hash);
        t.category = options.category.unwrap_or_default();
        t.tags = options.tags;
        if options.paused {
            t.state = TorrentState::Paused;
        }
        inner.blobs.insert(hash, blob);
        inner.torrents.push(t);
        Ok(())
    }

    async fn remove_torrent(&self, hash: &str) -> anyhow::Result<()> {
        let mut inner = self.record(format!("remove_torrent {hash}"))?;
        inner.torrents.retain(|t| t.hash != hash);
        Ok(())
    }

    async fn set_category(&self, hash: &str, category: &str) -> anyhow::Result<()> {
        let mut inner = self.record(format!("set_category {hash} {category}"))?;
        if let Some(t) = inner.torrents.iter_mut().find(|t| t.hash == hash) {
            t.category = category.into();
        }
        Ok(())
    }

    async fn set_tags(&self, hash: &str, tags: &[String]) -> anyhow::Result<()> {
        let mut inner = self.record(format!("set_tags {hash} {}", tags.join(",")))?;
        if let Some(t) = inner.torrents.iter_mut().find(|t| t.hash == hash) {
            t.tags = tags.to_vec();
        }
        Ok(())
    }

    async fn create_category(&self, name: &str, save_path: &str) -> anyhow::Result<()> {
        let mut inner = self.record(format!("create_category {name}"))?;
        inner.categories.insert(name.into(), save_path.into());
        Ok(())
    }

    async fn edit_category(&self, name: &str, save_path: &str) -> anyhow::Result<()> {
        let mut inner = self.record(format!("edit_category {name}"))?;
        inner.categories.insert(name.into(), save_path.into());
        Ok(())
    }

    async fn delete_category(&self, name: &str) -> anyhow::Result<()> {
        let mut inner = self.record(format!("delete_category {name}"))?;
        inner.categories.remove(name);
        Ok(())
    }

    async fn create_tag(&self, name: &str) -> anyhow::Result<()> {
        let mut inner = self.record(format!("create_tag {name}"))?;
        inner.tags.push(name.into());
        Ok(())
    }

    async fn delete_tag(&self, name: &str) -> anyhow::Result<()> {
        let mut inner = self.record(format!("delete_tag {name}"))?;
        inner.tags.retain(|t| t != name);
        Ok(())
    }

    async fn resume_torrents(&self, hashes: &[String]) -> anyhow::Result<()> {
        let mut inner = self.record(format!("resume_torrents {}", hashes.join(",")))?;
        for t in inner.torrents.iter_mut().filter(|t| hashes.contains(&t.hash)) {
            t.state = TorrentState::Seeding;
        }
        Ok(())
    }
}

/// Serves the same fake for every instance id.
pub struct FakeProvider(pub Arc<FakeInstance>);

#[async_trait]
impl ClientProvider for FakeProvider {
    async fn client(&self, _instance_id: i64) -> anyhow::Result<Arc<dyn InstanceClient>> {
        Ok(self.0.clone())
    }
}
