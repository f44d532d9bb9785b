//! Archive extraction shared by every container codec.

use super::{ArchiveFormat, SkipReason, StreamExtract};
use crate::error::{BackupError, Result};
use crate::manifest::{Manifest, MANIFEST_FILE_NAME};
use crate::utils::safe_path;
use serde::Serialize;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const BLOB_DIR: &str = "blobs";

/// An archive entry that was not extracted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedEntry {
    pub name: String,
    pub reason: SkipReason,
}

/// Result of extracting one archive into a caller-owned directory.
#[derive(Debug)]
pub struct Extraction {
    pub manifest_path: PathBuf,
    /// Lower-case torrent hash to extracted `.torrent` file.
    pub blobs: HashMap<String, PathBuf>,
    pub skipped: Vec<SkippedEntry>,
}

/// An extraction together with the temporary directory holding its files.
/// Dropping it removes the directory.
#[derive(Debug)]
pub struct ExtractedArchive {
    pub extraction: Extraction,
    pub workdir: TempDir,
}

/// Classifies archive entries and writes the interesting ones under `dest`.
pub(crate) struct Extractor {
    dest: PathBuf,
    blob_root: PathBuf,
    manifest_path: Option<PathBuf>,
    manifest_limit: u64,
    /// Normalised entry name to extracted path.
    blobs_by_entry: HashMap<String, PathBuf>,
    skipped: Vec<SkippedEntry>,
}

fn basename_lower(name: &str) -> String {
    name.replace('\\', "/")
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase()
}

fn normalize_entry(name: &str) -> String {
    safe_path::clean(Path::new(&name.replace('\\', "/")))
        .to_string_lossy()
        .into_owned()
}

impl Extractor {
    pub(crate) fn new(dest: &Path, manifest_limit: u64) -> Result<Self> {
        let blob_root = dest.join(BLOB_DIR);
        fs::create_dir_all(&blob_root)?;
        Ok(Self {
            dest: dest.to_path_buf(),
            blob_root,
            manifest_path: None,
            manifest_limit,
            blobs_by_entry: HashMap::new(),
            skipped: Vec::new(),
        })
    }

    fn skip(&mut self, name: &str, reason: SkipReason, data: &mut dyn Read) -> Result<()> {
        // Drain so stream decoders stay aligned on the next entry.
        io::copy(data, &mut io::sink())?;
        tracing::debug!(entry = %name, ?reason, "Skipping archive entry");
        self.skipped.push(SkippedEntry { name: name.to_string(), reason });
        Ok(())
    }

    pub(crate) fn accept(&mut self, name: &str, is_file: bool, data: &mut dyn Read) -> Result<()> {
        if !is_file {
            return self.skip(name, SkipReason::NotRegularFile, data);
        }
        // Validate against the extraction root before looking at the name.
        let target = match safe_path::resolve_within(&self.blob_root, name) {
            Ok(path) => path,
            Err(e) => {
                tracing::warn!(entry = %name, error = %e, "Discarding unsafe archive entry");
                return self.skip(name, SkipReason::Unsafe(e.to_string()), data);
            }
        };

        let base = basename_lower(name);
        if base == MANIFEST_FILE_NAME {
            if self.manifest_path.is_some() {
                return self.skip(name, SkipReason::DuplicateManifest, data);
            }
            let path = self.dest.join(MANIFEST_FILE_NAME);
            let mut out = File::create(&path)?;
            let copied = io::copy(&mut (&mut *data).take(self.manifest_limit.saturating_add(1)), &mut out)?;
            if copied > self.manifest_limit {
                return Err(BackupError::UploadTooLarge { limit: self.manifest_limit });
            }
            out.sync_all()?;
            self.manifest_path = Some(path);
            return Ok(());
        }

        if base.ends_with(".torrent") {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut out = File::create(&target)?;
            io::copy(data, &mut out)?;
            self.blobs_by_entry.insert(normalize_entry(name), target);
            return Ok(());
        }

        self.skip(name, SkipReason::Unrecognized, data)
    }

    /// Fails closed when no manifest entry was seen.
    pub(crate) fn finish(mut self) -> Result<Extraction> {
        let manifest_path = self.manifest_path.take().ok_or(BackupError::ManifestMissing)?;
        let manifest = Manifest::from_slice(&fs::read(&manifest_path)?)?;

        let mut blobs = HashMap::new();
        for item in &manifest.items {
            let by_entry = self.blobs_by_entry.remove(&normalize_entry(&item.archive_path));
            let by_name = || {
                let wanted = format!("{}.torrent", item.hash.to_ascii_lowercase());
                let key = self
                    .blobs_by_entry
                    .keys()
                    .find(|k| basename_lower(k) == wanted)
                    .cloned()?;
                self.blobs_by_entry.remove(&key)
            };
            if let Some(path) = by_entry.or_else(by_name) {
                blobs.insert(item.hash.to_ascii_lowercase(), path);
            }
        }

        for (name, path) in self.blobs_by_entry.drain() {
            tracing::debug!(entry = %name, "Extracted blob matches no manifest item");
            let _ = fs::remove_file(path);
            self.skipped.push(SkippedEntry { name, reason: SkipReason::Unrecognized });
        }

        Ok(Extraction {
            manifest_path,
            blobs,
            skipped: self.skipped,
        })
    }
}

/// Extract `input` with the codec of `format` into a fresh temporary
/// directory under `scratch`. The manifest size is not bounded.
pub fn extract_to_temp(format: ArchiveFormat, input: &Path, scratch: &Path) -> Result<ExtractedArchive> {
    let codec = format
        .codec()
        .ok_or_else(|| BackupError::UnsupportedFormat(format!("{format} has no container")))?;
    fs::create_dir_all(scratch)?;
    let workdir = tempfile::Builder::new().prefix("extract-").tempdir_in(scratch)?;
    let extraction = codec.stream_extract(input, workdir.path(), u64::MAX)?;
    Ok(ExtractedArchive { extraction, workdir })
}
