//! Archive formats for exporting and importing runs.
//!
//! A format is either manifest-only (the bare `manifest.json`, no container)
//! or a container codec. Container codecs implement both [`StreamWrite`] and
//! [`StreamExtract`]; the manifest-only format implements neither and is
//! handled as its own case by the writer and the upload reader.

pub mod reader;
pub mod tar_codec;
pub mod upload;
pub mod writer;
pub mod zip_codec;

use crate::error::{BackupError, Result};
use crate::manifest::ManifestItem;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::io::{Read, Write};
use std::path::Path;

pub use reader::Extraction;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Compression {
    None,
    Gzip,
    Zstd,
    Brotli,
    Xz,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContainerCodec {
    Tar(Compression),
    Zip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArchiveFormat {
    ManifestOnly,
    Container(ContainerCodec),
}

struct FormatSpec {
    format: ArchiveFormat,
    name: &'static str,
    suffixes: &'static [&'static str],
}

/// Registered formats in matching priority order. Compound suffixes come
/// before `.tar` so `backup.tar.gz` never matches the plain container.
const FORMATS: &[FormatSpec] = &[
    FormatSpec {
        format: ArchiveFormat::Container(ContainerCodec::Tar(Compression::Gzip)),
        name: "tar.gz",
        suffixes: &[".tar.gz", ".tgz"],
    },
    FormatSpec {
        format: ArchiveFormat::Container(ContainerCodec::Tar(Compression::Zstd)),
        name: "tar.zst",
        suffixes: &[".tar.zst"],
    },
    FormatSpec {
        format: ArchiveFormat::Container(ContainerCodec::Tar(Compression::Brotli)),
        name: "tar.br",
        suffixes: &[".tar.br"],
    },
    FormatSpec {
        format: ArchiveFormat::Container(ContainerCodec::Tar(Compression::Xz)),
        name: "tar.xz",
        suffixes: &[".tar.xz"],
    },
    FormatSpec {
        format: ArchiveFormat::Container(ContainerCodec::Zip),
        name: "zip",
        suffixes: &[".zip"],
    },
    FormatSpec {
        format: ArchiveFormat::Container(ContainerCodec::Tar(Compression::None)),
        name: "tar",
        suffixes: &[".tar"],
    },
    FormatSpec {
        format: ArchiveFormat::ManifestOnly,
        name: "json",
        suffixes: &[".json"],
    },
];

impl ArchiveFormat {
    /// Every registered format, in matching priority order.
    pub fn all() -> impl Iterator<Item = ArchiveFormat> {
        FORMATS.iter().map(|f| f.format)
    }

    fn spec(&self) -> &'static FormatSpec {
        FORMATS
            .iter()
            .find(|f| f.format == *self)
            .unwrap_or(&FORMATS[FORMATS.len() - 1])
    }

    /// Short name, also the file extension used on export.
    pub fn name(&self) -> &'static str {
        self.spec().name
    }

    pub fn extension(&self) -> &'static str {
        self.name()
    }

    /// Look a format up by its short name (`zip`, `tar.gz`, `json`, ...).
    pub fn from_name(name: &str) -> Result<Self> {
        let wanted = name.trim().trim_start_matches('.').to_ascii_lowercase();
        FORMATS
            .iter()
            .find(|f| f.name == wanted || f.suffixes.iter().any(|s| s[1..] == wanted))
            .map(|f| f.format)
            .ok_or(BackupError::UnsupportedFormat(name.to_string()))
    }

    /// Pick a format from an uploaded file name by suffix.
    pub fn from_filename(filename: &str) -> Result<Self> {
        let lower = filename.to_ascii_lowercase();
        FORMATS
            .iter()
            .find(|f| f.suffixes.iter().any(|s| lower.ends_with(s)))
            .map(|f| f.format)
            .ok_or_else(|| BackupError::UnsupportedFormat(filename.to_string()))
    }

    pub fn codec(&self) -> Option<ContainerCodec> {
        match self {
            ArchiveFormat::ManifestOnly => None,
            ArchiveFormat::Container(c) => Some(*c),
        }
    }
}

impl fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ── Per-entry outcomes ──

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "camelCase")]
pub enum SkipReason {
    /// Metadata-only item: nothing to copy.
    NoBlob,
    /// Blob reference failed path validation.
    Unsafe(String),
    /// Blob file could not be opened.
    Missing(String),
    /// Archive entry is a directory, link or other non-file.
    NotRegularFile,
    /// Archive entry is neither the manifest nor a `.torrent` file.
    Unrecognized,
    /// A second `manifest.json` entry; the first one wins.
    DuplicateManifest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum EntryResult {
    Written { bytes: u64 },
    Skipped(SkipReason),
}

/// What happened to one manifest item during export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryOutcome {
    pub hash: String,
    pub archive_path: String,
    pub result: EntryResult,
}

/// A blob ready to be copied into an archive.
pub struct BlobSource {
    pub reader: Box<dyn Read + Send>,
    pub size: u64,
    pub mod_time: DateTime<Utc>,
}

pub enum BlobResolution {
    Ready(BlobSource),
    Skip(SkipReason),
}

/// Resolves a manifest item to its blob. Returning an error aborts the write.
pub type BlobResolver<'a> = dyn FnMut(&ManifestItem) -> Result<BlobResolution> + 'a;

/// Write capability of a container codec.
pub trait StreamWrite {
    /// Write `manifest.json` first, then one entry per item whose blob
    /// resolves, in item order.
    fn stream_write(
        &self,
        out: &mut dyn Write,
        manifest_json: &[u8],
        manifest_time: DateTime<Utc>,
        items: &[ManifestItem],
        resolve: &mut BlobResolver<'_>,
    ) -> Result<Vec<EntryOutcome>>;
}

/// Extract capability of a container codec.
pub trait StreamExtract {
    /// Extract into `dest`, which the caller owns and cleans up. A manifest
    /// entry longer than `manifest_limit` bytes aborts the extraction.
    fn stream_extract(&self, input: &Path, dest: &Path, manifest_limit: u64) -> Result<Extraction>;
}

impl StreamWrite for ContainerCodec {
    fn stream_write(
        &self,
        out: &mut dyn Write,
        manifest_json: &[u8],
        manifest_time: DateTime<Utc>,
        items: &[ManifestItem],
        resolve: &mut BlobResolver<'_>,
    ) -> Result<Vec<EntryOutcome>> {
        match self {
            ContainerCodec::Tar(compression) => {
                tar_codec::write(*compression, out, manifest_json, manifest_time, items, resolve)
            }
            ContainerCodec::Zip => zip_codec::write(out, manifest_json, manifest_time, items, resolve),
        }
    }
}

impl StreamExtract for ContainerCodec {
    fn stream_extract(&self, input: &Path, dest: &Path, manifest_limit: u64) -> Result<Extraction> {
        match self {
            ContainerCodec::Tar(compression) => tar_codec::extract(*compression, input, dest, manifest_limit),
            ContainerCodec::Zip => zip_codec::extract(input, dest, manifest_limit),
        }
    }
}

/// Destination for archive entries, implemented by each container.
pub(crate) trait EntrySink {
    fn append(
        &mut self,
        name: &str,
        size: u64,
        mod_time: DateTime<Utc>,
        data: &mut dyn Read,
    ) -> Result<()>;
}

/// Shared write loop: manifest first, then items in stored order.
pub(crate) fn write_entries(
    sink: &mut dyn EntrySink,
    manifest_json: &[u8],
    manifest_time: DateTime<Utc>,
    items: &[ManifestItem],
    resolve: &mut BlobResolver<'_>,
) -> Result<Vec<EntryOutcome>> {
    let mut manifest_reader = manifest_json;
    sink.append(
        crate::manifest::MANIFEST_FILE_NAME,
        manifest_json.len() as u64,
        manifest_time,
        &mut manifest_reader,
    )?;

    let mut outcomes = Vec::with_capacity(items.len());
    for item in items {
        let result = match resolve(item)? {
            BlobResolution::Skip(reason) => EntryResult::Skipped(reason),
            BlobResolution::Ready(mut source) => {
                let mut limited = (&mut source.reader).take(source.size);
                sink.append(&item.archive_path, source.size, source.mod_time, &mut limited)?;
                EntryResult::Written { bytes: source.size }
            }
        };
        outcomes.push(EntryOutcome {
            hash: item.hash.clone(),
            archive_path: item.archive_path.clone(),
            result,
        });
    }
    Ok(outcomes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_filename_prefers_specific_suffix() {
        assert_eq!(
            ArchiveFormat::from_filename("seedvault-backup_instance-1_manual_2025.tar.gz").unwrap(),
            ArchiveFormat::Container(ContainerCodec::Tar(Compression::Gzip))
        );
        assert_eq!(
            ArchiveFormat::from_filename("BACKUP.TGZ").unwrap(),
            ArchiveFormat::Container(ContainerCodec::Tar(Compression::Gzip))
        );
        assert_eq!(
            ArchiveFormat::from_filename("a.tar").unwrap(),
            ArchiveFormat::Container(ContainerCodec::Tar(Compression::None))
        );
        assert_eq!(
            ArchiveFormat::from_filename("a.tar.xz").unwrap(),
            ArchiveFormat::Container(ContainerCodec::Tar(Compression::Xz))
        );
        assert_eq!(ArchiveFormat::from_filename("manifest.json").unwrap(), ArchiveFormat::ManifestOnly);
        assert!(matches!(
            ArchiveFormat::from_filename("backup.rar"),
            Err(BackupError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_names_round_trip() {
        for format in ArchiveFormat::all() {
            assert_eq!(ArchiveFormat::from_name(format.name()).unwrap(), format);
        }
        assert_eq!(ArchiveFormat::all().count(), 7);
        assert_eq!(
            ArchiveFormat::from_name("tgz").unwrap(),
            ArchiveFormat::Container(ContainerCodec::Tar(Compression::Gzip))
        );
        assert!(ArchiveFormat::from_name("7z").is_err());
    }
}
