//! Uploaded archive intake: spool, pick the codec by filename, extract.

use super::reader::{Extraction, SkippedEntry};
use super::{ArchiveFormat, StreamExtract};
use crate::error::{BackupError, Result};
use bytes::Bytes;
use futures_util::{pin_mut, Stream, StreamExt};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;

/// Manifest bytes plus the blobs recovered from an upload.
///
/// Blob paths point into `workdir`, which is removed when this value drops;
/// callers copy what they keep before letting it go.
#[derive(Debug)]
pub struct ImportedArchive {
    pub format: ArchiveFormat,
    pub manifest: Vec<u8>,
    /// Lower-case torrent hash to extracted `.torrent` file.
    pub blobs: HashMap<String, PathBuf>,
    pub skipped: Vec<SkippedEntry>,
    workdir: Option<TempDir>,
}

impl ImportedArchive {
    pub fn workdir(&self) -> Option<&Path> {
        self.workdir.as_ref().map(|d| d.path())
    }
}

async fn read_bounded<S>(stream: S, limit: u64) -> Result<Vec<u8>>
where
    S: Stream<Item = io::Result<Bytes>>,
{
    pin_mut!(stream);
    let mut buf = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if buf.len() as u64 + chunk.len() as u64 > limit {
            return Err(BackupError::UploadTooLarge { limit });
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf)
}

/// Read an uploaded archive named `filename` from `stream`.
///
/// Manifest-only uploads are read into memory up to `max_manifest_bytes`.
/// Containers are spooled to a file under a fresh directory in `scratch`
/// and extracted next to it; the directory is removed on every error path.
pub async fn read_upload<S>(
    stream: S,
    filename: &str,
    max_manifest_bytes: u64,
    scratch: &Path,
) -> Result<ImportedArchive>
where
    S: Stream<Item = io::Result<Bytes>>,
{
    let format = ArchiveFormat::from_filename(filename)?;

    let Some(codec) = format.codec() else {
        let manifest = read_bounded(stream, max_manifest_bytes).await?;
        tracing::info!(filename, bytes = manifest.len(), "Read manifest-only upload");
        return Ok(ImportedArchive {
            format,
            manifest,
            blobs: HashMap::new(),
            skipped: Vec::new(),
            workdir: None,
        });
    };

    tokio::fs::create_dir_all(scratch).await?;
    let workdir = tempfile::Builder::new().prefix("import-").tempdir_in(scratch)?;
    let spool_path = workdir.path().join(format!("upload.{}", format.extension()));

    let mut spool = tokio::fs::File::create(&spool_path).await?;
    let mut spooled: u64 = 0;
    pin_mut!(stream);
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        spooled += chunk.len() as u64;
        spool.write_all(&chunk).await?;
    }
    spool.flush().await?;
    drop(spool);
    tracing::debug!(filename, bytes = spooled, "Upload spooled");

    // The blocking task owns the directory so it outlives a dropped caller.
    let (workdir, extraction) = tokio::task::spawn_blocking(move || {
        let dest = workdir.path().join("extract");
        std::fs::create_dir_all(&dest)?;
        let extraction: Result<Extraction> = codec.stream_extract(&spool_path, &dest, max_manifest_bytes);
        let _ = std::fs::remove_file(&spool_path);
        Ok::<_, BackupError>((workdir, extraction?))
    })
    .await??;

    // Bounded during extraction.
    let manifest = tokio::fs::read(&extraction.manifest_path).await?;

    tracing::info!(
        filename,
        format = %format,
        blobs = extraction.blobs.len(),
        skipped = extraction.skipped.len(),
        "Extracted uploaded archive"
    );
    Ok(ImportedArchive {
        format,
        manifest,
        blobs: extraction.blobs,
        skipped: extraction.skipped,
        workdir: Some(workdir),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::writer::{write_archive, RunMetadata};
    use crate::archive::{Compression, ContainerCodec};
    use crate::manifest::{sample_item, Manifest};
    use crate::models::backup_run::RunKind;
    use chrono::Utc;
    use futures_util::stream;
    use tokio_util::sync::CancellationToken;

    fn chunks(data: Vec<u8>) -> impl Stream<Item = io::Result<Bytes>> {
        let parts: Vec<io::Result<Bytes>> = data
            .chunks(7)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        stream::iter(parts)
    }

    fn sample_manifest() -> Manifest {
        let mut m = Manifest::new(2, RunKind::Manual, Utc::now());
        m.push_item(sample_item("hash1", None));
        m.push_item(sample_item("hash2", Some("torrents/ha/hash2.torrent")));
        m
    }

    #[tokio::test]
    async fn test_manifest_only_upload() {
        let scratch = TempDir::new().unwrap();
        let json = sample_manifest().to_json().unwrap();
        let imported = read_upload(chunks(json.clone()), "snap.json", 1 << 20, scratch.path())
            .await
            .unwrap();
        assert_eq!(imported.manifest, json);
        assert!(imported.blobs.is_empty());
        assert!(imported.workdir().is_none());
    }

    #[tokio::test]
    async fn test_manifest_only_upload_is_bounded() {
        let scratch = TempDir::new().unwrap();
        let json = sample_manifest().to_json().unwrap();
        let result = read_upload(chunks(json), "snap.json", 16, scratch.path()).await;
        assert!(matches!(result, Err(BackupError::UploadTooLarge { limit: 16 })));
    }

    #[tokio::test]
    async fn test_container_upload_and_cleanup() {
        let root = TempDir::new().unwrap();
        std::fs::create_dir_all(root.path().join("torrents/ha")).unwrap();
        std::fs::write(root.path().join("torrents/ha/hash2.torrent"), b"d4:infoe").unwrap();

        let manifest = sample_manifest();
        let meta = RunMetadata {
            run_id: 1,
            instance_id: 2,
            kind: RunKind::Manual,
            requested_at: manifest.generated_at,
        };
        let mut archive = Vec::new();
        write_archive(
            &mut archive,
            &manifest,
            &meta,
            ArchiveFormat::Container(ContainerCodec::Tar(Compression::Xz)),
            "seedvault",
            root.path(),
            &CancellationToken::new(),
        )
        .unwrap();

        let scratch = root.path().join("scratch");
        let imported = read_upload(chunks(archive), "upload.tar.xz", 1 << 20, &scratch)
            .await
            .unwrap();
        assert_eq!(imported.manifest, manifest.to_json().unwrap());
        assert_eq!(imported.blobs.len(), 1);
        let workdir = imported.workdir().unwrap().to_path_buf();
        assert!(!workdir.join("upload.tar.xz").exists());
        drop(imported);
        assert!(!workdir.exists());
    }

    #[tokio::test]
    async fn test_upload_without_manifest_leaves_nothing() {
        let scratch = TempDir::new().unwrap();
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(3);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, "torrents/x.torrent", &b"abc"[..]).unwrap();
        let data = builder.into_inner().unwrap();

        let result = read_upload(chunks(data), "x.tar", 1 << 20, scratch.path()).await;
        assert!(matches!(result, Err(BackupError::ManifestMissing)));
        assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_oversized_manifest_in_container_rejected() {
        let scratch = TempDir::new().unwrap();
        let json = sample_manifest().to_json().unwrap();
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(json.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, "manifest.json", json.as_slice()).unwrap();
        let data = builder.into_inner().unwrap();

        let result = read_upload(chunks(data), "big.tar", 16, scratch.path()).await;
        assert!(matches!(result, Err(BackupError::UploadTooLarge { limit: 16 })));
        assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_suffix_rejected() {
        let scratch = TempDir::new().unwrap();
        let result = read_upload(chunks(vec![1, 2, 3]), "x.rar", 1 << 20, scratch.path()).await;
        assert!(matches!(result, Err(BackupError::UnsupportedFormat(_))));
    }
}
