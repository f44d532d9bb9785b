//! Export a run's manifest and blobs as one archive.

use super::{
    ArchiveFormat, BlobResolution, BlobSource, EntryOutcome, EntryResult, SkipReason, StreamWrite,
};
use crate::error::{BackupError, Result};
use crate::manifest::{Manifest, ManifestItem};
use crate::models::backup_run::{BackupRun, RunKind};
use crate::utils::safe_path;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::File;
use std::io::{BufReader, Write};
use std::path::Path;
use tokio_util::sync::CancellationToken;

/// The parts of a run that shape an export.
#[derive(Debug, Clone)]
pub struct RunMetadata {
    pub run_id: i64,
    pub instance_id: i64,
    pub kind: RunKind,
    pub requested_at: DateTime<Utc>,
}

impl From<&BackupRun> for RunMetadata {
    fn from(run: &BackupRun) -> Self {
        Self {
            run_id: run.id,
            instance_id: run.instance_id,
            kind: run.kind,
            requested_at: run.requested_at,
        }
    }
}

/// `<product>-backup_instance-<id>_<kind>_<YYYY-MM-DD_HH-MM-SS>.<ext>`
pub fn archive_filename(product: &str, meta: &RunMetadata, format: ArchiveFormat) -> String {
    format!(
        "{}-backup_instance-{}_{}_{}.{}",
        product,
        meta.instance_id,
        meta.kind,
        meta.requested_at.format("%Y-%m-%d_%H-%M-%S"),
        format.extension()
    )
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportReport {
    pub file_name: String,
    pub format: String,
    pub outcomes: Vec<EntryOutcome>,
}

impl ExportReport {
    pub fn written(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.result, EntryResult::Written { .. }))
            .count()
    }

    pub fn skipped(&self) -> impl Iterator<Item = (&EntryOutcome, &SkipReason)> {
        self.outcomes.iter().filter_map(|o| match &o.result {
            EntryResult::Skipped(reason) => Some((o, reason)),
            EntryResult::Written { .. } => None,
        })
    }

    /// Items that referenced a blob which could not be read.
    pub fn blob_losses(&self) -> Vec<BackupError> {
        self.skipped()
            .filter_map(|(o, reason)| match reason {
                SkipReason::Missing(detail) | SkipReason::Unsafe(detail) => {
                    Some(BackupError::PartialBlobLoss {
                        hash: o.hash.clone(),
                        reason: detail.clone(),
                    })
                }
                _ => None,
            })
            .collect()
    }
}

fn open_blob(blob_root: &Path, item: &ManifestItem, mod_time: DateTime<Utc>) -> BlobResolution {
    let Some(rel) = item.blob() else {
        return BlobResolution::Skip(SkipReason::NoBlob);
    };
    let path = match safe_path::resolve_within(blob_root, rel) {
        Ok(path) => path,
        Err(e) => {
            tracing::warn!(hash = %item.hash, blob = %rel, error = %e, "Rejected blob reference");
            return BlobResolution::Skip(SkipReason::Unsafe(e.to_string()));
        }
    };
    let opened = File::open(&path).and_then(|f| {
        let size = f.metadata()?.len();
        Ok((f, size))
    });
    match opened {
        Ok((file, size)) => BlobResolution::Ready(BlobSource {
            reader: Box::new(BufReader::new(file)),
            size,
            mod_time,
        }),
        Err(e) => {
            tracing::warn!(hash = %item.hash, path = %path.display(), error = %e, "Blob missing, skipping");
            BlobResolution::Skip(SkipReason::Missing(e.to_string()))
        }
    }
}

/// Write `manifest` and its blobs to `out` in `format`.
///
/// The manifest is serialized before anything is written, so a bad manifest
/// fails with nothing committed. Missing or rejected blobs are skipped and
/// reported; write errors on `out` abort the export.
pub fn write_archive(
    out: &mut dyn Write,
    manifest: &Manifest,
    meta: &RunMetadata,
    format: ArchiveFormat,
    product: &str,
    blob_root: &Path,
    cancel: &CancellationToken,
) -> Result<ExportReport> {
    let manifest_json = manifest.to_json()?;
    let file_name = archive_filename(product, meta, format);

    let outcomes = match format.codec() {
        None => {
            out.write_all(&manifest_json)?;
            out.flush()?;
            Vec::new()
        }
        Some(codec) => {
            let entry_time = meta.requested_at;
            let mut resolve = |item: &ManifestItem| -> Result<BlobResolution> {
                if cancel.is_cancelled() {
                    return Err(BackupError::Canceled);
                }
                Ok(open_blob(blob_root, item, entry_time))
            };
            codec.stream_write(out, &manifest_json, entry_time, &manifest.items, &mut resolve)?
        }
    };

    let report = ExportReport {
        file_name,
        format: format.name().to_string(),
        outcomes,
    };
    tracing::info!(
        run_id = meta.run_id,
        format = %format,
        written = report.written(),
        skipped = report.skipped().count(),
        "Archive written"
    );
    Ok(report)
}
