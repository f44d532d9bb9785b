//! Stream a successful run out as an archive.

use crate::archive::writer::{self, ExportReport, RunMetadata};
use crate::archive::ArchiveFormat;
use crate::error::Result;
use crate::models::backup_run::BackupRun;
use crate::services::run_lifecycle::{get_run, load_manifest};
use crate::state::AppState;
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::io::SyncIoBridge;
use tokio_util::sync::CancellationToken;

/// Download name for an export of `run`.
pub fn archive_filename(state: &AppState, run: &BackupRun, format: ArchiveFormat) -> String {
    writer::archive_filename(&state.config.product, &RunMetadata::from(run), format)
}

/// Write an export of `run_id` to `out`, returning the writer once the
/// archive is complete.
///
/// Nothing is written when the run has no readable manifest. Codecs run on
/// the blocking pool; `out` is driven through a sync bridge.
pub async fn export_run<W>(
    state: &Arc<AppState>,
    run_id: i64,
    format: ArchiveFormat,
    out: W,
    cancel: CancellationToken,
) -> Result<(W, ExportReport)>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let run = get_run(state, run_id).await?;
    let manifest = load_manifest(state, run_id).await?;
    let meta = RunMetadata::from(&run);
    let product = state.config.product.clone();
    let data_dir = state.config.data_dir.clone();

    let mut bridge = SyncIoBridge::new(out);
    let (bridge, report) = tokio::task::spawn_blocking(move || {
        let report = writer::write_archive(
            &mut bridge,
            &manifest,
            &meta,
            format,
            &product,
            &data_dir,
            &cancel,
        )?;
        bridge.flush()?;
        Ok::<_, crate::error::BackupError>((bridge, report))
    })
    .await??;

    let mut out = bridge.into_inner();
    out.shutdown().await?;

    for loss in report.blob_losses() {
        tracing::warn!(run_id, error = %loss, "Export is missing a blob");
    }
    Ok((out, report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::reader::extract_to_temp;
    use crate::archive::{Compression, ContainerCodec};
    use crate::error::BackupError;
    use crate::instance::fake::FakeInstance;
    use crate::services::test_support::{state_with, succeed_run};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_export_every_format() {
        let dir = TempDir::new().unwrap();
        let state = state_with(dir.path(), FakeInstance::new());
        let run = succeed_run(&state, 3, &[("aa11", Some(b"blob-a".as_slice())), ("bb22", None)]).await;

        for format in ArchiveFormat::all() {
            let (bytes, report) = export_run(&state, run.id, format, Vec::new(), CancellationToken::new())
                .await
                .unwrap();
            assert!(report.file_name.starts_with("seedvault-backup_instance-3_manual_"));
            assert!(report.file_name.ends_with(&format!(".{}", format.extension())));

            let Some(_) = format.codec() else {
                assert_eq!(bytes, load_manifest(&state, run.id).await.unwrap().to_json().unwrap());
                continue;
            };
            assert_eq!(report.written(), 1, "{format}");
            let path = dir.path().join(&report.file_name);
            std::fs::write(&path, &bytes).unwrap();
            let extracted = extract_to_temp(format, &path, dir.path()).unwrap();
            assert_eq!(extracted.extraction.blobs.len(), 1, "{format}");
            assert!(extracted.extraction.blobs.contains_key("aa11"));
        }
    }

    #[tokio::test]
    async fn test_export_requires_successful_run() {
        let dir = TempDir::new().unwrap();
        let state = state_with(dir.path(), FakeInstance::new());
        let run = crate::services::run_lifecycle::queue_run(
            &state,
            1,
            crate::models::backup_run::RunKind::Manual,
            "alice",
        )
        .await
        .unwrap();
        let result = export_run(
            &state,
            run.id,
            ArchiveFormat::Container(ContainerCodec::Tar(Compression::Gzip)),
            Vec::new(),
            CancellationToken::new(),
        )
        .await;
        assert!(matches!(result, Err(BackupError::InvalidRunStatus { .. })));
    }
}
