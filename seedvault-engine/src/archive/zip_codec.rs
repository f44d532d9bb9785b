//! Zip container.
//!
//! The zip central directory needs a seekable sink, so entries are written
//! to an anonymous temporary file and copied to the output once complete.
//! Extraction reads the spooled upload with random access.

use super::reader::Extractor;
use super::{write_entries, BlobResolver, EntryOutcome, EntrySink};
use crate::error::Result;
use crate::manifest::ManifestItem;
use chrono::{DateTime, Datelike, Timelike, Utc};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

fn zip_err(e: zip::result::ZipError) -> io::Error {
    io::Error::other(e)
}

/// Zip timestamps cover 1980..=2107 at two-second resolution.
fn zip_time(t: DateTime<Utc>) -> zip::DateTime {
    zip::DateTime::from_date_and_time(
        t.year().clamp(1980, 2107) as u16,
        t.month() as u8,
        t.day() as u8,
        t.hour() as u8,
        t.minute() as u8,
        t.second() as u8,
    )
    .unwrap_or_default()
}

struct ZipSink<W: Write + Seek> {
    writer: ZipWriter<W>,
}

impl<W: Write + Seek> EntrySink for ZipSink<W> {
    fn append(
        &mut self,
        name: &str,
        size: u64,
        mod_time: DateTime<Utc>,
        data: &mut dyn Read,
    ) -> Result<()> {
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .last_modified_time(zip_time(mod_time))
            .unix_permissions(0o644)
            .large_file(size >= u32::MAX as u64);
        self.writer.start_file(name, options).map_err(zip_err)?;
        let copied = io::copy(data, &mut self.writer)?;
        if copied != size {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("{name}: expected {size} bytes, read {copied}"),
            )
            .into());
        }
        Ok(())
    }
}

pub(crate) fn write(
    out: &mut dyn Write,
    manifest_json: &[u8],
    manifest_time: DateTime<Utc>,
    items: &[ManifestItem],
    resolve: &mut BlobResolver<'_>,
) -> Result<Vec<EntryOutcome>> {
    let spool = tempfile::tempfile()?;
    let mut sink = ZipSink { writer: ZipWriter::new(spool) };
    let outcomes = write_entries(&mut sink, manifest_json, manifest_time, items, resolve)?;

    let mut spool = sink.writer.finish().map_err(zip_err)?;
    spool.seek(SeekFrom::Start(0))?;
    io::copy(&mut spool, out)?;
    out.flush()?;
    Ok(outcomes)
}

pub(crate) fn extract(input: &Path, dest: &Path, manifest_limit: u64) -> Result<super::Extraction> {
    let file = File::open(input)?;
    let mut archive = ZipArchive::new(file).map_err(zip_err)?;
    let mut extractor = Extractor::new(dest, manifest_limit)?;

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index).map_err(zip_err)?;
        let name = entry.name().to_string();
        let is_file = !entry.is_dir();
        extractor.accept(&name, is_file, &mut entry)?;
    }

    extractor.finish()
}
