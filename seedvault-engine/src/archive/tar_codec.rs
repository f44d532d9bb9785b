//! Tar container, optionally wrapped in a streaming compressor.

use super::reader::Extractor;
use super::{write_entries, BlobResolver, Compression, EntryOutcome, EntrySink};
use crate::error::Result;
use crate::manifest::ManifestItem;
use chrono::{DateTime, Utc};
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;
use tar::{Archive, Builder, EntryType, Header};

const ZSTD_LEVEL: i32 = 3;
const XZ_PRESET: u32 = 6;
const BROTLI_QUALITY: u32 = 9;
const BROTLI_WINDOW: u32 = 22;
const BROTLI_BUFFER: usize = 64 * 1024;

struct TarSink<W: Write> {
    builder: Builder<W>,
}

impl<W: Write> EntrySink for TarSink<W> {
    fn append(
        &mut self,
        name: &str,
        size: u64,
        mod_time: DateTime<Utc>,
        data: &mut dyn Read,
    ) -> Result<()> {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_size(size);
        header.set_mode(0o644);
        header.set_mtime(mod_time.timestamp().max(0) as u64);
        let mut counted = CountingReader { inner: data, read: 0 };
        self.builder.append_data(&mut header, name, &mut counted)?;
        if counted.read != size {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("{name}: expected {size} bytes, read {}", counted.read),
            )
            .into());
        }
        Ok(())
    }
}

struct CountingReader<'a> {
    inner: &'a mut dyn Read,
    read: u64,
}

impl Read for CountingReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.read += n as u64;
        Ok(n)
    }
}

fn write_tar<W: Write>(
    out: W,
    manifest_json: &[u8],
    manifest_time: DateTime<Utc>,
    items: &[ManifestItem],
    resolve: &mut BlobResolver<'_>,
) -> Result<(W, Vec<EntryOutcome>)> {
    let mut sink = TarSink { builder: Builder::new(out) };
    let outcomes = write_entries(&mut sink, manifest_json, manifest_time, items, resolve)?;
    let inner = sink.builder.into_inner()?;
    Ok((inner, outcomes))
}

pub(crate) fn write(
    compression: Compression,
    out: &mut dyn Write,
    manifest_json: &[u8],
    manifest_time: DateTime<Utc>,
    items: &[ManifestItem],
    resolve: &mut BlobResolver<'_>,
) -> Result<Vec<EntryOutcome>> {
    let outcomes = match compression {
        Compression::None => {
            let (out, outcomes) = write_tar(out, manifest_json, manifest_time, items, resolve)?;
            out.flush()?;
            outcomes
        }
        Compression::Gzip => {
            let encoder = flate2::write::GzEncoder::new(out, flate2::Compression::default());
            let (encoder, outcomes) = write_tar(encoder, manifest_json, manifest_time, items, resolve)?;
            encoder.finish()?.flush()?;
            outcomes
        }
        Compression::Zstd => {
            let encoder = zstd::stream::write::Encoder::new(out, ZSTD_LEVEL)?;
            let (encoder, outcomes) = write_tar(encoder, manifest_json, manifest_time, items, resolve)?;
            encoder.finish()?.flush()?;
            outcomes
        }
        Compression::Brotli => {
            let encoder =
                brotli::CompressorWriter::new(out, BROTLI_BUFFER, BROTLI_QUALITY, BROTLI_WINDOW);
            let (encoder, outcomes) = write_tar(encoder, manifest_json, manifest_time, items, resolve)?;
            // into_inner finalises the brotli stream.
            encoder.into_inner().flush()?;
            outcomes
        }
        Compression::Xz => {
            let encoder = xz2::write::XzEncoder::new(out, XZ_PRESET);
            let (encoder, outcomes) = write_tar(encoder, manifest_json, manifest_time, items, resolve)?;
            encoder.finish()?.flush()?;
            outcomes
        }
    };
    Ok(outcomes)
}

fn decoder(compression: Compression, file: File) -> Result<Box<dyn Read>> {
    let input = BufReader::new(file);
    Ok(match compression {
        Compression::None => Box::new(input),
        Compression::Gzip => Box::new(flate2::read::GzDecoder::new(input)),
        Compression::Zstd => Box::new(zstd::stream::read::Decoder::with_buffer(input)?),
        Compression::Brotli => Box::new(brotli::Decompressor::new(input, BROTLI_BUFFER)),
        Compression::Xz => Box::new(xz2::read::XzDecoder::new(input)),
    })
}

pub(crate) fn extract(
    compression: Compression,
    input: &Path,
    dest: &Path,
    manifest_limit: u64,
) -> Result<super::Extraction> {
    let file = File::open(input)?;
    let mut archive = Archive::new(decoder(compression, file)?);
    let mut extractor = Extractor::new(dest, manifest_limit)?;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        let is_file = matches!(
            entry.header().entry_type(),
            EntryType::Regular | EntryType::Continuous
        );
        extractor.accept(&name, is_file, &mut entry)?;
    }

    extractor.finish()
}
