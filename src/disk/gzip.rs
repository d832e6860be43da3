//! Gzip Disk
//!
//! Wraps another disk and gzip-compresses binary payloads on the way in,
//! decompressing them on the way out. Every other mode passes straight
//! through to the wrapped disk.

use std::io::{Cursor, Read, Write};
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::debug;

use crate::config::DiskOptions;
use crate::disk::{Disk, Fetched, FileDisk, Source, StoreMode, Stored, Value};
use crate::error::{CacheError, Result};

/// Bytes handed to the encoder or pulled from the decoder per call (1 GiB).
///
/// Some zlib bindings reject single buffers of 2-4 GiB or more.
pub const CHUNK_SIZE: usize = 1 << 30;

// == Compression ==
/// Gzip-compresses `data` at the fastest level.
pub fn compress(data: &[u8]) -> Result<Vec<u8>> {
    compress_chunked(data, CHUNK_SIZE)
}

/// Decompresses a gzip stream produced by [`compress`].
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    decompress_chunked(data, CHUNK_SIZE)
}

fn compress_chunked(data: &[u8], chunk_size: usize) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
    for chunk in data.chunks(chunk_size) {
        encoder.write_all(chunk).map_err(CacheError::Compression)?;
    }
    encoder.finish().map_err(CacheError::Compression)
}

fn decompress_chunked(data: &[u8], chunk_size: usize) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut output = Vec::new();
    loop {
        let read = (&mut decoder)
            .take(chunk_size as u64)
            .read_to_end(&mut output)
            .map_err(CacheError::Compression)?;
        if read == 0 {
            break;
        }
    }
    Ok(output)
}

// == Gzip Disk ==
/// Disk that compresses `Binary` payloads and delegates storage to `D`.
#[derive(Debug, Clone)]
pub struct GzipDisk<D = FileDisk> {
    inner: D,
}

impl<D: Disk> GzipDisk<D> {
    /// Wraps an already opened disk.
    pub fn new(inner: D) -> Self {
        Self { inner }
    }

    /// The wrapped disk.
    pub fn inner(&self) -> &D {
        &self.inner
    }
}

impl<D: Disk> Disk for GzipDisk<D> {
    fn open(directory: &Path, options: &DiskOptions) -> Self {
        Self::new(D::open(directory, options))
    }

    fn store(&self, source: Source<'_>, key: &str) -> Result<Stored> {
        let bytes = match source {
            Source::Reader(reader) => {
                let mut buf = Vec::new();
                reader.read_to_end(&mut buf)?;
                buf
            }
            Source::Value(Value::Bytes(bytes)) => bytes,
            other => return self.inner.store(other, key),
        };

        let compressed = compress(&bytes)?;
        debug!(
            original = bytes.len(),
            compressed = compressed.len(),
            "Compressed binary payload"
        );
        drop(bytes);

        self.inner.store(Source::Value(Value::Bytes(compressed)), key)
    }

    fn fetch(
        &self,
        mode: StoreMode,
        filename: Option<&str>,
        inline: Option<&[u8]>,
        read: bool,
    ) -> Result<Fetched> {
        let fetched = self.inner.fetch(mode, filename, inline, read)?;
        if mode != StoreMode::Binary {
            return Ok(fetched);
        }

        let compressed = match fetched.into_value()? {
            Value::Bytes(bytes) => bytes,
            other => return Ok(Fetched::Value(other)),
        };
        let bytes = decompress(&compressed)?;

        if read {
            Ok(Fetched::Reader(Box::new(Cursor::new(bytes))))
        } else {
            Ok(Fetched::Value(Value::Bytes(bytes)))
        }
    }

    fn remove(&self, filename: &str) -> Result<()> {
        self.inner.remove(filename)
    }

    fn files(&self) -> Result<Vec<String>> {
        self.inner.files()
    }
}
