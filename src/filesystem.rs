//! Filesystem-backed collaborators, usable as-is or as references for real ones.
//!
//! [FilesystemFetcher] treats identifiers as paths under a source directory, [CopyTransformer] "scales" by copying,
//! and [BytesDecoder] reads the artifact into a pooled byte buffer.  The first two stream through fixed-size copy
//! buffers borrowed from a [BlockingPool], and write through a temporary file that is renamed into place.
use std::fs::File;
use std::io::{Error, ErrorKind, Read, Result, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::*;

/// Default copy buffer count and size: one per default worker, 8 KiB each.
pub const DEFAULT_COPY_BUFFERS: usize = 8;
pub const DEFAULT_COPY_BUFFER_SIZE: usize = 8192;

pub type CopyBuffers = Arc<BlockingPool<Vec<u8>>>;

pub fn copy_buffer_pool(capacity: usize, buffer_size: usize) -> CopyBuffers {
    Arc::new(BlockingPool::new(capacity, move || vec![0u8; buffer_size]))
}

/// Stream `reader` into a temporary file beside `destination`, then atomically rename it into place.
fn copy_into_place(buffers: &BlockingPool<Vec<u8>>, mut reader: impl Read, destination: &Path) -> Result<()> {
    let dir = destination
        .parent()
        .ok_or_else(|| Error::new(ErrorKind::InvalidInput, "destination has no parent directory"))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;

    let mut buffer = buffers.acquire();
    let copied = (|| -> Result<()> {
        let buf = buffer.get_mut();
        loop {
            let n = match reader.read(buf) {
                Ok(0) => return Ok(()),
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            tmp.write_all(&buf[..n])?;
        }
    })();
    buffers
        .release(buffer)
        .map_err(|e| Error::new(ErrorKind::Other, e))?;
    copied?;

    tmp.as_file().sync_all()?;
    tmp.persist(destination).map_err(|e| e.error)?;
    Ok(())
}

/// Fetches identifiers like `/b/c` from under a source directory.
///
/// This handles the rather tricky path cases around Windows and Linux differences.  Additionally, it makes a best
/// effort to disallow relative paths that escape the source directory.
#[derive(Debug)]
pub struct FilesystemFetcher {
    source_root: PathBuf,
    buffers: CopyBuffers,
}

impl FilesystemFetcher {
    pub fn new(source_root: &Path, buffers: CopyBuffers) -> FilesystemFetcher {
        FilesystemFetcher {
            source_root: source_root.to_path_buf(),
            buffers,
        }
    }

    /// Resolve an identifier to the file it names, refusing anything outside the source root.
    pub fn open_source(&self, identifier: &str) -> Result<File> {
        // Canonicalize can't be trusted with relative segments in the middle of a path on Windows.  Go via
        // `RelativePath` to clean it up; a leading `/` is relative to the source root.
        let absolute = relative_path::RelativePath::new(identifier).to_logical_path(&self.source_root);
        if !absolute.starts_with(&self.source_root) {
            return Err(Error::new(
                ErrorKind::Other,
                "path is outside the source root directory",
            ));
        }
        File::open(absolute)
    }
}

impl Fetcher for FilesystemFetcher {
    type Error = Error;

    fn fetch(&self, identifier: &str, destination: &Path) -> Result<()> {
        let source = self.open_source(identifier)?;
        copy_into_place(&self.buffers, source, destination)
    }
}

/// A transform that ignores the target size and copies the raw artifact.
#[derive(Debug)]
pub struct CopyTransformer {
    buffers: CopyBuffers,
}

impl CopyTransformer {
    pub fn new(buffers: CopyBuffers) -> CopyTransformer {
        CopyTransformer { buffers }
    }
}

impl Transformer for CopyTransformer {
    type Error = Error;

    fn transform(&self, raw: &Path, _size: Size, destination: &Path) -> Result<()> {
        copy_into_place(&self.buffers, File::open(raw)?, destination)
    }
}

/// Reads an artifact's bytes into the pooled buffer and reports how many there were.
#[derive(Debug, Default)]
pub struct BytesDecoder {
    /// Initial buffer capacity.
    pub capacity_hint: usize,
}

impl Decoder for BytesDecoder {
    type Buffer = Vec<u8>;
    type Output = usize;
    type Error = Error;

    fn new_buffer(&self) -> Vec<u8> {
        Vec::with_capacity(self.capacity_hint)
    }

    fn decode(&self, path: &Path, buffer: &mut Vec<u8>) -> Result<usize> {
        buffer.clear();
        File::open(path)?.read_to_end(buffer)?;
        if buffer.is_empty() {
            return Err(Error::new(ErrorKind::UnexpectedEof, "artifact is empty"));
        }
        Ok(buffer.len())
    }
}
