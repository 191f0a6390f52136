//! Collaborators the pipeline drives, and the listener it reports to.
//!
//! A [Fetcher] puts the raw artifact for an identifier on disk, a [Transformer] derives the scaled artifact from it,
//! and a [Decoder] turns an artifact into an in-memory value using a pooled buffer.
use std::path::Path;
use std::sync::Arc;

use crate::Size;

/// Retrieves a remote resource by identifier.
pub trait Fetcher: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Write the resource to `destination`.
    ///
    /// Implementations should write somewhere temporary and rename into place, so that a failed or interrupted fetch
    /// never leaves a partial artifact behind and retrying is always safe.
    fn fetch(&self, identifier: &str, destination: &Path) -> Result<(), Self::Error>;
}

/// Produces a scaled artifact from a raw one.
pub trait Transformer: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    fn transform(&self, raw: &Path, size: Size, destination: &Path) -> Result<(), Self::Error>;
}

/// A `Decoder` knows how to get from an artifact on disk to a decoded representation in memory.
pub trait Decoder: Send + Sync + 'static {
    /// Reusable scratch memory, usually the destination pixels.
    type Buffer: Send + 'static;
    type Output: Send + Sync + 'static;
    type Error: std::error::Error + Send + Sync + 'static;

    /// Make a fresh buffer for the pool.
    fn new_buffer(&self) -> Self::Buffer;

    /// Decode `path`, possibly writing into `buffer` in place.
    fn decode(&self, path: &Path, buffer: &mut Self::Buffer) -> Result<Self::Output, Self::Error>;
}

/// Told exactly once per request how the load turned out.
pub trait BucketListener<R>: Send + Sync {
    fn on_loaded(&self, identifier: &str, resource: &Arc<R>, width: u32, height: u32);

    fn on_failure(&self, identifier: &str, width: u32, height: u32);
}

pub type SharedListener<R> = Arc<dyn BucketListener<R>>;
