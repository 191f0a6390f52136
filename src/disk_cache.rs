//! The [DiskCache] resolves a key to a decoded [Resource] through two tiers of on-disk artifacts.
//!
//! For a scaled key, resolution goes:
//!
//! - If the scaled artifact exists, decode it.
//! - Otherwise, fetch the raw artifact unless it is already on disk.
//! - Transform the raw artifact into the scaled one, then decode that.
//!
//! Raw keys skip the transform and decode the raw artifact directly.  The raw artifact is fetched once per identifier
//! and reused for every size requested afterwards.  Nothing here touches the memory cache or any listener; the only
//! shared state is the disk and the buffer pool.
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use xxhash_rust::xxh64::xxh64;

use crate::error::panic_message;
use crate::*;

/// Maps keys to artifact paths under a cache root.
///
/// Raw artifacts are `<hash>.<ext>` and scaled ones `<width>-<height>-<hash>.<ext>`, where `<hash>` is the xxh64 of the
/// identifier so paths are stable across runs.
#[derive(Clone, Debug)]
pub struct ArtifactLayout {
    root: PathBuf,
    extension: String,
}

impl ArtifactLayout {
    pub fn new(root: impl Into<PathBuf>, extension: impl Into<String>) -> ArtifactLayout {
        ArtifactLayout {
            root: root.into(),
            extension: extension.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn hash(identifier: &str) -> String {
        format!("{:016x}", xxh64(identifier.as_bytes(), 0))
    }

    pub fn raw_path(&self, identifier: &str) -> PathBuf {
        self.root
            .join(format!("{}.{}", Self::hash(identifier), self.extension))
    }

    pub fn scaled_path(&self, identifier: &str, size: Size) -> PathBuf {
        self.root.join(format!(
            "{}-{}-{}.{}",
            size.width,
            size.height,
            Self::hash(identifier),
            self.extension
        ))
    }

    pub fn path_for(&self, key: &CacheKey) -> PathBuf {
        match key.size() {
            Some(size) => self.scaled_path(key.identifier(), size),
            None => self.raw_path(key.identifier()),
        }
    }
}

pub type DecodedResource<D> = Resource<<D as Decoder>::Output, <D as Decoder>::Buffer>;

pub struct DiskCache<F, X, D: Decoder> {
    layout: ArtifactLayout,
    fetcher: F,
    transformer: X,
    decoder: Arc<D>,
    buffers: Arc<BlockingPool<D::Buffer>>,
}

impl<F: Fetcher, X: Transformer, D: Decoder> DiskCache<F, X, D> {
    /// Build a driver whose decode buffer pool holds at most `buffer_capacity` buffers.
    pub fn new(
        layout: ArtifactLayout,
        fetcher: F,
        transformer: X,
        decoder: D,
        buffer_capacity: usize,
    ) -> DiskCache<F, X, D> {
        let decoder = Arc::new(decoder);
        let producer = decoder.clone();
        DiskCache {
            layout,
            fetcher,
            transformer,
            decoder,
            buffers: Arc::new(BlockingPool::new(buffer_capacity, move || {
                producer.new_buffer()
            })),
        }
    }

    pub fn layout(&self) -> &ArtifactLayout {
        &self.layout
    }

    pub fn buffers(&self) -> &Arc<BlockingPool<D::Buffer>> {
        &self.buffers
    }

    /// Resolve a key through the disk tiers.  Blocks on I/O, the collaborators, and the buffer pool.
    pub fn resolve(&self, key: &CacheKey) -> Result<DecodedResource<D>, LoadError> {
        let target = self.layout.path_for(key);
        if target.exists() {
            return self.decode(&target);
        }

        let identifier = key.identifier();
        let raw = self.layout.raw_path(identifier);
        if !raw.exists() {
            tracing::debug!(identifier, path = %raw.display(), "fetching raw artifact");
            self.fetcher
                .fetch(identifier, &raw)
                .map_err(|e| LoadError::Fetch {
                    identifier: identifier.to_string(),
                    source: e.into(),
                })?;
        }

        if !raw.exists() {
            return Err(LoadError::MissingArtifact { path: raw });
        }

        if let Some(size) = key.size() {
            tracing::debug!(identifier, width = size.width, height = size.height, "transforming raw artifact");
            self.transformer
                .transform(&raw, size, &target)
                .map_err(|e| LoadError::Transform {
                    raw: raw.clone(),
                    source: e.into(),
                })?;
        }

        self.decode(&target)
    }

    /// Decode into a pooled buffer.  The buffer is handed to the resource on success and returned to the pool
    /// otherwise, panics included.
    fn decode(&self, path: &Path) -> Result<DecodedResource<D>, LoadError> {
        let mut buffer = self.buffers.acquire();
        let decoded = catch_unwind(AssertUnwindSafe(|| {
            self.decoder.decode(path, buffer.get_mut())
        }));

        match decoded {
            Ok(Ok(value)) => Ok(Resource::new(value, buffer, self.buffers.clone())),
            Ok(Err(e)) => {
                self.buffers.release(buffer)?;
                Err(LoadError::Decode {
                    path: path.to_path_buf(),
                    source: e.into(),
                })
            }
            Err(payload) => {
                self.buffers.release(buffer)?;
                Err(LoadError::Panicked(panic_message(&*payload)))
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::io::{Error as IoError, ErrorKind};

    use parking_lot::Mutex;

    use super::*;

    /// Everything the recording collaborators did, in order.
    #[derive(Default)]
    pub(crate) struct Journal(Mutex<Vec<String>>);

    impl Journal {
        pub(crate) fn record(&self, entry: String) {
            self.0.lock().push(entry);
        }

        pub(crate) fn entries(&self) -> Vec<String> {
            self.0.lock().clone()
        }

        pub(crate) fn count(&self, prefix: &str) -> usize {
            self.0.lock().iter().filter(|e| e.starts_with(prefix)).count()
        }
    }

    /// Writes the identifier into the destination, unless it is listed as missing upstream.
    pub(crate) struct FakeFetcher {
        pub(crate) journal: Arc<Journal>,
        pub(crate) fail: Vec<String>,
    }

    impl Fetcher for FakeFetcher {
        type Error = IoError;

        fn fetch(&self, identifier: &str, destination: &Path) -> Result<(), IoError> {
            self.journal.record(format!("fetch {}", identifier));
            if self.fail.iter().any(|f| f == identifier) {
                return Err(IoError::new(ErrorKind::NotFound, "no such remote"));
            }
            std::fs::write(destination, identifier)
        }
    }

    pub(crate) struct FakeTransformer {
        pub(crate) journal: Arc<Journal>,
        pub(crate) fail: bool,
    }

    impl Transformer for FakeTransformer {
        type Error = IoError;

        fn transform(&self, raw: &Path, size: Size, destination: &Path) -> Result<(), IoError> {
            let body = std::fs::read_to_string(raw)?;
            self.journal.record(format!("transform {} {}x{}", body, size.width, size.height));
            if self.fail {
                return Err(IoError::new(ErrorKind::InvalidData, "cannot scale"));
            }
            std::fs::write(destination, format!("{}@{}x{}", body, size.width, size.height))
        }
    }

    /// Copies the artifact's text into a pooled `String`, rejecting anything containing "corrupt".
    pub(crate) struct FakeDecoder {
        pub(crate) journal: Arc<Journal>,
    }

    impl Decoder for FakeDecoder {
        type Buffer = String;
        type Output = String;
        type Error = IoError;

        fn new_buffer(&self) -> String {
            String::new()
        }

        fn decode(&self, path: &Path, buffer: &mut String) -> Result<String, IoError> {
            let body = std::fs::read_to_string(path)?;
            self.journal.record(format!("decode {}", body));
            if body.contains("corrupt") {
                return Err(IoError::new(ErrorKind::InvalidData, "corrupt artifact"));
            }
            if body.contains("panic") {
                panic!("decoder exploded");
            }
            buffer.clear();
            buffer.push_str(&body);
            Ok(body)
        }
    }

    pub(crate) type FakeDiskCache = DiskCache<FakeFetcher, FakeTransformer, FakeDecoder>;

    fn build(root: &Path) -> (Arc<Journal>, FakeDiskCache) {
        build_with(root, vec![], false)
    }

    fn build_with(root: &Path, fail_fetch: Vec<String>, fail_transform: bool) -> (Arc<Journal>, FakeDiskCache) {
        let journal = Arc::new(Journal::default());
        let cache = DiskCache::new(
            ArtifactLayout::new(root, "img"),
            FakeFetcher {
                journal: journal.clone(),
                fail: fail_fetch,
            },
            FakeTransformer {
                journal: journal.clone(),
                fail: fail_transform,
            },
            FakeDecoder {
                journal: journal.clone(),
            },
            2,
        );
        (journal, cache)
    }

    #[test]
    fn layout_is_deterministic() {
        let layout = ArtifactLayout::new("/cache", "jpg");
        let raw = layout.raw_path("http://host/x.jpg");
        assert_eq!(raw, layout.raw_path("http://host/x.jpg"));
        assert_ne!(raw, layout.raw_path("http://host/y.jpg"));
        assert_eq!(raw.parent(), Some(Path::new("/cache")));

        let scaled = layout.scaled_path("http://host/x.jpg", Size::new(100, 50));
        let name = scaled.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("100-50-"));
        assert!(name.ends_with(".jpg"));
        assert_ne!(scaled, layout.scaled_path("http://host/x.jpg", Size::new(50, 100)));
        assert_eq!(layout.path_for(&CacheKey::raw("http://host/x.jpg").unwrap()), raw);
    }

    #[test]
    fn cold_resolution_fetches_transforms_and_decodes() {
        let dir = tempfile::tempdir().unwrap();
        let (journal, cache) = build(dir.path());
        let key = CacheKey::scaled("x.jpg", 100, 100).unwrap();

        let res = cache.resolve(&key).unwrap();
        assert_eq!(res.value(), "x.jpg@100x100");
        assert_eq!(
            journal.entries(),
            vec!["fetch x.jpg", "transform x.jpg 100x100", "decode x.jpg@100x100"]
        );
        assert!(cache.layout().raw_path("x.jpg").exists());
        assert_eq!(cache.buffers().acquired(), 1);
        drop(res);
        assert_eq!(cache.buffers().acquired(), 0);
    }

    #[test]
    fn fetch_failure_stops_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let (journal, cache) = build_with(dir.path(), vec!["x.jpg".into()], false);
        let key = CacheKey::scaled("x.jpg", 100, 100).unwrap();

        assert!(matches!(cache.resolve(&key), Err(LoadError::Fetch { .. })));
        assert_eq!(journal.entries(), vec!["fetch x.jpg"]);
        assert_eq!(cache.buffers().created(), 0);
    }

    #[test]
    fn raw_present_skips_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let (journal, cache) = build(dir.path());
        std::fs::write(cache.layout().raw_path("x.jpg"), "cached").unwrap();

        let res = cache
            .resolve(&CacheKey::scaled("x.jpg", 10, 20).unwrap())
            .unwrap();
        assert_eq!(res.value(), "cached@10x20");
        assert_eq!(journal.entries(), vec!["transform cached 10x20", "decode cached@10x20"]);
    }

    #[test]
    fn scaled_present_only_decodes() {
        let dir = tempfile::tempdir().unwrap();
        let (journal, cache) = build(dir.path());
        let path = cache.layout().scaled_path("x.jpg", Size::new(10, 20));
        std::fs::write(&path, "ready").unwrap();

        let res = cache
            .resolve(&CacheKey::scaled("x.jpg", 10, 20).unwrap())
            .unwrap();
        assert_eq!(res.value(), "ready");
        assert_eq!(journal.entries(), vec!["decode ready"]);
    }

    #[test]
    fn raw_keys_never_transform() {
        let dir = tempfile::tempdir().unwrap();
        let (journal, cache) = build(dir.path());

        let res = cache.resolve(&CacheKey::raw("x.jpg").unwrap()).unwrap();
        assert_eq!(res.value(), "x.jpg");
        assert_eq!(journal.entries(), vec!["fetch x.jpg", "decode x.jpg"]);
    }

    #[test]
    fn transform_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let (journal, cache) = build_with(dir.path(), vec![], true);

        let err = cache
            .resolve(&CacheKey::scaled("x.jpg", 1, 1).unwrap())
            .unwrap_err();
        assert!(matches!(err, LoadError::Transform { .. }));
        assert_eq!(journal.count("decode"), 0);
    }

    #[test]
    fn decode_failure_returns_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let (_, cache) = build(dir.path());
        std::fs::write(cache.layout().raw_path("bad"), "corrupt").unwrap();

        let err = cache.resolve(&CacheKey::raw("bad").unwrap()).unwrap_err();
        assert!(matches!(err, LoadError::Decode { .. }));
        assert_eq!(cache.buffers().acquired(), 0);
        assert_eq!(cache.buffers().available(), 1);
    }

    #[test]
    fn decoder_panic_returns_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let (_, cache) = build(dir.path());
        std::fs::write(cache.layout().raw_path("boom"), "panic").unwrap();

        let err = cache.resolve(&CacheKey::raw("boom").unwrap()).unwrap_err();
        assert!(matches!(err, LoadError::Panicked(ref m) if m == "decoder exploded"));
        assert_eq!(cache.buffers().available(), 1);
    }
}
