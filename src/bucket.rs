//! The [Bucket] is the front door: it answers from memory when it can, and otherwise schedules exactly one background
//! load per key and tells every interested listener how it went.
//!
//! Per key, the state moves from absent to pending (a `None` marker in the [MemoryCache]) and from there to resolved
//! (the marker replaced by the resource) or failed (the key forgotten, so the next request starts over).  Loads run
//! on a fixed set of worker threads fed newest-first from a [LifoQueue]; callbacks run on a single notification thread.
//!
//! Locks are always taken in the order memory cache, pending loads, work queue, and none is held across I/O or a
//! pool acquisition.  Evicted resources are recycled only after every lock has been released.
use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use ahash::RandomState;
use parking_lot::Mutex;

use crate::error::panic_message;
use crate::notifier::{Notification, Notifier, Outcome};
use crate::*;

#[derive(Clone, Debug, derive_builder::Builder)]
pub struct BucketConfig {
    /// Directory holding raw and scaled artifacts.  Created if missing.
    #[builder(setter(into))]
    pub cache_root: PathBuf,
    /// Maximum entries in the memory cache, pending loads included.
    #[builder(default = "32")]
    pub capacity: usize,
    #[builder(default = "8")]
    pub worker_threads: usize,
    /// Decode buffers; defaults to `capacity + worker_threads` so that a full cache never starves the workers.
    ///
    /// Must be more than `capacity`: every resolved entry holds a buffer until it is evicted, and a decode needs one
    /// more.
    #[builder(default, setter(strip_option))]
    pub buffer_pool_capacity: Option<usize>,
    #[builder(default = "\"img\".to_string()", setter(into))]
    pub artifact_extension: String,
}

struct PendingLoads<R> {
    /// Listeners waiting on each key, in registration order.
    listeners: HashMap<CacheKey, Vec<SharedListener<R>>, RandomState>,
    /// Keys queued or being loaded.
    in_flight: HashSet<CacheKey, RandomState>,
}

struct Shared<F, X, D: Decoder> {
    disk: DiskCache<F, X, D>,
    cache: Mutex<MemoryCache<DecodedResource<D>>>,
    pending: Mutex<PendingLoads<DecodedResource<D>>>,
    queue: LifoQueue<CacheKey>,
    notifier: Notifier<DecodedResource<D>>,
    destroyed: AtomicBool,
}

fn recycle_discarded<T, B>(resource: &Resource<T, B>) {
    match resource.recycle() {
        Ok(_) => {}
        // The load finished after `destroy` drained the pool.
        Err(PoolError::InvalidResource) => tracing::debug!("discarded resource outlived its pool"),
        Err(e) => tracing::error!(error = %e, "discarded resource could not be recycled"),
    }
}

fn same_listener<R>(a: &SharedListener<R>, b: &SharedListener<R>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

impl<F: Fetcher, X: Transformer, D: Decoder> Shared<F, X, D> {
    fn request(
        &self,
        key: CacheKey,
        listener: Option<SharedListener<DecodedResource<D>>>,
    ) -> Result<Option<Arc<DecodedResource<D>>>, RequestError> {
        let mut listener = listener;
        let mut rejected = false;
        let (hit, evicted) = {
            let mut cache = self.cache.lock();
            match cache.get_or_mark_pending(&key) {
                Lookup::Hit(r) => (Some(r), vec![]),
                Lookup::Pending => {
                    rejected = !self.attach(&key, listener.take());
                    (None, vec![])
                }
                Lookup::Marked { evicted } => {
                    rejected = !self.attach(&key, listener.take());
                    (None, evicted)
                }
            }
        };
        self.recycle(evicted);

        if rejected {
            self.complete(key, Outcome::Failed);
            return Err(RequestError::Destroyed);
        }

        if let (Some(resource), Some(l)) = (&hit, listener) {
            l.on_loaded(key.identifier(), resource, key.width(), key.height());
        }
        Ok(hit)
    }

    /// Register a listener and schedule the load unless one is already in flight.  Called with the cache lock held.
    ///
    /// Returns false if the queue has been closed.
    fn attach(&self, key: &CacheKey, listener: Option<SharedListener<DecodedResource<D>>>) -> bool {
        let mut pending = self.pending.lock();
        if let Some(l) = listener {
            let waiting = pending.listeners.entry(key.clone()).or_default();
            if !waiting.iter().any(|w| same_listener(w, &l)) {
                waiting.push(l);
            }
        }

        if !pending.in_flight.insert(key.clone()) {
            tracing::debug!(key = ?key, "joining load already in flight");
            return true;
        }

        if self.queue.push(key.clone()).is_err() {
            pending.in_flight.remove(key);
            return false;
        }
        tracing::debug!(key = ?key, "load scheduled");
        true
    }

    fn worker_loop(&self) {
        while let Some(key) = self.queue.pop() {
            self.run(key);
        }
    }

    fn run(&self, key: CacheKey) {
        let outcome = match catch_unwind(AssertUnwindSafe(|| self.disk.resolve(&key))) {
            Ok(Ok(resource)) => Outcome::Loaded(Arc::new(resource)),
            Ok(Err(e)) => {
                tracing::warn!(
                    identifier = key.identifier(),
                    width = key.width(),
                    height = key.height(),
                    error = ?e,
                    "load failed"
                );
                Outcome::Failed
            }
            Err(payload) => {
                tracing::error!(
                    identifier = key.identifier(),
                    width = key.width(),
                    height = key.height(),
                    panic = %panic_message(&*payload),
                    "load panicked"
                );
                Outcome::Failed
            }
        };
        self.complete(key, outcome);
    }

    /// Record the outcome, end the in-flight load, and hand the waiting listeners to the notifier.
    ///
    /// A resource whose pending marker was evicted is not cached.  Its buffer goes back to the pool as soon as the
    /// listeners have seen it; listeners keeping the `Arc` keep the value but not the buffer.
    fn complete(&self, key: CacheKey, outcome: Outcome<DecodedResource<D>>) {
        let (listeners, evicted, discarded) = {
            let mut cache = self.cache.lock();
            let (evicted, discarded) = match &outcome {
                Outcome::Loaded(resource) => {
                    let resolved = cache.resolve(&key, resource.clone());
                    if resolved.stored {
                        (resolved.evicted, None)
                    } else {
                        tracing::debug!(key = ?key, "key evicted while loading; result not cached");
                        (resolved.evicted, Some(resource.clone()))
                    }
                }
                Outcome::Failed => (cache.fail(&key).into_iter().collect(), None),
            };

            let mut pending = self.pending.lock();
            pending.in_flight.remove(&key);
            (pending.listeners.remove(&key).unwrap_or_default(), evicted, discarded)
        };
        self.recycle(evicted);

        if listeners.is_empty() {
            if let Some(resource) = discarded {
                recycle_discarded(&resource);
            }
            return;
        }
        let then = discarded
            .map(|resource| Box::new(move || recycle_discarded(&resource)) as Box<dyn FnOnce() + Send>);
        let posted = self.notifier.post(Notification {
            key,
            outcome,
            listeners,
            then,
        });
        if !posted {
            tracing::debug!("notifier stopped; listeners not told");
        }
    }

    fn recycle(&self, evicted: Vec<Arc<DecodedResource<D>>>) {
        for resource in evicted {
            if let Err(e) = resource.recycle() {
                tracing::error!(error = %e, "evicted resource could not be recycled");
            }
        }
    }
}

pub struct Bucket<F: Fetcher, X: Transformer, D: Decoder> {
    shared: Arc<Shared<F, X, D>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<F: Fetcher, X: Transformer, D: Decoder> Bucket<F, X, D> {
    pub fn new(config: BucketConfig, fetcher: F, transformer: X, decoder: D) -> std::io::Result<Bucket<F, X, D>> {
        if config.capacity == 0 || config.worker_threads == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "capacity and worker_threads must be at least 1",
            ));
        }
        let buffer_capacity = config
            .buffer_pool_capacity
            .unwrap_or(config.capacity + config.worker_threads);
        if buffer_capacity <= config.capacity {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "buffer_pool_capacity must be greater than capacity",
            ));
        }
        std::fs::create_dir_all(&config.cache_root)?;

        let layout = ArtifactLayout::new(&config.cache_root, config.artifact_extension.clone());
        let shared = Arc::new(Shared {
            disk: DiskCache::new(layout, fetcher, transformer, decoder, buffer_capacity),
            cache: Mutex::new(MemoryCache::new(config.capacity)),
            pending: Mutex::new(PendingLoads {
                listeners: Default::default(),
                in_flight: Default::default(),
            }),
            queue: LifoQueue::new(),
            notifier: Notifier::spawn("bucket-notify".to_string())?,
            destroyed: AtomicBool::new(false),
        });

        // From here on, an early return drops the bucket, which tears down whatever was started.
        let bucket = Bucket {
            shared,
            workers: Mutex::new(Vec::with_capacity(config.worker_threads)),
        };
        for i in 0..config.worker_threads {
            let shared = bucket.shared.clone();
            let handle = thread::Builder::new()
                .name(format!("bucket-worker-{}", i))
                .spawn(move || shared.worker_loop())?;
            bucket.workers.lock().push(handle);
        }

        Ok(bucket)
    }

    /// Get a resource if it is in memory, otherwise start loading it in the background.
    ///
    /// On a hit the resource is returned and, if given, `listener` is called before this returns.  On a miss this
    /// returns `Ok(None)` and `listener` is told the outcome later, on the notification thread.
    pub fn get(
        &self,
        identifier: &str,
        width: u32,
        height: u32,
        listener: Option<SharedListener<DecodedResource<D>>>,
    ) -> Result<Option<Arc<DecodedResource<D>>>, RequestError> {
        if self.is_destroyed() {
            return Err(RequestError::Destroyed);
        }
        let key = CacheKey::scaled(identifier, width, height)?;
        self.shared.request(key, listener)
    }

    /// Warm the cache without listening for the outcome.
    pub fn precache(
        &self,
        identifier: &str,
        width: u32,
        height: u32,
    ) -> Result<Option<Arc<DecodedResource<D>>>, RequestError> {
        self.get(identifier, width, height, None)
    }

    /// Whether the memory cache has an entry for the key, resolved or pending.
    pub fn contains(&self, identifier: &str, width: u32, height: u32) -> bool {
        match CacheKey::scaled(identifier, width, height) {
            Ok(key) => self.shared.cache.lock().contains_key(&key),
            Err(_) => false,
        }
    }

    /// Entries in the memory cache, pending ones included.
    pub fn cached_len(&self) -> usize {
        self.shared.cache.lock().len()
    }

    pub fn buffer_pool(&self) -> &Arc<BlockingPool<D::Buffer>> {
        self.shared.disk.buffers()
    }

    pub fn layout(&self) -> &ArtifactLayout {
        self.shared.disk.layout()
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.destroyed.load(Ordering::Acquire)
    }

    /// Stop the bucket for good.
    ///
    /// Queued loads fail and their listeners are told so.  Loads already running cannot be interrupted mid-call; this
    /// waits for them, and their listeners still hear the outcome.  The buffer pool is drained last, waking anything
    /// blocked on it.
    pub fn destroy(&self) {
        if self.shared.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!("destroying bucket");

        for key in self.shared.queue.close() {
            self.shared.complete(key, Outcome::Failed);
        }
        let cached = self.shared.cache.lock().clear();
        self.shared.recycle(cached);
        self.shared.disk.buffers().drain();

        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if worker.join().is_err() {
                tracing::error!("worker thread panicked");
            }
        }
        self.shared.notifier.shutdown();
    }
}

impl<F: Fetcher, X: Transformer, D: Decoder> Drop for Bucket<F, X, D> {
    fn drop(&mut self) {
        self.destroy();
    }
}
