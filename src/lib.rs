//! A bounded, two-tier cache for remote resources that are expensive to fetch, scale, and decode.
//!
//! Think thumbnails: a resource lives somewhere remote, gets downloaded once into a raw artifact on disk, is scaled
//! into one artifact per requested size, and is finally decoded into memory using a buffer borrowed from a pool.
//! Decoded resources sit in an LRU cache of bounded length, and when they fall out of it their buffers go back to the
//! pool to be reused by the next decode, so steady-state operation allocates nothing large.
//!
//! The pieces, bottom up:
//!
//! - [BlockingPool] hands out pooled buffers, blocking when all of them are in use.
//! - [Lru] is a plain length-bounded LRU map, and [MemoryCache] builds pending-load bookkeeping on top of it.
//! - [DiskCache] resolves a [CacheKey] through the disk tiers using your [Fetcher], [Transformer], and [Decoder].
//! - [Bucket] ties it together: memory first, then a single background load per key, with every interested
//!   [BucketListener] told the outcome exactly once.
//!
//! To use this crate, implement the three collaborator traits (or start from the ones in [filesystem]), then construct
//! a [Bucket] from a [BucketConfig].
mod blocking_pool;
mod bucket;
mod disk_cache;
mod error;
pub mod filesystem;
mod key;
mod lru_map;
mod memory_cache;
mod notifier;
mod resource;
mod traits;
mod work_queue;

pub use blocking_pool::*;
pub use bucket::*;
pub use disk_cache::*;
pub use error::*;
pub use filesystem::*;
pub use key::*;
pub use lru_map::*;
pub use memory_cache::*;
pub use resource::*;
pub use traits::*;
pub use work_queue::*;
