//! Size-bounded, multi-tier blob cache.
//!
//! Payloads are cached under opaque string keys so that previously fetched
//! artifacts don't have to be fetched again.
//!
//! # Architecture
//! - **[`Tier`]**: one [`Store`](stash_store::Store) (in memory or on disk)
//!   with a byte budget. Least recently used entries are evicted to make room.
//! - **[`Multilevel`]**: an ordered list of caches. Puts go to all of them,
//!   gets are answered by the first one with a hit.
//! - **[`Cache`]**: the memory-then-disk arrangement the rest of the
//!   application uses, built from a [`CacheConfig`].
//!
//! Caching is strictly best-effort. Tiers report their failures as
//! [`error::Error`]s through `try_put`/`try_get`, but the [`FileCache`]
//! interface narrows every outcome to "stored or not" and "hit or miss".

mod cache;
pub mod error;
mod multilevel;
mod tier;

pub use crate::cache::Cache;
pub use crate::multilevel::Multilevel;
pub use crate::tier::{CHUNK_SIZE, Stored, Tier, TierStats};
pub use stash_config::CacheConfig;
pub use stash_store::Location;

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

/// An extracted payload. Deleted from disk when dropped.
pub type TempFile = tempfile::NamedTempFile;

pub type CacheHandle = Arc<dyn FileCache>;

/// A cache of files, keyed by strings.
///
/// Neither operation can fail: anything that goes wrong is logged and turns
/// into a no-op (put) or a miss (get).
#[async_trait]
pub trait FileCache: Send + Sync {
    /// Store the contents of the file at `source` under `key`.
    async fn put(&self, key: &str, source: &Path);

    /// Extract the contents stored under `key` into a new temporary file.
    async fn get(&self, key: &str) -> Option<TempFile>;

    /// Release any underlying resources. Later calls behave as if the cache
    /// were empty.
    async fn close(&self) {}
}
