//! Ordered composition of cache tiers.

use crate::{CacheHandle, FileCache, TempFile};
use async_trait::async_trait;
use std::path::Path;

/// A cache made of other caches, fastest first.
///
/// Puts are forwarded to every cache, in order. Gets are served by the first
/// cache that has the key. A hit in a later cache is *not* copied into the
/// earlier ones, so a get never writes to any cache other than the one that
/// served it.
#[derive(Default)]
pub struct Multilevel {
    caches: Vec<CacheHandle>,
}

impl Multilevel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a cache after all existing ones.
    pub fn push(&mut self, cache: CacheHandle) {
        self.caches.push(cache);
    }

    pub fn len(&self) -> usize {
        self.caches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.caches.is_empty()
    }
}

#[async_trait]
impl FileCache for Multilevel {
    async fn put(&self, key: &str, source: &Path) {
        for cache in &self.caches {
            cache.put(key, source).await;
        }
    }

    async fn get(&self, key: &str) -> Option<TempFile> {
        for (level, cache) in self.caches.iter().enumerate() {
            if let Some(found) = cache.get(key).await {
                tracing::trace!(key, tier = level, "Served from cache tier");
                return Some(found);
            }
        }
        None
    }

    async fn close(&self) {
        for cache in &self.caches {
            cache.close().await;
        }
    }
}
