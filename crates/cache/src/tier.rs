//! A single size-bounded cache tier backed by one store.

use crate::error::{ErrorKind, Result};
use crate::{FileCache, TempFile};
use async_trait::async_trait;
use exn::{OptionExt, ResultExt};
use futures::TryStreamExt;
use stash_store::{Entry, Location, SqliteConnection, Store, records, settle};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::instrument;

/// Payloads are copied into and out of the store in chunks of this size.
pub const CHUNK_SIZE: usize = 16 * 1024;
const EXTRACT_PREFIX: &str = "stash-extract-";

/// What a put did with the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stored {
    /// The payload is now cached under its key.
    Cached,
    /// The payload is larger than the tier's entire budget and was ignored.
    Oversized,
    /// The tier has been closed; nothing was done.
    Closed,
}

/// A snapshot of a tier's bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierStats {
    pub entries: u64,
    pub total_size: u64,
    pub budget: u64,
}

/// One cache tier: a [`Store`] plus the byte budget enforced over it.
///
/// When a put would push the total size of all entries over the budget, the
/// least recently used entries are evicted until the new payload fits. Gets
/// count as uses.
///
/// Every operation holds the tier's lock for its whole transaction, so
/// operations on the same tier never interleave. Different tiers don't share
/// anything and can be used concurrently.
#[derive(Debug)]
pub struct Tier {
    /// `None` once the tier has been closed.
    store: Mutex<Option<Store>>,
    location: Location,
    budget: u64,
    extract_dir: Option<PathBuf>,
}

impl Tier {
    /// Open a tier over the store at `location`, holding at most `budget` bytes.
    pub async fn open(location: Location, budget: u64) -> Result<Self> {
        let store = Store::open(location.clone()).await.map_err(ErrorKind::store)?;
        Ok(Self { store: Mutex::new(Some(store)), location, budget, extract_dir: None })
    }

    /// Extract payloads into `dir` instead of the system temporary directory.
    pub fn with_extract_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.extract_dir = Some(dir.into());
        self
    }

    pub fn location(&self) -> &Location {
        &self.location
    }

    pub fn budget(&self) -> u64 {
        self.budget
    }

    /// Close the underlying store. Later puts do nothing and later gets miss.
    pub async fn close(&self) {
        let store = self.store.lock().await.take();
        if let Some(store) = store {
            store.close().await;
            tracing::debug!(tier = %self.location, "Cache tier closed");
        }
    }

    // =========================================================================
    // Put
    // =========================================================================

    /// Cache the contents of the file at `source` under `key`, replacing any
    /// existing entry for that key.
    ///
    /// Everything happens in one transaction: on error, the tier is left
    /// exactly as it was.
    #[instrument(level = "trace", skip(self, source), fields(tier = %self.location, source = %source.display()))]
    pub async fn try_put(&self, key: &str, source: &Path) -> Result<Stored> {
        let unavailable = || ErrorKind::SourceUnavailable(source.to_path_buf());
        let mut file = File::open(source).await.or_raise(unavailable)?;
        let size = file.metadata().await.or_raise(unavailable)?.len();
        if size > self.budget {
            tracing::info!(
                tier = %self.location,
                key,
                size,
                budget = self.budget,
                "Refusing to cache: larger than the tier's size limit"
            );
            return Ok(Stored::Oversized);
        }

        let mut guard = self.store.lock().await;
        let Some(store) = guard.as_mut() else {
            return Ok(Stored::Closed);
        };
        let mut tx = store.begin().await.map_err(ErrorKind::store)?;
        let outcome = self.write_entry(&mut tx, key, size, &mut file, source).await;
        settle(tx, outcome).await?;
        tracing::trace!(tier = %self.location, key, size, "Cached");
        Ok(Stored::Cached)
    }

    async fn write_entry(
        &self,
        conn: &mut SqliteConnection,
        key: &str,
        size: u64,
        file: &mut File,
        source: &Path,
    ) -> Result<()> {
        let total = records::total_size(conn).await.map_err(ErrorKind::store)?;
        if total.saturating_add(size) > self.budget {
            self.evict(conn, total, size).await?;
        }
        // The blob must exist before the entry that references it.
        let blob = records::insert_blob(conn, size).await.or_raise(|| ErrorKind::StoreWrite)?;
        records::delete_entry_by_key(conn, key).await.map_err(ErrorKind::store)?;
        records::insert_entry(conn, key, size, blob).await.or_raise(|| ErrorKind::StoreWrite)?;
        Self::copy_in(conn, blob, size, file, source).await
    }

    /// Evict entries, least recently used first, until `incoming` more bytes fit.
    async fn evict(&self, conn: &mut SqliteConnection, total: u64, incoming: u64) -> Result<()> {
        let required = total.saturating_add(incoming).saturating_sub(self.budget);
        let mut freed = 0u64;
        let mut evicted = 0u64;
        let mut last_evicted = None;
        {
            let mut candidates = records::eviction_candidates(conn);
            while freed < required {
                let Some(entry) = candidates.try_next().await.map_err(ErrorKind::store)? else {
                    break;
                };
                freed = freed.saturating_add(entry.size);
                evicted += 1;
                last_evicted = Some(entry.id);
            }
        }
        let Some(last_evicted) = last_evicted else {
            exn::bail!(ErrorKind::Corruption("no cached entries, but the total size is nonzero"));
        };
        if freed < required {
            exn::bail!(ErrorKind::Corruption("total size exceeds the sum of all entry sizes"));
        }
        records::delete_entries_through(conn, last_evicted).await.map_err(ErrorKind::store)?;
        tracing::debug!(tier = %self.location, evicted, freed, "Evicted least recently used entries");
        Ok(())
    }

    /// Stream exactly `size` bytes from `file` into the blob.
    async fn copy_in(conn: &mut SqliteConnection, blob: i64, size: u64, file: &mut File, source: &Path) -> Result<()> {
        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut remaining = size;
        let mut seq = 0i64;
        while remaining > 0 {
            let len = usize::try_from(remaining).map_or(CHUNK_SIZE, |r| r.min(CHUNK_SIZE));
            let chunk = &mut buffer[..len];
            file.read_exact(chunk)
                .await
                .or_raise(|| ErrorKind::TruncatedInput(source.to_path_buf()))?;
            records::append_chunk(conn, blob, seq, chunk).await.or_raise(|| ErrorKind::StoreWrite)?;
            remaining -= len as u64;
            seq += 1;
        }
        Ok(())
    }

    // =========================================================================
    // Get
    // =========================================================================

    /// Extract the payload cached under `key` into a fresh temporary file.
    ///
    /// A hit also marks the entry as the most recently used.
    #[instrument(level = "trace", skip(self), fields(tier = %self.location))]
    pub async fn try_get(&self, key: &str) -> Result<Option<TempFile>> {
        let mut guard = self.store.lock().await;
        let Some(store) = guard.as_mut() else {
            return Ok(None);
        };
        let mut tx = store.begin().await.map_err(ErrorKind::store)?;
        let outcome = self.read_entry(&mut tx, key).await;
        settle(tx, outcome).await
    }

    async fn read_entry(&self, conn: &mut SqliteConnection, key: &str) -> Result<Option<TempFile>> {
        let Some(entry) = records::find_entry(conn, key).await.map_err(ErrorKind::store)? else {
            tracing::trace!(tier = %self.location, key, "Cache miss");
            return Ok(None);
        };
        records::promote(conn, entry.id).await.map_err(ErrorKind::store)?;
        let extracted = self.extract(conn, &entry).await?;
        tracing::trace!(tier = %self.location, key, size = entry.size, "Cache hit");
        Ok(Some(extracted))
    }

    async fn extract(&self, conn: &mut SqliteConnection, entry: &Entry) -> Result<TempFile> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(EXTRACT_PREFIX);
        let temp = match &self.extract_dir {
            Some(dir) => builder.tempfile_in(dir),
            None => builder.tempfile(),
        }
        .or_raise(|| ErrorKind::Extract)?;
        let mut output = File::from_std(temp.as_file().try_clone().or_raise(|| ErrorKind::Extract)?);

        let mut written = 0u64;
        let mut chunks = records::blob_chunks(conn, entry.blob_id);
        while let Some(chunk) = chunks.try_next().await.map_err(ErrorKind::store)? {
            output.write_all(&chunk).await.or_raise(|| ErrorKind::Extract)?;
            written += chunk.len() as u64;
        }
        output.flush().await.or_raise(|| ErrorKind::Extract)?;
        if written != entry.size {
            exn::bail!(ErrorKind::Corruption("stored payload length doesn't match its entry"));
        }
        Ok(temp)
    }

    // =========================================================================
    // Stats
    // =========================================================================

    pub async fn stats(&self) -> Result<TierStats> {
        let mut guard = self.store.lock().await;
        let store = guard.as_mut().ok_or_raise(|| ErrorKind::Closed)?;
        let mut tx = store.begin().await.map_err(ErrorKind::store)?;
        let outcome = Self::read_stats(&mut tx, self.budget).await;
        settle(tx, outcome).await
    }

    async fn read_stats(conn: &mut SqliteConnection, budget: u64) -> Result<TierStats> {
        Ok(TierStats {
            entries: records::entry_count(conn).await.map_err(ErrorKind::store)?,
            total_size: records::total_size(conn).await.map_err(ErrorKind::store)?,
            budget,
        })
    }
}

#[async_trait]
impl FileCache for Tier {
    async fn put(&self, key: &str, source: &Path) {
        if let Err(err) = self.try_put(key, source).await {
            tracing::warn!(
                tier = %self.location,
                key,
                source = %source.display(),
                error = ?err,
                "Can't cache file"
            );
        }
    }

    async fn get(&self, key: &str) -> Option<TempFile> {
        self.try_get(key).await.unwrap_or_else(|err| {
            tracing::warn!(tier = %self.location, key, error = ?err, "Can't get the cache entry");
            None
        })
    }

    async fn close(&self) {
        Tier::close(self).await
    }
}
