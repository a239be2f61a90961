use crate::{FileCache, Multilevel, TempFile, Tier};
use stash_config::CacheConfig;
use stash_store::Location;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::instrument;

/// The cache handed out to the rest of the application: an in-memory tier in
/// front of an on-disk tier.
///
/// Nothing here ever fails from the caller's point of view. A tier that can't
/// be opened is left out, a put that can't be completed is dropped, and a get
/// that runs into trouble is a miss. The worst case is a cache that never hits.
///
/// The owner decides how long the cache lives. Call [`Cache::close`] when the
/// underlying stores should be released (dropping the cache also works, but
/// skips the final housekeeping).
pub struct Cache {
    levels: Multilevel,
}

impl Cache {
    /// Create a cache with a memory tier of `memory_budget` bytes in front of
    /// a disk tier of `disk_budget` bytes stored at `disk_location`.
    ///
    /// A budget of zero disables that tier. With both disabled (or both
    /// failing to open) the result is a cache that accepts and discards
    /// everything.
    pub async fn create(disk_location: impl Into<PathBuf>, memory_budget: u64, disk_budget: u64) -> Self {
        Self::build(Some(disk_location.into()), memory_budget, disk_budget, None).await
    }

    /// Create a cache as described by `config`.
    pub async fn from_config(config: &CacheConfig) -> Self {
        let disk_location = if config.disk_budget > 0 {
            config
                .disk_location()
                .inspect_err(|err| tracing::warn!(error = ?err, "Unable to determine the on-disk cache location"))
                .ok()
        } else {
            None
        };
        Self::build(disk_location, config.memory_budget, config.disk_budget, config.extract_dir.clone()).await
    }

    /// A cache with no tiers at all.
    pub fn disabled() -> Self {
        Self { levels: Multilevel::new() }
    }

    #[instrument(level = "debug", skip_all)]
    async fn build(
        disk_location: Option<PathBuf>,
        memory_budget: u64,
        disk_budget: u64,
        extract_dir: Option<PathBuf>,
    ) -> Self {
        let mut levels = Multilevel::new();
        let prepare = |tier: Tier| {
            tracing::debug!(tier = %tier.location(), budget = tier.budget(), "Cache tier ready");
            match &extract_dir {
                Some(dir) => tier.with_extract_dir(dir),
                None => tier,
            }
        };

        if memory_budget > 0 {
            match Tier::open(Location::Memory, memory_budget).await {
                Ok(tier) => levels.push(Arc::new(prepare(tier))),
                Err(err) => tracing::warn!(error = ?err, "Unable to create the in-memory cache"),
            }
        } else {
            tracing::info!("In-memory cache disabled");
        }

        match disk_location {
            Some(path) if disk_budget > 0 => match Tier::open(Location::File(path.clone()), disk_budget).await {
                Ok(tier) => levels.push(Arc::new(prepare(tier))),
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = ?err, "Unable to open the on-disk cache")
                },
            },
            _ => tracing::info!("On-disk cache disabled"),
        }

        Self { levels }
    }

    /// Cache the contents of the file at `source` under `key`, in every tier
    /// it fits in.
    pub async fn put(&self, key: impl AsRef<str>, source: impl AsRef<Path>) {
        self.levels.put(key.as_ref(), source.as_ref()).await
    }

    /// Retrieve the payload cached under `key` as a freshly written temporary
    /// file.
    ///
    /// The file belongs to the caller: it's deleted when the returned handle
    /// is dropped, unless it's kept or persisted first.
    pub async fn get(&self, key: impl AsRef<str>) -> Option<TempFile> {
        self.levels.get(key.as_ref()).await
    }

    /// Number of tiers that opened successfully.
    pub fn tier_count(&self) -> usize {
        self.levels.len()
    }

    /// Whether any tier is available, i.e. whether a get could ever hit.
    pub fn is_available(&self) -> bool {
        !self.levels.is_empty()
    }

    /// Close every tier. The contents of the in-memory tier are lost.
    pub async fn close(self) {
        self.levels.close().await
    }
}
