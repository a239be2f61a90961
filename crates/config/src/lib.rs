//! Configuration for the stash blob cache.
//!
//! Values are layered, later sources overriding earlier ones:
//! 1. Built-in defaults ([`CacheConfig::default`]).
//! 2. A configuration file (TOML, YAML or JSON, chosen by extension).
//! 3. Environment variables prefixed with `STASH_` (e.g. `STASH_DISK_BUDGET`).

pub mod error;

use crate::error::{ErrorKind, Result};
use directories::ProjectDirs;
use exn::{OptionExt, ResultExt};
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::instrument;

const ENV_PREFIX: &str = "STASH_";
const DATABASE_FILENAME: &str = "cache.sqlite";
const CONFIG_FILENAME: &str = "config.toml";

pub const DEFAULT_MEMORY_BUDGET: u64 = 4 * 1024 * 1024;
pub const DEFAULT_DISK_BUDGET: u64 = 64 * 1024 * 1024;

/// Cache configuration.
///
/// A budget of zero disables the corresponding tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Database file for the on-disk tier. Defaults to the platform cache
    /// directory when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<PathBuf>,
    /// Maximum bytes held by the in-memory tier.
    pub memory_budget: u64,
    /// Maximum bytes held by the on-disk tier.
    pub disk_budget: u64,
    /// Directory that extracted payloads are written to. Defaults to the
    /// system temporary directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extract_dir: Option<PathBuf>,
}
impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            location: None,
            memory_budget: DEFAULT_MEMORY_BUDGET,
            disk_budget: DEFAULT_DISK_BUDGET,
            extract_dir: None,
        }
    }
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "stash")
}

impl CacheConfig {
    /// Load from the platform configuration directory (if the file exists)
    /// and the environment.
    pub fn load() -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(dirs) = project_dirs() {
            let path = dirs.config_dir().join(CONFIG_FILENAME);
            if path.is_file() {
                figment = figment.merge(Toml::file(path));
            } else {
                tracing::debug!(path = %path.display(), "No configuration file found; using defaults");
            }
        }
        Self::extract(figment.merge(Env::prefixed(ENV_PREFIX)))
    }

    /// Load from an explicit configuration file and the environment.
    #[instrument(level = "debug", skip_all, fields(path = %path.as_ref().display()))]
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let figment = Self::figment(path.as_ref())?.merge(Env::prefixed(ENV_PREFIX));
        Self::extract(figment)
    }

    /// Defaults merged with the configuration file at `path`, without the environment.
    pub fn figment(path: &Path) -> Result<Figment> {
        if !path.is_file() {
            exn::bail!(ErrorKind::NotFound(path.to_path_buf()));
        }
        let defaults = Figment::from(Serialized::defaults(Self::default()));
        let extension = path.extension().and_then(|ext| ext.to_str()).unwrap_or_default();
        Ok(match extension.to_ascii_lowercase().as_str() {
            "toml" => defaults.merge(Toml::file(path)),
            "yaml" | "yml" => defaults.merge(Yaml::file(path)),
            "json" => defaults.merge(Json::file(path)),
            other => exn::bail!(ErrorKind::UnsupportedFormat(other.to_string())),
        })
    }

    fn extract(figment: Figment) -> Result<Self> {
        figment.extract::<Self>().or_raise(|| ErrorKind::Load)
    }

    /// The database file for the on-disk tier.
    pub fn disk_location(&self) -> Result<PathBuf> {
        if let Some(location) = &self.location {
            return Ok(location.clone());
        }
        let dirs = project_dirs().ok_or_raise(|| ErrorKind::NoCacheDirectory)?;
        Ok(dirs.cache_dir().join(DATABASE_FILENAME))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::fs;

    fn write_config(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_defaults() {
        let config = CacheConfig::default();
        assert_eq!(config.memory_budget, DEFAULT_MEMORY_BUDGET);
        assert_eq!(config.disk_budget, DEFAULT_DISK_BUDGET);
        assert_eq!(config.location, None);
    }

    #[rstest]
    #[case("config.toml", "disk_budget = 2048\nlocation = \"/srv/stash.sqlite\"\n")]
    #[case("config.yaml", "disk_budget: 2048\nlocation: /srv/stash.sqlite\n")]
    #[case("config.yml", "disk_budget: 2048\nlocation: /srv/stash.sqlite\n")]
    #[case("config.json", r#"{"disk_budget": 2048, "location": "/srv/stash.sqlite"}"#)]
    fn test_file_formats(#[case] name: &str, #[case] contents: &str) {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = write_config(temp_dir.path(), name, contents);
        let config: CacheConfig = CacheConfig::figment(&path).unwrap().extract().unwrap();
        assert_eq!(config.disk_budget, 2048);
        // Unset values keep their defaults.
        assert_eq!(config.memory_budget, DEFAULT_MEMORY_BUDGET);
        assert_eq!(config.disk_location().unwrap(), PathBuf::from("/srv/stash.sqlite"));
    }

    #[test]
    fn test_zero_budget_disables() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = write_config(temp_dir.path(), "config.toml", "memory_budget = 0\n");
        let config: CacheConfig = CacheConfig::figment(&path).unwrap().extract().unwrap();
        assert_eq!(config.memory_budget, 0);
        assert_eq!(config.disk_budget, DEFAULT_DISK_BUDGET);
    }

    #[test]
    fn test_negative_budget_is_invalid() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = write_config(temp_dir.path(), "config.toml", "memory_budget = -1\n");
        let err = CacheConfig::extract(CacheConfig::figment(&path).unwrap()).unwrap_err();
        assert_eq!(*err, ErrorKind::Load);
    }

    #[test]
    fn test_missing_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("missing.toml");
        let err = CacheConfig::figment(&path).unwrap_err();
        assert_eq!(*err, ErrorKind::NotFound(path));
    }

    #[test]
    fn test_unsupported_format() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = write_config(temp_dir.path(), "config.ini", "disk_budget=1\n");
        let err = CacheConfig::figment(&path).unwrap_err();
        assert_eq!(*err, ErrorKind::UnsupportedFormat("ini".to_string()));
    }

    #[test]
    fn test_environment_overrides_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("stash.toml", "disk_budget = 2048\nmemory_budget = 512\n")?;
            jail.set_env("STASH_DISK_BUDGET", 8192);
            let config = CacheConfig::load_from("stash.toml").unwrap();
            assert_eq!(config.disk_budget, 8192);
            assert_eq!(config.memory_budget, 512);
            Ok(())
        });
    }

    #[test]
    fn test_invalid_environment_is_rejected() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("stash.toml", "disk_budget = 2048\n")?;
            jail.set_env("STASH_DISK_BUDGET", "lots");
            let err = CacheConfig::load_from("stash.toml").unwrap_err();
            assert_eq!(*err, ErrorKind::Load);
            Ok(())
        });
    }

    #[test]
    fn test_load_reads_environment() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("STASH_MEMORY_BUDGET", 0);
            jail.set_env("STASH_LOCATION", "/srv/stash/cache.sqlite");
            let config = CacheConfig::load().unwrap();
            assert_eq!(config.memory_budget, 0);
            assert_eq!(config.disk_location().unwrap(), PathBuf::from("/srv/stash/cache.sqlite"));
            Ok(())
        });
    }

    #[test]
    fn test_disk_location_prefers_explicit() {
        let config = CacheConfig { location: Some(PathBuf::from("/tmp/explicit.sqlite")), ..Default::default() };
        assert_eq!(config.disk_location().unwrap(), PathBuf::from("/tmp/explicit.sqlite"));
    }
}
