/// Session configuration
///
/// Stored as JSON. Every field has a default, so a partial file (or no file
/// at all) yields a working configuration.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::guard::VersionTag;
use crate::loader::PartialCacheChoice;

/// Schema of the local cache table
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CacheSchema {
    /// Identity of the storage format; a change rebuilds the cache
    pub version: VersionTag,
    /// Natural primary key column
    pub key_column: String,
}

impl Default for CacheSchema {
    fn default() -> Self {
        Self {
            version: VersionTag::new(
                1,
                0,
                "stamps",
                "id TEXT PRIMARY KEY, \
                 ul_lon REAL, ul_lat REAL, ur_lon REAL, ur_lat REAL, \
                 lr_lon REAL, lr_lat REAL, ll_lon REAL, ll_lat REAL, \
                 instrument TEXT, acquired INTEGER, updated INTEGER",
                1,
            ),
            key_column: "id".to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Directory holding the local cache database and its lock file
    pub data_dir: PathBuf,
    /// Directory for persisted image tiles
    pub tile_cache_dir: PathBuf,
    /// Bundled offline snapshot, if the application ships one
    pub snapshot_path: Option<PathBuf>,
    /// Whether remote queries may be attempted at all
    pub network_permitted: bool,
    /// "host:port" probed before remote queries
    pub remote_host: Option<String>,
    pub probe_timeout_ms: u64,
    /// What to do when the cache answers but its refresh failed
    pub partial_cache: PartialCacheChoice,
    /// Unused layers kept before eviction
    pub layer_capacity: usize,
    /// Write tiles to disk as they are sliced
    pub persist_tiles: bool,
    /// Quiescence window for debounced state writes
    pub flush_quiescence_secs: u64,
    pub schema: CacheSchema,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            tile_cache_dir: default_tile_cache_dir(),
            snapshot_path: None,
            network_permitted: true,
            remote_host: None,
            probe_timeout_ms: 2_000,
            partial_cache: PartialCacheChoice::AcceptPartial,
            layer_capacity: 5,
            persist_tiles: true,
            flush_quiescence_secs: 10,
            schema: CacheSchema::default(),
        }
    }
}

impl CacheConfig {
    /// Configuration rooted in one directory (tests, portable installs)
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            data_dir: root.join("data"),
            tile_cache_dir: root.join("tiles"),
            ..Self::default()
        }
    }

    /// Load from a JSON file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match fs::read_to_string(path) {
            Ok(json) => Self::from_json(&json),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(source) => Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Path of the local cache database
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("stamp_cache.db")
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn flush_quiescence(&self) -> Duration {
        Duration::from_secs(self.flush_quiescence_secs)
    }
}

/// Where the database lives by default:
/// - Linux: ~/.local/share/stamp-cache
/// - macOS: ~/Library/Application Support/stamp-cache
/// - Windows: %APPDATA%\stamp-cache
fn default_data_dir() -> PathBuf {
    let mut path = dirs::data_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(std::env::temp_dir);
    path.push("stamp-cache");
    path
}

/// ~/.cache/stamp-cache/tiles on Linux
fn default_tile_cache_dir() -> PathBuf {
    let mut path = dirs_next::cache_dir()
        .or_else(dirs_next::home_dir)
        .unwrap_or_else(std::env::temp_dir);
    path.push("stamp-cache");
    path.push("tiles");
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CacheConfig::default();
        assert_eq!(config.layer_capacity, 5);
        assert_eq!(config.flush_quiescence(), Duration::from_secs(10));
        assert_eq!(config.partial_cache, PartialCacheChoice::AcceptPartial);
        assert!(config.db_path().ends_with("stamp_cache.db"));
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config = CacheConfig::from_json(
            r#"{ "network_permitted": false, "partial_cache": "UseRemote", "layer_capacity": 3 }"#,
        )
        .unwrap();
        assert!(!config.network_permitted);
        assert_eq!(config.partial_cache, PartialCacheChoice::UseRemote);
        assert_eq!(config.layer_capacity, 3);
        assert_eq!(config.schema, CacheSchema::default());
    }

    #[test]
    fn test_load_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig::load(&dir.path().join("none.json")).unwrap();
        assert_eq!(config, CacheConfig::default());
    }

    #[test]
    fn test_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = CacheConfig::rooted_at(dir.path());
        config.remote_host = Some("db.local:5432".into());
        let path = dir.path().join("config.json");
        fs::write(&path, config.to_json().unwrap()).unwrap();
        assert_eq!(CacheConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(CacheConfig::from_json("{ nope"), Err(ConfigError::Json(_))));
    }
}
