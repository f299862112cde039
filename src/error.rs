/// Error types for the stamp cache
///
/// Each concern gets its own enum so callers can match on the outcomes
/// they care about (a locked cache is not the same thing as an empty query).

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors from the local persistent cache.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Another process holds the advisory lock on the cache.
    #[error("local cache {0} is in use by another process")]
    Locked(PathBuf),

    /// The cache answered, but its refresh from the remote source did not finish.
    #[error("local cache refresh incomplete: {0}")]
    Incomplete(String),

    /// The stored version tag does not match the running schema.
    #[error("local cache version mismatch for table {table}")]
    VersionMismatch { table: String },

    /// No local cache is configured for this session.
    #[error("no local cache configured")]
    Unavailable,

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors from a row source (remote store or snapshot).
#[derive(Debug, Error)]
pub enum SourceError {
    /// The liveness probe could not reach the host.
    #[error("host {0} is unreachable")]
    Unreachable(String),

    /// The source was reached but the query failed.
    #[error("query failed: {0}")]
    Query(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Terminal outcomes of a tiered load.
#[derive(Debug, Error)]
pub enum LoadError {
    /// A source was reachable and ran the query, but nothing matched.
    #[error("no records matched query '{query}'")]
    NoRecordsMatched {
        query: String,
        qualifiers: Vec<String>,
    },

    /// Neither the local cache, the remote source nor the snapshot could be used.
    #[error("no source available for query '{query}'")]
    NoSourceAvailable {
        query: String,
        qualifiers: Vec<String>,
    },

    /// The partial-cache policy chose to abort.
    #[error("load of query '{0}' aborted by policy")]
    Aborted(String),

    /// The background task running the load panicked or was cancelled.
    #[error("load task failed: {0}")]
    TaskFailed(String),
}

impl LoadError {
    /// Informational notes gathered while walking the tiers.
    pub fn qualifiers(&self) -> &[String] {
        match self {
            LoadError::NoRecordsMatched { qualifiers, .. }
            | LoadError::NoSourceAvailable { qualifiers, .. } => qualifiers,
            LoadError::Aborted(_) | LoadError::TaskFailed(_) => &[],
        }
    }
}

/// Errors from the tiled image store.
#[derive(Debug, Error)]
pub enum TileError {
    /// Neither the disk cache nor the source image could produce the tile.
    #[error("tile {tile} of band {band} for {image} is unavailable: {reason}")]
    TileUnavailable {
        image: String,
        band: usize,
        tile: usize,
        reason: String,
    },

    #[error("pixel ({x}, {y}) is outside a {width}x{height} image")]
    OutOfBounds {
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    },

    #[error("band {band} does not exist ({count} bands)")]
    NoSuchBand { band: usize, count: usize },

    #[error("no codec registered for {0}")]
    UnsupportedFormat(PathBuf),

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<image::ImageError> for TileError {
    fn from(err: image::ImageError) -> Self {
        TileError::Decode(err.to_string())
    }
}

/// Errors while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("invalid config: {0}")]
    Json(#[from] serde_json::Error),
}
