use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};

use super::store::LocalCache;
use crate::config::CacheSchema;
use crate::error::CacheError;

/// The local cache, opened on first use and shared by the whole session.
///
/// All access goes through one mutex, so the SQLite connection is never
/// used from two threads at once. A failed open is not remembered: a cache
/// that was locked by another process is retried on the next call.
pub struct LazyCache {
    db_path: PathBuf,
    schema: CacheSchema,
    snapshot: Option<PathBuf>,
    state: Mutex<Option<LocalCache>>,
}

impl LazyCache {
    pub fn new(db_path: impl Into<PathBuf>, schema: CacheSchema, snapshot: Option<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            schema,
            snapshot,
            state: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    pub fn schema(&self) -> &CacheSchema {
        &self.schema
    }

    pub fn snapshot_path(&self) -> Option<&Path> {
        self.snapshot.as_deref()
    }

    /// Run `f` against the open cache, opening it first if needed.
    pub fn with_cache<R>(
        &self,
        f: impl FnOnce(&mut LocalCache) -> Result<R, CacheError>,
    ) -> Result<R, CacheError> {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_none() {
            *guard = Some(self.open()?);
        }
        let cache = guard.as_mut().ok_or(CacheError::Unavailable)?;
        f(cache)
    }

    fn open(&self) -> Result<LocalCache, CacheError> {
        let mut cache = LocalCache::open(&self.db_path, self.schema.clone())?;
        if let Some(snapshot) = &self.snapshot {
            // A broken snapshot must not make the cache itself unusable
            if let Err(e) = cache.import_snapshot(snapshot) {
                warn!(path = %snapshot.display(), error = %e, "Snapshot import failed");
            }
        }
        Ok(cache)
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().map(|s| s.is_some()).unwrap_or(false)
    }

    /// Close the connection and release the advisory lock
    pub fn close(&self) {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if guard.take().is_some() {
            info!(path = %self.db_path.display(), "Local cache closed");
        }
    }
}

impl std::fmt::Debug for LazyCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazyCache")
            .field("db_path", &self.db_path)
            .field("open", &self.is_open())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opens_on_first_use() {
        let dir = tempfile::tempdir().unwrap();
        let lazy = LazyCache::new(dir.path().join("c.db"), CacheSchema::default(), None);
        assert!(!lazy.is_open());
        assert_eq!(lazy.with_cache(|c| c.row_count()).unwrap(), 0);
        assert!(lazy.is_open());

        lazy.close();
        assert!(!lazy.is_open());
    }

    #[test]
    fn test_locked_open_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.db");
        let holder = LocalCache::open(&path, CacheSchema::default()).unwrap();

        let lazy = LazyCache::new(&path, CacheSchema::default(), None);
        assert!(matches!(lazy.with_cache(|c| c.row_count()), Err(CacheError::Locked(_))));
        assert!(!lazy.is_open());

        drop(holder);
        assert!(lazy.with_cache(|c| c.row_count()).is_ok());
    }
}
