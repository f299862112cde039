/// Tiered metadata loader
///
/// Produces the records for a query by trying, in order, the local
/// persistent cache, the remote source and the bundled snapshot. Exactly one
/// tier supplies the records of a load; rows are never merged across tiers.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::catalog::store::fetch_refresh;
use crate::catalog::{LazyCache, SnapshotSource};
use crate::error::{CacheError, LoadError};
use crate::source::{ColumnMeta, RowSet, RowSource};
use crate::stamp::{RowMapper, StampPool, StampRecord};

/// What to do when the cache returned rows but its refresh failed
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PartialCacheChoice {
    /// Keep the cached rows and stop
    #[default]
    AcceptPartial,
    /// Discard the cached rows and query the remote source
    UseRemote,
    /// Fail the whole load
    Abort,
}

/// Decides the partial-cache case. Interactive front ends implement this
/// to ask the user; a fixed `PartialCacheChoice` is the non-interactive policy.
pub trait PartialCacheResolver: Send + Sync {
    fn resolve(&self, query: &QueryDescriptor, partial_rows: usize, reason: &CacheError) -> PartialCacheChoice;
}

impl PartialCacheResolver for PartialCacheChoice {
    fn resolve(&self, _query: &QueryDescriptor, _partial_rows: usize, _reason: &CacheError) -> PartialCacheChoice {
        *self
    }
}

/// The tier that supplied a load's records
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    LocalCache,
    Remote,
    Snapshot,
}

/// A query in every form the tiers understand.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryDescriptor {
    /// Human-readable description shown with the layer
    pub description: String,
    /// Full query for the remote source
    pub remote_query: String,
    /// Filter over the cache table. `None` means the query has no cache form.
    pub cache_filter: Option<String>,
    /// Query fetching rows the cache should merge before answering
    pub refresh_query: Option<String>,
}

impl QueryDescriptor {
    pub fn new(description: impl Into<String>, remote_query: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            remote_query: remote_query.into(),
            cache_filter: None,
            refresh_query: None,
        }
    }

    pub fn with_cache_filter(mut self, filter: impl Into<String>) -> Self {
        self.cache_filter = Some(filter.into());
        self
    }

    pub fn with_refresh_query(mut self, query: impl Into<String>) -> Self {
        self.refresh_query = Some(query.into());
        self
    }

    /// Key under which equivalent queries share a layer.
    ///
    /// The description is not part of it; two queries that ask for the same
    /// rows are the same query.
    pub fn signature(&self) -> String {
        format!(
            "{}\u{1f}{}\u{1f}{}",
            self.remote_query,
            self.cache_filter.as_deref().unwrap_or(""),
            self.refresh_query.as_deref().unwrap_or(""),
        )
    }
}

/// Records produced by a successful load
#[derive(Debug, Clone)]
pub struct LoadOutcome {
    pub records: Vec<Arc<StampRecord>>,
    pub columns: Arc<Vec<ColumnMeta>>,
    pub source: SourceKind,
    /// Informational notes, e.g. that the cache was locked
    pub qualifiers: Vec<String>,
}

struct CacheAttempt {
    rows: RowSet,
    refresh_error: Option<CacheError>,
}

#[derive(Clone)]
pub struct TieredLoader {
    cache: Option<Arc<LazyCache>>,
    remote: Option<Arc<dyn RowSource>>,
    snapshot: Option<SnapshotSource>,
    pool: Arc<StampPool>,
    mapper: Arc<dyn RowMapper>,
    resolver: Arc<dyn PartialCacheResolver>,
    network_permitted: bool,
}

impl TieredLoader {
    pub fn new(pool: Arc<StampPool>, mapper: Arc<dyn RowMapper>) -> Self {
        Self {
            cache: None,
            remote: None,
            snapshot: None,
            pool,
            mapper,
            resolver: Arc::new(PartialCacheChoice::AcceptPartial),
            network_permitted: true,
        }
    }

    pub fn with_cache(mut self, cache: Arc<LazyCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_remote(mut self, remote: Arc<dyn RowSource>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn with_snapshot(mut self, snapshot: SnapshotSource) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn PartialCacheResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn network_permitted(mut self, permitted: bool) -> Self {
        self.network_permitted = permitted;
        self
    }

    fn usable_remote(&self) -> Option<&Arc<dyn RowSource>> {
        self.remote.as_ref().filter(|_| self.network_permitted)
    }

    /// Load the records for `query`.
    ///
    /// Blocks on disk and network IO; call from a worker thread or use
    /// `load_async`.
    pub fn load(&self, query: &QueryDescriptor) -> Result<LoadOutcome, LoadError> {
        let mut qualifiers = Vec::new();
        // Some tier ran the query, even if it matched nothing
        let mut reachable = false;

        if let (Some(filter), Some(cache)) = (&query.cache_filter, &self.cache) {
            match self.query_cache(cache, filter, query) {
                Ok(CacheAttempt {
                    rows,
                    refresh_error: None,
                }) => {
                    reachable = true;
                    let records = self.map_rows(&rows);
                    if !records.is_empty() {
                        return Ok(self.finish(query, records, rows, SourceKind::LocalCache, qualifiers));
                    }
                    debug!(query = %query.description, "Local cache has no matching rows");
                }
                Ok(CacheAttempt {
                    rows,
                    refresh_error: Some(reason),
                }) => {
                    reachable = true;
                    qualifiers.push(format!("local cache incomplete: {}", reason));
                    let records = self.map_rows(&rows);
                    if !records.is_empty() {
                        match self.resolver.resolve(query, records.len(), &reason) {
                            PartialCacheChoice::AcceptPartial => {
                                info!(
                                    query = %query.description,
                                    records = records.len(),
                                    "Accepting partial local cache results"
                                );
                                return Ok(self.finish(query, records, rows, SourceKind::LocalCache, qualifiers));
                            }
                            PartialCacheChoice::UseRemote => {
                                info!(query = %query.description, "Discarding partial cache results");
                            }
                            PartialCacheChoice::Abort => {
                                warn!(query = %query.description, "Load aborted after partial cache results");
                                return Err(LoadError::Aborted(query.description.clone()));
                            }
                        }
                    }
                }
                Err(e) => {
                    // Locked, corrupt or missing: degrade to the remote source
                    warn!(query = %query.description, error = %e, "Local cache unavailable");
                    qualifiers.push(format!("local cache unavailable: {}", e));
                }
            }
        }

        match self.usable_remote() {
            Some(remote) => match remote.execute(&query.remote_query) {
                Ok(rows) => {
                    reachable = true;
                    let records = self.map_rows(&rows);
                    if !records.is_empty() {
                        return Ok(self.finish(query, records, rows, SourceKind::Remote, qualifiers));
                    }
                    debug!(query = %query.description, source = remote.name(), "Remote query matched nothing");
                }
                Err(e) => {
                    warn!(query = %query.description, source = remote.name(), error = %e, "Remote query failed");
                    qualifiers.push(format!("{}: {}", remote.name(), e));
                }
            },
            None if self.remote.is_some() => qualifiers.push("network access disabled".to_string()),
            None => {}
        }

        if let (Some(filter), Some(snapshot)) = (&query.cache_filter, &self.snapshot) {
            if snapshot.is_present() {
                match snapshot.query(filter) {
                    Ok(rows) => {
                        reachable = true;
                        let records = self.map_rows(&rows);
                        if !records.is_empty() {
                            return Ok(self.finish(query, records, rows, SourceKind::Snapshot, qualifiers));
                        }
                    }
                    Err(e) => {
                        warn!(path = %snapshot.path().display(), error = %e, "Snapshot query failed");
                        qualifiers.push(format!("snapshot: {}", e));
                    }
                }
            }
        }

        if reachable {
            info!(query = %query.description, "Query matched no records");
            Err(LoadError::NoRecordsMatched {
                query: query.description.clone(),
                qualifiers,
            })
        } else {
            warn!(query = %query.description, ?qualifiers, "No source available");
            Err(LoadError::NoSourceAvailable {
                query: query.description.clone(),
                qualifiers,
            })
        }
    }

    /// `load` on the blocking thread pool
    pub async fn load_async(&self, query: QueryDescriptor) -> Result<LoadOutcome, LoadError> {
        let loader = self.clone();
        tokio::task::spawn_blocking(move || loader.load(&query))
            .await
            .map_err(|e| LoadError::TaskFailed(e.to_string()))?
    }

    fn query_cache(
        &self,
        cache: &LazyCache,
        filter: &str,
        query: &QueryDescriptor,
    ) -> Result<CacheAttempt, CacheError> {
        let Some((refresh_query, remote)) = query.refresh_query.as_deref().zip(self.usable_remote()) else {
            let rows = cache.with_cache(|local| local.query(filter))?;
            return Ok(CacheAttempt {
                rows,
                refresh_error: None,
            });
        };

        // Open (or fail on) the cache before spending a remote round trip
        cache.with_cache(|_| Ok(()))?;
        // No cache lock held across the remote query
        let fetched = fetch_refresh(remote.as_ref(), refresh_query);
        cache.with_cache(|local| {
            let refresh_error = match fetched.and_then(|rows| local.merge_refresh(&rows)) {
                Ok(merged) => {
                    debug!(merged, "Local cache refreshed");
                    None
                }
                Err(e) => {
                    warn!(error = %e, "Local cache refresh failed");
                    Some(e)
                }
            };
            let rows = local.query(filter)?;
            Ok(CacheAttempt { rows, refresh_error })
        })
    }

    fn map_rows(&self, rows: &RowSet) -> Vec<Arc<StampRecord>> {
        rows.rows
            .iter()
            .filter_map(|row| self.mapper.map_row(row))
            .map(|record| self.pool.intern(record))
            .collect()
    }

    fn finish(
        &self,
        query: &QueryDescriptor,
        records: Vec<Arc<StampRecord>>,
        rows: RowSet,
        source: SourceKind,
        qualifiers: Vec<String>,
    ) -> LoadOutcome {
        info!(
            query = %query.description,
            records = records.len(),
            ?source,
            "Load complete"
        );
        LoadOutcome {
            records,
            columns: rows.columns,
            source,
            qualifiers,
        }
    }
}

impl std::fmt::Debug for TieredLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredLoader")
            .field("cache", &self.cache)
            .field("remote", &self.remote.as_ref().map(|r| r.name().to_string()))
            .field("snapshot", &self.snapshot)
            .field("network_permitted", &self.network_permitted)
            .finish()
    }
}
