/// Session context
///
/// Owns everything that lives for one viewing session: the record pool,
/// the layer registry, the liveness probe, the local cache, the image cache
/// and the debounced state writer. Views handed out by `open_layer` keep
/// their layer in use for as long as the caller holds them.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::{debug, info, warn};

use crate::catalog::{LazyCache, RecordState, SnapshotSource};
use crate::config::CacheConfig;
use crate::error::{CacheError, LoadError, TileError};
use crate::flush::{DebouncedWriter, StateSink};
use crate::layer::StampLayer;
use crate::loader::{PartialCacheResolver, QueryDescriptor, TieredLoader};
use crate::raster::{FormatRegistry, FrameGenerations, FrameInvalidator, ImageCache, TiledImageStore};
use crate::registry::LayerRegistry;
use crate::source::{HostProbe, RemoteSource, RowSource};
use crate::stamp::{ActiveProjection, CornerColumns, ProjectionKind, RowMapper, StampPool, StampRecord};

/// A caller's handle on a layer. While it is alive the layer is in use
/// and cannot be evicted.
#[derive(Debug)]
pub struct LayerView {
    layer: Arc<StampLayer>,
    visible_images: Mutex<HashSet<String>>,
}

impl LayerView {
    fn new(layer: Arc<StampLayer>) -> Self {
        Self {
            layer,
            visible_images: Mutex::new(HashSet::new()),
        }
    }

    pub fn layer(&self) -> &Arc<StampLayer> {
        &self.layer
    }

    pub fn records(&self) -> Vec<Arc<StampRecord>> {
        self.layer.records()
    }

    /// Image ids this view currently draws
    pub fn set_visible_images<I: IntoIterator<Item = String>>(&self, ids: I) {
        let mut visible = self.visible_images.lock().unwrap_or_else(|e| e.into_inner());
        *visible = ids.into_iter().collect();
    }

    pub fn visible_images(&self) -> HashSet<String> {
        self.visible_images.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Figures reported by `Session::cache_stats`
#[derive(Debug, Clone, PartialEq)]
pub struct CacheStats {
    pub rows: i64,
    pub snapshot_attached: bool,
    pub rebuilt: bool,
    pub last_refresh: Option<DateTime<Utc>>,
}

pub struct Session {
    config: CacheConfig,
    pool: Arc<StampPool>,
    probe: Arc<HostProbe>,
    cache: Arc<LazyCache>,
    images: ImageCache,
    frames: Arc<FrameGenerations>,
    registry: LayerRegistry,
    remote: Option<Arc<dyn RowSource>>,
    mapper: Arc<dyn RowMapper>,
    resolver: Arc<dyn PartialCacheResolver>,
    views: Mutex<Vec<Weak<LayerView>>>,
    projection: Mutex<ActiveProjection>,
    flusher: Option<DebouncedWriter>,
}

impl Session {
    pub fn new(config: CacheConfig) -> Self {
        let probe = Arc::new(HostProbe::new(config.probe_timeout()));
        let cache = Arc::new(LazyCache::new(
            config.db_path(),
            config.schema.clone(),
            config.snapshot_path.clone(),
        ));
        let frames = Arc::new(FrameGenerations::new());
        let images = ImageCache::new(FormatRegistry::with_defaults(), &config.tile_cache_dir, config.persist_tiles)
            .with_invalidator(Arc::clone(&frames) as Arc<dyn FrameInvalidator>);

        info!(
            db = %config.db_path().display(),
            tiles = %config.tile_cache_dir.display(),
            "Session opened"
        );

        Self {
            pool: Arc::new(StampPool::new()),
            probe,
            cache,
            images,
            frames,
            registry: LayerRegistry::new(config.layer_capacity),
            remote: None,
            mapper: Arc::new(CornerColumns::default()),
            resolver: Arc::new(config.partial_cache),
            views: Mutex::new(Vec::new()),
            projection: Mutex::new(ActiveProjection::default()),
            flusher: None,
            config,
        }
    }

    /// Connector for the remote store. Queries go through the liveness probe
    /// when the configuration names a host.
    pub fn with_remote(mut self, connector: Arc<dyn RowSource>) -> Self {
        self.remote = Some(Arc::new(RemoteSource::new(
            connector,
            self.config.remote_host.clone(),
            Arc::clone(&self.probe),
        )));
        self
    }

    pub fn with_mapper(mut self, mapper: Arc<dyn RowMapper>) -> Self {
        self.mapper = mapper;
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn PartialCacheResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Image codecs to use instead of the defaults
    pub fn with_formats(mut self, formats: FormatRegistry) -> Self {
        self.images = ImageCache::new(formats, &self.config.tile_cache_dir, self.config.persist_tiles)
            .with_invalidator(Arc::clone(&self.frames) as Arc<dyn FrameInvalidator>);
        self
    }

    /// Start the debounced state writer. Must be called inside a tokio runtime.
    pub fn start_flusher(&mut self) {
        if self.flusher.is_none() {
            let sink: Arc<dyn StateSink> = Arc::clone(&self.cache) as Arc<dyn StateSink>;
            self.flusher = Some(DebouncedWriter::spawn(sink, self.config.flush_quiescence()));
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<StampPool> {
        &self.pool
    }

    pub fn probe(&self) -> &Arc<HostProbe> {
        &self.probe
    }

    pub fn cache(&self) -> &Arc<LazyCache> {
        &self.cache
    }

    pub fn images(&self) -> &ImageCache {
        &self.images
    }

    /// Frame generations bumped when a band is released with `erase_frames`
    pub fn frames(&self) -> &Arc<FrameGenerations> {
        &self.frames
    }

    pub fn registry(&self) -> &LayerRegistry {
        &self.registry
    }

    /// A loader wired to this session's tiers
    pub fn loader(&self) -> TieredLoader {
        let mut loader = TieredLoader::new(Arc::clone(&self.pool), Arc::clone(&self.mapper))
            .with_cache(Arc::clone(&self.cache))
            .with_resolver(Arc::clone(&self.resolver))
            .network_permitted(self.config.network_permitted);
        if let Some(remote) = &self.remote {
            loader = loader.with_remote(Arc::clone(remote));
        }
        if let Some(path) = &self.config.snapshot_path {
            loader = loader.with_snapshot(SnapshotSource::new(path, self.config.schema.clone()));
        }
        loader
    }

    fn lock_views(&self) -> MutexGuard<'_, Vec<Weak<LayerView>>> {
        self.views.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn live_views(&self) -> Vec<Arc<LayerView>> {
        let mut views = self.lock_views();
        views.retain(|v| v.strong_count() > 0);
        views.iter().filter_map(Weak::upgrade).collect()
    }

    fn signatures_of(views: &[Weak<LayerView>]) -> HashSet<String> {
        views
            .iter()
            .filter_map(Weak::upgrade)
            .map(|v| v.layer().signature().to_string())
            .collect()
    }

    /// Signatures of layers referenced by live views
    pub fn in_use(&self) -> HashSet<String> {
        Self::signatures_of(&self.lock_views())
    }

    /// Load (or reuse) the layer for `descriptor` and hand out a view on it.
    ///
    /// Unused layers beyond the registry capacity are evicted afterwards.
    pub fn open_layer(&self, descriptor: QueryDescriptor) -> Result<Arc<LayerView>, LoadError> {
        let signature = descriptor.signature();
        let loader = self.loader();
        let view = {
            let _pin = self.registry.pin(&signature);
            let layer = self
                .registry
                .get_or_create(&signature, || StampLayer::load(descriptor, &loader))?;
            let view = Arc::new(LayerView::new(layer));
            self.lock_views().push(Arc::downgrade(&view));
            view
        };
        self.evict_unused();
        Ok(view)
    }

    /// Run the tiered load again for the layer behind `view`
    pub fn reload(&self, view: &LayerView) -> Result<usize, LoadError> {
        view.layer().reload(&self.loader())
    }

    /// Evict unused layers beyond capacity
    pub fn evict_unused(&self) -> Vec<String> {
        // Views stay locked so none is registered between the scan and the eviction
        let mut views = self.lock_views();
        views.retain(|v| v.strong_count() > 0);
        let evicted = self.registry.evict_excess(&Self::signatures_of(&views));
        drop(views);
        if !evicted.is_empty() {
            debug!(count = evicted.len(), "Evicted layers");
        }
        evicted
    }

    pub fn projection(&self) -> ActiveProjection {
        *self.projection.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Switch projection. Derived geometry of every pooled record is dropped
    /// and recomputed lazily under the new generation.
    pub fn set_projection(&self, kind: ProjectionKind) -> ActiveProjection {
        let next = {
            let mut projection = self.projection.lock().unwrap_or_else(|e| e.into_inner());
            *projection = projection.switch_to(kind);
            *projection
        };
        self.pool.invalidate_all();
        info!(generation = next.generation, ?kind, "Projection changed");
        next
    }

    /// Tile store for an image, created on first use
    pub fn open_image(&self, id: &str, source: &Path) -> Result<Arc<TiledImageStore>, TileError> {
        self.images.get_or_open(id, source)
    }

    /// Release images that no live view shows. Returns how many were released.
    pub fn release_offscreen(&self) -> usize {
        let visible: HashSet<String> = self
            .live_views()
            .iter()
            .flat_map(|v| v.visible_images())
            .collect();
        self.images.release_except(&visible)
    }

    /// Persist a per-record state edit, debounced when the flusher runs
    pub fn record_state(&self, state: RecordState) -> Result<(), CacheError> {
        match &self.flusher {
            Some(flusher) if flusher.record(state.clone()) => Ok(()),
            _ => self.cache.write_batch(&[state]),
        }
    }

    /// Write pending state edits now
    pub async fn flush_now(&self) -> usize {
        match &self.flusher {
            Some(flusher) => flusher.flush_now().await,
            None => 0,
        }
    }

    /// Open the local cache (importing the bundled snapshot) and report on it
    pub fn cache_stats(&self) -> Result<CacheStats, CacheError> {
        self.cache.with_cache(|cache| {
            Ok(CacheStats {
                rows: cache.row_count()?,
                snapshot_attached: cache.has_overlay(),
                rebuilt: cache.was_rebuilt(),
                last_refresh: cache.last_refresh()?,
            })
        })
    }

    /// Drain the state writer and close the local cache
    pub async fn shutdown(&self) {
        if let Some(flusher) = &self.flusher {
            let written = flusher.shutdown().await;
            debug!(written, "State writer drained");
        }
        self.cache.close();
        let released = self.images.release_except(&HashSet::new());
        if released > 0 {
            warn!(released, "Images still resident at shutdown");
        }
        info!("Session closed");
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("images", &self.images)
            .finish()
    }
}
