/// Tiled image access
///
/// This module handles:
/// - Format codecs and their registry (codec.rs)
/// - Tile geometry (tile.rs)
/// - The on-disk tile cache (disk.rs)
/// - Per-image tile stores (store.rs)
/// - The session-wide cache of stores (`ImageCache`, below)

pub mod codec;
pub mod disk;
pub mod store;
pub mod tile;

pub use codec::{Band, FormatRegistry, RasterCodec, RawSensorCodec, StandardCodec};
pub use store::{FrameGenerations, FrameInvalidator, TiledImageStore};
pub use tile::TileLayout;

use dashmap::DashMap;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use crate::error::TileError;

/// Tile stores keyed by image id, shared by every view in a session
pub struct ImageCache {
    formats: FormatRegistry,
    tile_dir: PathBuf,
    persist_tiles: bool,
    invalidator: Option<Arc<dyn FrameInvalidator>>,
    stores: DashMap<String, Arc<TiledImageStore>>,
}

impl ImageCache {
    pub fn new(formats: FormatRegistry, tile_dir: impl Into<PathBuf>, persist_tiles: bool) -> Self {
        Self {
            formats,
            tile_dir: tile_dir.into(),
            persist_tiles,
            invalidator: None,
            stores: DashMap::new(),
        }
    }

    pub fn with_invalidator(mut self, invalidator: Arc<dyn FrameInvalidator>) -> Self {
        self.invalidator = Some(invalidator);
        self
    }

    pub fn tile_dir(&self) -> &Path {
        &self.tile_dir
    }

    /// Store for `id`, created with the codec matching `source`
    pub fn get_or_open(&self, id: &str, source: &Path) -> Result<Arc<TiledImageStore>, TileError> {
        if let Some(existing) = self.stores.get(id) {
            return Ok(Arc::clone(existing.value()));
        }

        let codec = self.formats.codec_for(source)?;
        let mut store = TiledImageStore::new(id, source, codec, &self.tile_dir).with_persist_tiles(self.persist_tiles);
        if let Some(invalidator) = &self.invalidator {
            store = store.with_invalidator(Arc::clone(invalidator));
        }

        let entry = self.stores.entry(id.to_string()).or_insert_with(|| Arc::new(store));
        Ok(Arc::clone(entry.value()))
    }

    pub fn get(&self, id: &str) -> Option<Arc<TiledImageStore>> {
        self.stores.get(id).map(|s| Arc::clone(s.value()))
    }

    pub fn len(&self) -> usize {
        self.stores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }

    /// Release the resident bands of every store not in `visible`.
    /// Returns how many stores were released.
    pub fn release_except(&self, visible: &HashSet<String>) -> usize {
        let targets: Vec<Arc<TiledImageStore>> = self
            .stores
            .iter()
            .filter(|entry| !visible.contains(entry.key()) && entry.value().resident_bytes() > 0)
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        for store in &targets {
            store.release_all(false);
        }
        if !targets.is_empty() {
            info!(released = targets.len(), "Released offscreen images");
        }
        targets.len()
    }

    /// Decoded bytes held across all stores
    pub fn resident_bytes(&self) -> usize {
        self.stores.iter().map(|entry| entry.value().resident_bytes()).sum()
    }

    /// Forget a store entirely
    pub fn remove(&self, id: &str) -> Option<Arc<TiledImageStore>> {
        self.stores.remove(id).map(|(_, store)| store)
    }
}

impl std::fmt::Debug for ImageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageCache")
            .field("tile_dir", &self.tile_dir)
            .field("stores", &self.stores.len())
            .finish()
    }
}
