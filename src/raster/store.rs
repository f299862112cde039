/// Memory-bounded, disk-backed tile store for one image
///
/// Pixels are read from the full base band when it is resident, otherwise
/// from a tile. A missing tile comes from the disk cache if a file with the
/// right dimensions exists, or is sliced from the base band, which is itself
/// loaded from disk or decoded on demand. The native image size is kept in
/// a `.dims` file so a later store can read cached tiles without probing
/// the source.

use dashmap::DashMap;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task;
use tracing::{debug, info, warn};

use crate::error::TileError;
use crate::orientation::Orientation;
use crate::raster::codec::{Band, RasterCodec};
use crate::raster::disk;
use crate::raster::tile::TileLayout;

/// Invalidates rendered output derived from a band.
pub trait FrameInvalidator: Send + Sync {
    fn invalidate_frames(&self, image_id: &str, band: usize);
}

/// Per-band frame generations.
///
/// Invalidating bumps the generation of one image band; a renderer holding
/// frames built at an older generation redraws them. Tile files on disk are
/// not touched.
#[derive(Debug, Default)]
pub struct FrameGenerations {
    generations: DashMap<(String, usize), u64>,
}

impl FrameGenerations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generation(&self, image_id: &str, band: usize) -> u64 {
        self.generations
            .get(&(image_id.to_string(), band))
            .map_or(0, |generation| *generation)
    }
}

impl FrameInvalidator for FrameGenerations {
    fn invalidate_frames(&self, image_id: &str, band: usize) {
        let mut generation = self.generations.entry((image_id.to_string(), band)).or_insert(0);
        *generation += 1;
        debug!(image_id, band, generation = *generation, "Frames invalidated");
    }
}

#[derive(Default)]
struct BandState {
    base: Option<Arc<Band>>,
    tiles: HashMap<usize, Arc<Band>>,
}

impl BandState {
    fn resident_bytes(&self) -> usize {
        self.base.as_ref().map_or(0, |b| b.size_bytes()) + self.tiles.values().map(|t| t.size_bytes()).sum::<usize>()
    }
}

#[derive(Default)]
struct StoreState {
    orientation: Orientation,
    dimensions: Option<(u32, u32)>,
    bands: HashMap<usize, BandState>,
}

pub struct TiledImageStore {
    id: String,
    source: PathBuf,
    codec: Arc<dyn RasterCodec>,
    tile_dir: PathBuf,
    persist_tiles: bool,
    invalidator: Option<Arc<dyn FrameInvalidator>>,
    /// Held across decodes so a band is decoded at most once while resident
    state: Mutex<StoreState>,
    decode_count: AtomicUsize,
    tile_load_count: AtomicUsize,
}

impl TiledImageStore {
    pub fn new(
        id: impl Into<String>,
        source: impl Into<PathBuf>,
        codec: Arc<dyn RasterCodec>,
        tile_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            codec,
            tile_dir: tile_dir.into(),
            persist_tiles: true,
            invalidator: None,
            state: Mutex::new(StoreState::default()),
            decode_count: AtomicUsize::new(0),
            tile_load_count: AtomicUsize::new(0),
        }
    }

    pub fn with_persist_tiles(mut self, persist: bool) -> Self {
        self.persist_tiles = persist;
        self
    }

    pub fn with_invalidator(mut self, invalidator: Arc<dyn FrameInvalidator>) -> Self {
        self.invalidator = Some(invalidator);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Full-band decodes performed so far
    pub fn decode_count(&self) -> usize {
        self.decode_count.load(Ordering::Relaxed)
    }

    /// Tiles read back from the disk cache so far
    pub fn tile_load_count(&self) -> usize {
        self.tile_load_count.load(Ordering::Relaxed)
    }

    pub fn orientation(&self) -> Orientation {
        self.lock().orientation
    }

    /// Change the frame tiles are sliced in. Resident tiles of the old
    /// frame are dropped; base bands are native and stay.
    pub fn set_orientation(&self, orientation: Orientation) {
        let mut state = self.lock();
        if state.orientation == orientation {
            return;
        }
        for band in state.bands.values_mut() {
            band.tiles.clear();
        }
        state.orientation = orientation;
        debug!(id = %self.id, orientation = orientation.label(), "Orientation changed");
    }

    pub fn dimensions(&self) -> Result<(u32, u32), TileError> {
        let mut state = self.lock();
        self.dimensions_locked(&mut state)
    }

    fn dimensions_locked(&self, state: &mut StoreState) -> Result<(u32, u32), TileError> {
        if let Some(dims) = self.known_dimensions(state) {
            return Ok(dims);
        }
        let dims = self.codec.probe_dimensions(&self.source)?;
        self.remember_dimensions(state, dims);
        Ok(dims)
    }

    /// Dimensions already resident or recorded on disk, without probing
    fn known_dimensions(&self, state: &mut StoreState) -> Option<(u32, u32)> {
        if state.dimensions.is_some() {
            return state.dimensions;
        }
        let path = disk::dims_path(&self.tile_dir, &self.id);
        match disk::read_dimensions(&path) {
            Ok(Some(dims)) => {
                state.dimensions = Some(dims);
                Some(dims)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring unreadable dimensions file");
                None
            }
        }
    }

    fn remember_dimensions(&self, state: &mut StoreState, dims: (u32, u32)) {
        state.dimensions = Some(dims);
        if self.persist_tiles {
            self.persist_dimensions(dims);
        }
    }

    fn persist_dimensions(&self, (width, height): (u32, u32)) {
        let path = disk::dims_path(&self.tile_dir, &self.id);
        if let Err(e) = disk::write_dimensions(&path, width, height) {
            warn!(path = %path.display(), error = %e, "Failed to persist dimensions");
        }
    }

    pub fn layout(&self) -> Result<TileLayout, TileError> {
        let (width, height) = self.dimensions()?;
        Ok(TileLayout::new(width, height))
    }

    pub fn is_base_resident(&self, band: usize) -> bool {
        self.lock().bands.get(&band).is_some_and(|b| b.base.is_some())
    }

    pub fn has_tile(&self, band: usize, tile: usize) -> bool {
        self.lock().bands.get(&band).is_some_and(|b| b.tiles.contains_key(&tile))
    }

    /// Bytes of decoded samples currently held
    pub fn resident_bytes(&self) -> usize {
        self.lock().bands.values().map(BandState::resident_bytes).sum()
    }

    fn unavailable(&self, band: usize, tile: usize, reason: impl ToString) -> TileError {
        TileError::TileUnavailable {
            image: self.id.clone(),
            band,
            tile,
            reason: reason.to_string(),
        }
    }

    /// Sample at `(x, y)` of the oriented image.
    pub fn get_pixel(&self, band: usize, x: u32, y: u32) -> Result<u16, TileError> {
        let tile_height = {
            let mut state = self.lock();
            let (width, height) = self
                .dimensions_locked(&mut state)
                .map_err(|e| self.unavailable(band, 0, e))?;
            if x >= width || y >= height {
                return Err(TileError::OutOfBounds { x, y, width, height });
            }
            let orientation = state.orientation;
            if let Some(base) = state.bands.get(&band).and_then(|b| b.base.as_ref()) {
                let (nx, ny) = orientation.map_pixel(x, y, width, height);
                return base.get(nx, ny).ok_or(TileError::OutOfBounds { x, y, width, height });
            }
            TileLayout::new(width, height).tile_height
        };

        let tile_index = (y / tile_height) as usize;
        let tile = self.ensure_tile(band, tile_index)?;
        let local_y = y - tile_index as u32 * tile_height;
        tile.get(x, local_y)
            .ok_or_else(|| self.unavailable(band, tile_index, "tile is smaller than expected"))
    }

    /// Make tile `tile` of `band` resident and return it.
    pub fn ensure_tile(&self, band: usize, tile: usize) -> Result<Arc<Band>, TileError> {
        let mut state = self.lock();
        if let Some(existing) = state.bands.get(&band).and_then(|b| b.tiles.get(&tile)) {
            return Ok(Arc::clone(existing));
        }

        let (width, height) = self
            .dimensions_locked(&mut state)
            .map_err(|e| self.unavailable(band, tile, e))?;
        let layout = TileLayout::new(width, height);
        let (_, rows) = layout
            .rows(tile)
            .ok_or_else(|| self.unavailable(band, tile, "no such tile"))?;
        let orientation = state.orientation;
        let path = disk::tile_path(&self.tile_dir, &self.id, band, Some(tile), orientation);

        if let Some(cached) = self.read_disk_band(&path, width, rows) {
            self.tile_load_count.fetch_add(1, Ordering::Relaxed);
            let cached = Arc::new(cached);
            state.bands.entry(band).or_default().tiles.insert(tile, Arc::clone(&cached));
            return Ok(cached);
        }

        let base = self
            .force_base(&mut state, band)
            .map_err(|e| self.unavailable(band, tile, e))?;
        if state.dimensions != Some((width, height)) {
            return Err(self.unavailable(band, tile, "source dimensions changed"));
        }
        let sliced = self
            .codec
            .slice_tile(&base, &layout, tile, orientation)
            .ok_or_else(|| self.unavailable(band, tile, "base band does not match image dimensions"))?;
        if self.persist_tiles {
            if let Err(e) = self.codec.persist_tile(&path, &sliced) {
                warn!(id = %self.id, band, tile, error = %e, "Failed to persist tile");
            }
        }

        let sliced = Arc::new(sliced);
        state.bands.entry(band).or_default().tiles.insert(tile, Arc::clone(&sliced));
        Ok(sliced)
    }

    /// Make the full base band resident.
    pub fn load_band(&self, band: usize) -> Result<Arc<Band>, TileError> {
        let mut state = self.lock();
        self.force_base(&mut state, band)
    }

    pub async fn load_band_async(self: Arc<Self>, band: usize) -> Result<Arc<Band>, TileError> {
        task::spawn_blocking(move || self.load_band(band))
            .await
            .map_err(|e| TileError::Decode(format!("Task join error: {}", e)))?
    }

    /// A disk file with the expected dimensions, or `None`.
    fn read_disk_band(&self, path: &Path, width: u32, height: u32) -> Option<Band> {
        match self.codec.load_tile(path) {
            Ok(Some(band)) if band.width == width && band.height == height => Some(band),
            Ok(Some(band)) => {
                debug!(
                    path = %path.display(),
                    found = ?(band.width, band.height),
                    expected = ?(width, height),
                    "Ignoring tile file with wrong dimensions"
                );
                None
            }
            Ok(None) => None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring unreadable tile file");
                None
            }
        }
    }

    /// The base band of `band`: resident, read from disk, or decoded once.
    ///
    /// The decoded size is authoritative. If it differs from what was known
    /// every resident band is dropped and the new size recorded.
    fn force_base(&self, state: &mut StoreState, band: usize) -> Result<Arc<Band>, TileError> {
        if let Some(base) = state.bands.get(&band).and_then(|b| b.base.as_ref()) {
            return Ok(Arc::clone(base));
        }

        let known = self.known_dimensions(state);
        let path = disk::tile_path(&self.tile_dir, &self.id, band, None, Orientation::Normal);
        let cached = known.and_then(|(width, height)| self.read_disk_band(&path, width, height));
        let base = match cached {
            Some(base) => base,
            None => {
                let decoded = self.codec.decode_band(&self.source, band)?;
                self.decode_count.fetch_add(1, Ordering::Relaxed);
                let dims = (decoded.width, decoded.height);
                if known != Some(dims) {
                    if let Some(previous) = known {
                        warn!(id = %self.id, ?previous, decoded = ?dims, "Source dimensions changed");
                        state.bands.clear();
                    }
                    self.remember_dimensions(state, dims);
                }
                info!(
                    id = %self.id,
                    band,
                    width = dims.0,
                    height = dims.1,
                    codec = self.codec.name(),
                    "Decoded base band"
                );
                decoded
            }
        };

        let base = Arc::new(base);
        state.bands.entry(band).or_default().base = Some(Arc::clone(&base));
        Ok(base)
    }

    /// Write the resident tiles of `band` (and the base band when asked) to
    /// the disk cache. Returns the number of files written.
    pub fn store_to_disk(&self, band: usize, also_store_base: bool) -> Result<usize, TileError> {
        let state = self.lock();
        let Some(resident) = state.bands.get(&band) else {
            return Ok(0);
        };
        if let Some(dims) = state.dimensions {
            self.persist_dimensions(dims);
        }

        let mut written = 0;
        for (tile, data) in &resident.tiles {
            let path = disk::tile_path(&self.tile_dir, &self.id, band, Some(*tile), state.orientation);
            self.codec.persist_tile(&path, data)?;
            written += 1;
        }
        if also_store_base {
            if let Some(base) = &resident.base {
                let path = disk::tile_path(&self.tile_dir, &self.id, band, None, Orientation::Normal);
                self.codec.persist_tile(&path, base)?;
                written += 1;
            }
        }
        debug!(id = %self.id, band, written, "Stored band to disk");
        Ok(written)
    }

    /// Drop the base band and tiles of `band` from memory; files on disk are
    /// kept. With `erase_frames` the invalidator is told to discard derived
    /// output.
    pub fn release(&self, band: usize, erase_frames: bool) {
        let released = self.lock().bands.remove(&band);
        if let Some(released) = released {
            debug!(id = %self.id, band, bytes = released.resident_bytes(), "Released band");
        }
        if erase_frames {
            if let Some(invalidator) = &self.invalidator {
                invalidator.invalidate_frames(&self.id, band);
            }
        }
    }

    /// Release every resident band
    pub fn release_all(&self, erase_frames: bool) {
        let bands: Vec<usize> = self.lock().bands.keys().copied().collect();
        for band in bands {
            self.release(band, erase_frames);
        }
    }
}

impl std::fmt::Debug for TiledImageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TiledImageStore")
            .field("id", &self.id)
            .field("source", &self.source)
            .field("codec", &self.codec.name())
            .field("decode_count", &self.decode_count())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    /// In-memory image: sample = y * width + x + 1000 * band
    pub(crate) struct RampCodec {
        pub width: u32,
        pub height: u32,
        pub bands: usize,
        pub decodes: AtomicUsize,
        pub probes: AtomicUsize,
    }

    impl RampCodec {
        pub(crate) fn new(width: u32, height: u32) -> Arc<Self> {
            Arc::new(Self {
                width,
                height,
                bands: 2,
                decodes: AtomicUsize::new(0),
                probes: AtomicUsize::new(0),
            })
        }

        pub(crate) fn value(&self, band: usize, x: u32, y: u32) -> u16 {
            (y * self.width + x) as u16 + 1000 * band as u16
        }
    }

    impl RasterCodec for RampCodec {
        fn name(&self) -> &'static str {
            "ramp"
        }

        fn probe_dimensions(&self, _path: &Path) -> Result<(u32, u32), TileError> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            Ok((self.width, self.height))
        }

        fn band_count(&self, _path: &Path) -> Result<usize, TileError> {
            Ok(self.bands)
        }

        fn decode_band(&self, _path: &Path, band: usize) -> Result<Band, TileError> {
            if band >= self.bands {
                return Err(TileError::NoSuchBand {
                    band,
                    count: self.bands,
                });
            }
            self.decodes.fetch_add(1, Ordering::SeqCst);
            let mut samples = Vec::new();
            for y in 0..self.height {
                for x in 0..self.width {
                    samples.push(self.value(band, x, y));
                }
            }
            Ok(Band::new(self.width, self.height, samples))
        }
    }

    struct CountingInvalidator(AtomicUsize);

    impl FrameInvalidator for CountingInvalidator {
        fn invalidate_frames(&self, _image_id: &str, _band: usize) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn store(codec: &Arc<RampCodec>, dir: &TempDir) -> TiledImageStore {
        TiledImageStore::new("img/01", "img01.ramp", codec.clone() as Arc<dyn RasterCodec>, dir.path())
    }

    #[test]
    fn test_missing_tile_rebuilt_from_base_and_cached() {
        let dir = TempDir::new().unwrap();
        let codec = RampCodec::new(4, 10);
        let first = store(&codec, &dir);

        let tile = first.ensure_tile(0, 2).unwrap();
        assert_eq!(first.decode_count(), 1);
        assert_eq!(tile.height, 2);
        for y in 0..2 {
            for x in 0..4 {
                assert_eq!(tile.get(x, y), Some(codec.value(0, x, 8 + y)));
            }
        }
        let path = disk::tile_path(dir.path(), "img/01", 0, Some(2), Orientation::Normal);
        assert!(path.exists());

        // A fresh store reads the tile from disk without probing or decoding
        assert_eq!(codec.probes.load(Ordering::SeqCst), 1);
        let second = store(&codec, &dir);
        assert_eq!(second.get_pixel(0, 1, 9).unwrap(), codec.value(0, 1, 9));
        assert_eq!(second.tile_load_count(), 1);
        assert_eq!(second.decode_count(), 0);
        assert_eq!(codec.probes.load(Ordering::SeqCst), 1);
        assert_eq!(codec.decodes.load(Ordering::SeqCst), 1);
        assert!(!second.is_base_resident(0));
    }

    #[test]
    fn test_release_then_read_decodes_again() {
        let dir = TempDir::new().unwrap();
        let codec = RampCodec::new(3, 3);
        let store = store(&codec, &dir).with_persist_tiles(false);

        assert_eq!(store.get_pixel(1, 2, 2).unwrap(), codec.value(1, 2, 2));
        assert_eq!(store.get_pixel(1, 0, 1).unwrap(), codec.value(1, 0, 1));
        assert_eq!(store.decode_count(), 1);

        store.release(1, false);
        assert_eq!(store.resident_bytes(), 0);
        assert_eq!(store.get_pixel(1, 2, 2).unwrap(), codec.value(1, 2, 2));
        assert_eq!(store.decode_count(), 2);
    }

    #[test]
    fn test_load_band_decodes_once_and_records_size() {
        let dir = TempDir::new().unwrap();
        let codec = RampCodec::new(4, 10);
        let store = store(&codec, &dir);

        store.load_band(1).unwrap();
        assert_eq!(codec.decodes.load(Ordering::SeqCst), 1);
        assert_eq!(codec.probes.load(Ordering::SeqCst), 0);
        assert_eq!(store.dimensions().unwrap(), (4, 10));
        assert_eq!(codec.probes.load(Ordering::SeqCst), 0);
        assert_eq!(disk::read_dimensions(&disk::dims_path(dir.path(), "img/01")).unwrap(), Some((4, 10)));
        assert!(matches!(store.load_band(2), Err(TileError::NoSuchBand { band: 2, count: 2 })));
    }

    #[test]
    fn test_changed_source_dimensions_replace_recorded_ones() {
        let dir = TempDir::new().unwrap();
        disk::write_dimensions(&disk::dims_path(dir.path(), "img/01"), 2, 2).unwrap();
        let codec = RampCodec::new(4, 10);
        let store = store(&codec, &dir);

        assert!(matches!(store.ensure_tile(0, 0), Err(TileError::TileUnavailable { .. })));
        assert_eq!(store.dimensions().unwrap(), (4, 10));
        assert_eq!(store.get_pixel(0, 3, 9).unwrap(), codec.value(0, 3, 9));
        assert_eq!(codec.decodes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unreadable_source_is_tile_unavailable() {
        let dir = TempDir::new().unwrap();
        let codec: Arc<dyn RasterCodec> = Arc::new(crate::raster::StandardCodec);
        let store = TiledImageStore::new("gone", dir.path().join("gone.png"), codec, dir.path());
        assert!(matches!(
            store.get_pixel(0, 0, 0),
            Err(TileError::TileUnavailable { band: 0, .. })
        ));
    }

    #[test]
    fn test_base_resident_reads_directly() {
        let dir = TempDir::new().unwrap();
        let codec = RampCodec::new(4, 10);
        let store = store(&codec, &dir);
        store.load_band(0).unwrap();
        assert_eq!(store.get_pixel(0, 3, 9).unwrap(), codec.value(0, 3, 9));
        assert!(!store.has_tile(0, 2));
        assert_eq!(store.resident_bytes(), 4 * 10 * 2);
    }

    #[test]
    fn test_oriented_reads() {
        let dir = TempDir::new().unwrap();
        let codec = RampCodec::new(4, 10);
        let store = store(&codec, &dir);
        store.set_orientation(Orientation::Rotated180);

        assert_eq!(store.get_pixel(0, 0, 0).unwrap(), codec.value(0, 3, 9));
        assert!(disk::tile_path(dir.path(), "img/01", 0, Some(0), Orientation::Rotated180).exists());

        store.set_orientation(Orientation::VFlipped);
        assert!(!store.has_tile(0, 0));
        assert!(store.is_base_resident(0));
        assert_eq!(store.get_pixel(0, 1, 0).unwrap(), codec.value(0, 1, 9));
    }

    #[test]
    fn test_out_of_bounds_and_missing_band() {
        let dir = TempDir::new().unwrap();
        let codec = RampCodec::new(4, 10);
        let store = store(&codec, &dir);
        assert!(matches!(store.get_pixel(0, 4, 0), Err(TileError::OutOfBounds { .. })));
        assert!(matches!(store.get_pixel(0, 0, 10), Err(TileError::OutOfBounds { .. })));
        assert!(matches!(store.get_pixel(5, 0, 0), Err(TileError::TileUnavailable { band: 5, .. })));
        assert!(matches!(store.ensure_tile(0, 3), Err(TileError::TileUnavailable { tile: 3, .. })));
    }

    #[test]
    fn test_corrupt_tile_file_is_rebuilt() {
        let dir = TempDir::new().unwrap();
        let codec = RampCodec::new(4, 10);
        let path = disk::tile_path(dir.path(), "img/01", 0, Some(1), Orientation::Normal);
        std::fs::write(&path, b"garbage").unwrap();

        let store = store(&codec, &dir);
        assert_eq!(store.get_pixel(0, 2, 5).unwrap(), codec.value(0, 2, 5));
        assert_eq!(store.tile_load_count(), 0);
        assert_eq!(store.decode_count(), 1);
        assert!(disk::read_tile(&path).unwrap().is_some());
    }

    #[test]
    fn test_wrong_dimension_tile_is_ignored() {
        let dir = TempDir::new().unwrap();
        let codec = RampCodec::new(4, 10);
        let path = disk::tile_path(dir.path(), "img/01", 0, Some(0), Orientation::Normal);
        disk::write_tile(&path, &Band::new(2, 2, vec![7, 7, 7, 7])).unwrap();

        let store = store(&codec, &dir);
        assert_eq!(store.get_pixel(0, 0, 0).unwrap(), codec.value(0, 0, 0));
        assert_eq!(store.decode_count(), 1);
    }

    #[test]
    fn test_store_to_disk_and_base_reuse() {
        let dir = TempDir::new().unwrap();
        let codec = RampCodec::new(4, 10);
        let first = store(&codec, &dir).with_persist_tiles(false);
        first.ensure_tile(0, 0).unwrap();
        assert_eq!(first.store_to_disk(0, true).unwrap(), 2);
        assert_eq!(first.store_to_disk(1, true).unwrap(), 0);

        // Tile 1 was never persisted but the base file was
        let second = store(&codec, &dir);
        second.ensure_tile(0, 1).unwrap();
        assert_eq!(second.decode_count(), 0);
        assert!(second.is_base_resident(0));
    }

    #[test]
    fn test_release_with_erase_frames() {
        let dir = TempDir::new().unwrap();
        let codec = RampCodec::new(2, 2);
        let invalidator = Arc::new(CountingInvalidator(AtomicUsize::new(0)));
        let store = store(&codec, &dir).with_invalidator(invalidator.clone());

        store.ensure_tile(0, 0).unwrap();
        store.release(0, false);
        assert_eq!(invalidator.0.load(Ordering::SeqCst), 0);
        store.release(0, true);
        assert_eq!(invalidator.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_release_erasing_frames_keeps_tile_files() {
        let dir = TempDir::new().unwrap();
        let codec = RampCodec::new(2, 4);
        let frames = Arc::new(FrameGenerations::new());
        let store = TiledImageStore::new("img_1", "img_1.ramp", codec.clone() as Arc<dyn RasterCodec>, dir.path())
            .with_invalidator(frames.clone());
        let neighbour = TiledImageStore::new("img_1_2", "img_1_2.ramp", codec.clone() as Arc<dyn RasterCodec>, dir.path());

        store.get_pixel(0, 1, 3).unwrap();
        store.get_pixel(1, 1, 3).unwrap();
        neighbour.get_pixel(0, 1, 3).unwrap();
        assert_eq!(store.decode_count(), 2);
        let own = disk::tile_path(dir.path(), "img_1", 0, Some(1), Orientation::Normal);
        let other_band = disk::tile_path(dir.path(), "img_1", 1, Some(1), Orientation::Normal);
        let other_image = disk::tile_path(dir.path(), "img_1_2", 0, Some(1), Orientation::Normal);

        store.release(0, true);
        assert_eq!(frames.generation("img_1", 0), 1);
        assert_eq!(frames.generation("img_1", 1), 0);
        assert_eq!(frames.generation("img_1_2", 0), 0);
        assert!(own.exists());
        assert!(other_band.exists());
        assert!(other_image.exists());
        assert!(!store.has_tile(0, 1));
        assert!(store.has_tile(1, 1));

        // The released band is loaded again, from its tile file
        assert_eq!(store.get_pixel(0, 1, 3).unwrap(), codec.value(0, 1, 3));
        assert_eq!(store.tile_load_count(), 1);
        assert_eq!(store.decode_count(), 2);
        assert!(!store.is_base_resident(0));
    }

    #[tokio::test]
    async fn test_load_band_async() {
        let dir = TempDir::new().unwrap();
        let codec = RampCodec::new(3, 2);
        let store = Arc::new(store(&codec, &dir));
        let band = Arc::clone(&store).load_band_async(1).await.unwrap();
        assert_eq!(band.get(2, 1), Some(codec.value(1, 2, 1)));
        assert!(store.is_base_resident(1));
    }
}
