/// Horizontal tiling of a band
///
/// Tiles are full-width strips whose height equals the image width (at
/// least one row). The last tile holds whatever rows remain.

use crate::orientation::Orientation;
use crate::raster::codec::Band;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileLayout {
    pub width: u32,
    pub height: u32,
    pub tile_height: u32,
}

impl TileLayout {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            tile_height: width.max(1),
        }
    }

    pub fn tile_count(&self) -> usize {
        self.height.div_ceil(self.tile_height) as usize
    }

    /// Tile containing row `y` of the oriented image
    pub fn tile_of(&self, y: u32) -> usize {
        (y / self.tile_height) as usize
    }

    /// First row and row count of tile `tile`
    pub fn rows(&self, tile: usize) -> Option<(u32, u32)> {
        if tile >= self.tile_count() {
            return None;
        }
        let start = tile as u32 * self.tile_height;
        Some((start, self.tile_height.min(self.height - start)))
    }

    /// Copy tile `tile` out of a native base band, addressing pixels in the
    /// frame given by `orientation`.
    pub fn slice(&self, base: &Band, tile: usize, orientation: Orientation) -> Option<Band> {
        if base.width != self.width || base.height != self.height {
            return None;
        }
        let (start, rows) = self.rows(tile)?;
        let mut samples = Vec::with_capacity(rows as usize * self.width as usize);
        for y in start..start + rows {
            for x in 0..self.width {
                let (nx, ny) = orientation.map_pixel(x, y, self.width, self.height);
                samples.push(base.get(nx, ny)?);
            }
        }
        Some(Band::new(self.width, rows, samples))
    }
}
