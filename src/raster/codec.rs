/// Raster codecs
///
/// A codec knows how to probe and decode one family of image files into
/// 16-bit sample bands. Tile slicing and tile persistence have default
/// implementations shared by every format.

use dashmap::DashMap;
use image::ImageDecoder;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::error::TileError;
use crate::orientation::Orientation;
use crate::raster::disk;
use crate::raster::tile::TileLayout;

/// One decoded band (or a slice of one), row-major
#[derive(Debug, Clone, PartialEq)]
pub struct Band {
    pub width: u32,
    pub height: u32,
    pub samples: Vec<u16>,
}

impl Band {
    pub fn new(width: u32, height: u32, samples: Vec<u16>) -> Self {
        Self {
            width,
            height,
            samples,
        }
    }

    pub fn get(&self, x: u32, y: u32) -> Option<u16> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.samples.get(y as usize * self.width as usize + x as usize).copied()
    }

    /// Bytes held by the sample buffer
    pub fn size_bytes(&self) -> usize {
        self.samples.len() * std::mem::size_of::<u16>()
    }
}

/// Format-specific decoding plus the shared tile operations.
pub trait RasterCodec: Send + Sync {
    fn name(&self) -> &'static str;

    /// Width and height of the native image
    fn probe_dimensions(&self, path: &Path) -> Result<(u32, u32), TileError>;

    fn band_count(&self, path: &Path) -> Result<usize, TileError>;

    /// Decode one full band in the native frame
    fn decode_band(&self, path: &Path, band: usize) -> Result<Band, TileError>;

    /// Cut tile `tile` out of a native base band, in the oriented frame
    fn slice_tile(&self, base: &Band, layout: &TileLayout, tile: usize, orientation: Orientation) -> Option<Band> {
        layout.slice(base, tile, orientation)
    }

    fn persist_tile(&self, path: &Path, tile: &Band) -> Result<(), TileError> {
        disk::write_tile(path, tile)
    }

    /// `Ok(None)` when no tile file exists
    fn load_tile(&self, path: &Path) -> Result<Option<Band>, TileError> {
        disk::read_tile(path)
    }
}

/// Take every `channels`-th sample starting at `band`
fn extract_channel(samples: &[u16], channels: usize, band: usize) -> Vec<u16> {
    samples.iter().skip(band).step_by(channels.max(1)).copied().collect()
}

/// PNG, JPEG, TIFF and the other formats the `image` crate decodes.
/// Each color component is a band.
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardCodec;

impl RasterCodec for StandardCodec {
    fn name(&self) -> &'static str {
        "standard"
    }

    fn probe_dimensions(&self, path: &Path) -> Result<(u32, u32), TileError> {
        Ok(image::image_dimensions(path)?)
    }

    /// Read from the file header; no pixels are decoded
    fn band_count(&self, path: &Path) -> Result<usize, TileError> {
        let decoder = image::ImageReader::open(path)?.with_guessed_format()?.into_decoder()?;
        Ok(decoder.color_type().channel_count() as usize)
    }

    fn decode_band(&self, path: &Path, band: usize) -> Result<Band, TileError> {
        let img = image::open(path)?;
        let (width, height) = (img.width(), img.height());
        let channels = img.color().channel_count() as usize;
        if band >= channels {
            return Err(TileError::NoSuchBand { band, count: channels });
        }

        let samples = match channels {
            1 => img.into_luma16().into_raw(),
            2 => img.into_luma_alpha16().into_raw(),
            3 => img.into_rgb16().into_raw(),
            _ => img.into_rgba16().into_raw(),
        };
        let channels = channels.min(4);
        debug!(path = %path.display(), band, width, height, "Decoded standard band");
        Ok(Band::new(width, height, extract_channel(&samples, channels, band)))
    }
}

/// Camera raw files decoded with rawloader. Sensor components are bands.
///
/// rawloader cannot read dimensions without decoding the whole frame, so a
/// frame decoded by `probe_dimensions` is kept until the next
/// `decode_band` of the same file, and each file's dimensions are
/// remembered.
#[derive(Default)]
pub struct RawSensorCodec {
    pending: Mutex<Option<(PathBuf, Arc<rawloader::RawImage>)>>,
    frames: DashMap<PathBuf, RawFrameInfo>,
}

#[derive(Debug, Clone, Copy)]
struct RawFrameInfo {
    width: u32,
    height: u32,
    cpp: usize,
}

impl RawFrameInfo {
    fn of(raw: &rawloader::RawImage) -> Self {
        Self {
            width: raw.width as u32,
            height: raw.height as u32,
            cpp: raw.cpp.max(1),
        }
    }
}

impl RawSensorCodec {
    /// Extensions of the raw formats rawloader understands
    pub const EXTENSIONS: [&'static str; 16] = [
        "nef", "dng", "cr2", "cr3", "arw", "raf", "orf", "rw2", "pef", "srw", "erf", "kdc", "dcr", "mos", "raw", "rwl",
    ];

    pub fn new() -> Self {
        Self::default()
    }

    fn decode(&self, path: &Path) -> Result<Arc<rawloader::RawImage>, TileError> {
        let decoder = rawloader::RawLoader::new();
        let raw = decoder
            .decode_file(path)
            .map_err(|e| TileError::Decode(format!("{:?}", e)))?;
        self.frames.insert(path.to_path_buf(), RawFrameInfo::of(&raw));
        Ok(Arc::new(raw))
    }

    /// The frame left by `probe_dimensions` for `path`, if any
    fn take_pending(&self, path: &Path) -> Option<Arc<rawloader::RawImage>> {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        match pending.take() {
            Some((pending_path, raw)) if pending_path == path => Some(raw),
            _ => None,
        }
    }

    fn frame_info(&self, path: &Path) -> Result<RawFrameInfo, TileError> {
        if let Some(info) = self.frames.get(path) {
            return Ok(*info);
        }
        let raw = self.decode(path)?;
        let info = RawFrameInfo::of(&raw);
        *self.pending.lock().unwrap_or_else(|e| e.into_inner()) = Some((path.to_path_buf(), raw));
        Ok(info)
    }

    /// Sensor values normalized to u16
    fn samples(raw: &rawloader::RawImage) -> Vec<u16> {
        match &raw.data {
            rawloader::RawImageData::Integer(values) => values.clone(),
            rawloader::RawImageData::Float(values) => values
                .iter()
                .map(|&v| (v * 65535.0).clamp(0.0, 65535.0) as u16)
                .collect(),
        }
    }
}

impl RasterCodec for RawSensorCodec {
    fn name(&self) -> &'static str {
        "raw"
    }

    fn probe_dimensions(&self, path: &Path) -> Result<(u32, u32), TileError> {
        let info = self.frame_info(path)?;
        Ok((info.width, info.height))
    }

    fn band_count(&self, path: &Path) -> Result<usize, TileError> {
        Ok(self.frame_info(path)?.cpp)
    }

    fn decode_band(&self, path: &Path, band: usize) -> Result<Band, TileError> {
        let raw = match self.take_pending(path) {
            Some(raw) => raw,
            None => self.decode(path)?,
        };
        let cpp = raw.cpp.max(1);
        if band >= cpp {
            return Err(TileError::NoSuchBand { band, count: cpp });
        }
        let samples = extract_channel(&Self::samples(&raw), cpp, band);
        debug!(path = %path.display(), band, width = raw.width, height = raw.height, "Decoded raw band");
        Ok(Band::new(raw.width as u32, raw.height as u32, samples))
    }
}

impl std::fmt::Debug for RawSensorCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawSensorCodec").field("known_frames", &self.frames.len()).finish()
    }
}

/// Codec lookup by lower-case file extension
#[derive(Clone, Default)]
pub struct FormatRegistry {
    codecs: HashMap<String, Arc<dyn RasterCodec>>,
}

impl FormatRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The `image` formats plus the camera raw formats
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        let standard: Arc<dyn RasterCodec> = Arc::new(StandardCodec);
        for ext in ["png", "jpg", "jpeg", "tif", "tiff", "bmp", "gif", "webp"] {
            registry.register(ext, Arc::clone(&standard));
        }
        let raw: Arc<dyn RasterCodec> = Arc::new(RawSensorCodec::new());
        for ext in RawSensorCodec::EXTENSIONS {
            registry.register(ext, Arc::clone(&raw));
        }
        registry
    }

    pub fn register(&mut self, extension: &str, codec: Arc<dyn RasterCodec>) {
        self.codecs.insert(extension.to_lowercase(), codec);
    }

    pub fn codec_for(&self, path: &Path) -> Result<Arc<dyn RasterCodec>, TileError> {
        path.extension()
            .map(|ext| ext.to_string_lossy().to_lowercase())
            .and_then(|ext| self.codecs.get(&ext).cloned())
            .ok_or_else(|| TileError::UnsupportedFormat(path.to_path_buf()))
    }
}

impl std::fmt::Debug for FormatRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut extensions: Vec<&String> = self.codecs.keys().collect();
        extensions.sort();
        f.debug_struct("FormatRegistry").field("extensions", &extensions).finish()
    }
}
