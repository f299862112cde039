/// On-disk tile files
///
/// A `.stile` file is the magic `STL1`, width and height as little-endian
/// u32, then the samples as little-endian u16. Files are written to a
/// temporary name and renamed into place. `<id>.dims` holds just the header
/// and records the native image size.

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

use crate::error::TileError;
use crate::orientation::Orientation;
use crate::raster::codec::Band;

const MAGIC: &[u8; 4] = b"STL1";
const HEADER_LEN: usize = 12;
pub const TILE_EXTENSION: &str = "stile";

/// Image id with path separators and drive colons removed
pub fn strip_id(id: &str) -> String {
    id.chars().filter(|c| !matches!(c, '/' | '\\' | ':')).collect()
}

/// `<id>_<band>[_tile<k>]_<orientation>.stile`
///
/// `tile == None` names the full base band.
pub fn tile_path(dir: &Path, id: &str, band: usize, tile: Option<usize>, orientation: Orientation) -> PathBuf {
    let tile_part = tile.map(|k| format!("_tile{}", k)).unwrap_or_default();
    dir.join(format!(
        "{}_{}{}_{}.{}",
        strip_id(id),
        band,
        tile_part,
        orientation.label(),
        TILE_EXTENSION
    ))
}

pub fn write_tile(path: &Path, tile: &Band) -> Result<(), TileError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let le: Vec<u16> = tile.samples.iter().map(|s| s.to_le()).collect();
    let mut bytes = Vec::with_capacity(HEADER_LEN + le.len() * 2);
    bytes.extend_from_slice(MAGIC);
    bytes.extend_from_slice(&tile.width.to_le_bytes());
    bytes.extend_from_slice(&tile.height.to_le_bytes());
    bytes.extend_from_slice(bytemuck::cast_slice::<u16, u8>(le.as_slice()));

    let tmp = path.with_extension("stile.tmp");
    let mut file = fs::File::create(&tmp)?;
    file.write_all(&bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    debug!(path = %path.display(), width = tile.width, height = tile.height, "Wrote tile");
    Ok(())
}

/// Read a tile file. A missing file is `Ok(None)`; a malformed one is an error.
pub fn read_tile(path: &Path) -> Result<Option<Band>, TileError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    if bytes.len() < HEADER_LEN || &bytes[..4] != MAGIC {
        return Err(TileError::Decode(format!("{} is not a tile file", path.display())));
    }
    let width = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    let height = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
    let body = &bytes[HEADER_LEN..];
    let expected = width as usize * height as usize;
    if body.len() != expected * 2 {
        return Err(TileError::Decode(format!(
            "{} holds {} bytes, expected {}",
            path.display(),
            body.len(),
            expected * 2
        )));
    }

    let mut samples = vec![0u16; expected];
    bytemuck::cast_slice_mut::<u16, u8>(&mut samples).copy_from_slice(body);
    for s in samples.iter_mut() {
        *s = u16::from_le(*s);
    }
    Ok(Some(Band::new(width, height, samples)))
}

/// `<id>.dims`, the native width and height of image `id`
pub fn dims_path(dir: &Path, id: &str) -> PathBuf {
    dir.join(format!("{}.dims", strip_id(id)))
}

pub fn write_dimensions(path: &Path, width: u32, height: u32) -> Result<(), TileError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut bytes = Vec::with_capacity(HEADER_LEN);
    bytes.extend_from_slice(MAGIC);
    bytes.extend_from_slice(&width.to_le_bytes());
    bytes.extend_from_slice(&height.to_le_bytes());

    let tmp = path.with_extension("dims.tmp");
    fs::write(&tmp, &bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Read a dimensions file. Missing is `Ok(None)`; malformed is an error.
pub fn read_dimensions(path: &Path) -> Result<Option<(u32, u32)>, TileError> {
    let mut file = match fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut header = [0u8; HEADER_LEN];
    if file.read_exact(&mut header).is_err() || &header[..4] != MAGIC {
        return Err(TileError::Decode(format!("{} is not a dimensions file", path.display())));
    }
    let width = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    let height = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
    Ok(Some((width, height)))
}

/// Total bytes of tile files under `dir`
pub fn disk_usage(dir: &Path) -> u64 {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == TILE_EXTENSION))
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_tile_names() {
        let dir = Path::new("/tiles");
        assert_eq!(
            tile_path(dir, "C:/frames\\m01", 2, Some(5), Orientation::HFlipped),
            PathBuf::from("/tiles/Cframesm01_2_tile5_hflip.stile")
        );
        assert_eq!(
            tile_path(dir, "m01", 0, None, Orientation::Normal),
            PathBuf::from("/tiles/m01_0_normal.stile")
        );
    }

    #[test]
    fn test_write_then_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("a_0_tile1_normal.stile");
        let band = Band::new(3, 2, vec![1, 2, 3, 400, 500, 65535]);

        write_tile(&path, &band).unwrap();
        assert_eq!(read_tile(&path).unwrap(), Some(band));
        assert!(!path.with_extension("stile.tmp").exists());
    }

    #[test]
    fn test_missing_and_malformed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x_0_normal.stile");
        assert_eq!(read_tile(&path).unwrap(), None);

        fs::write(&path, b"JUNKJUNKJUNKJUNK").unwrap();
        assert!(matches!(read_tile(&path), Err(TileError::Decode(_))));

        let mut truncated = Vec::from(&MAGIC[..]);
        truncated.extend_from_slice(&2u32.to_le_bytes());
        truncated.extend_from_slice(&2u32.to_le_bytes());
        truncated.extend_from_slice(&[0, 0]);
        fs::write(&path, truncated).unwrap();
        assert!(read_tile(&path).is_err());
    }

    #[test]
    fn test_dimensions_file() {
        let dir = TempDir::new().unwrap();
        let path = dims_path(dir.path(), "C:/frames/m01");
        assert_eq!(path, dir.path().join("Cframesm01.dims"));
        assert_eq!(read_dimensions(&path).unwrap(), None);

        write_dimensions(&path, 640, 480).unwrap();
        assert_eq!(read_dimensions(&path).unwrap(), Some((640, 480)));

        fs::write(&path, b"STL1").unwrap();
        assert!(matches!(read_dimensions(&path), Err(TileError::Decode(_))));
    }

    #[test]
    fn test_disk_usage_counts_tiles() {
        let dir = TempDir::new().unwrap();
        let band = Band::new(1, 1, vec![9]);
        write_tile(&tile_path(dir.path(), "a", 0, None, Orientation::Normal), &band).unwrap();
        write_tile(&tile_path(dir.path(), "a", 1, Some(3), Orientation::VFlipped), &band).unwrap();
        write_dimensions(&dims_path(dir.path(), "a"), 1, 1).unwrap();

        assert_eq!(disk_usage(dir.path()), 2 * 14);
        assert_eq!(disk_usage(&dir.path().join("missing")), 0);
    }
}
