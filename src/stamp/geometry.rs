/// Geographic points, bounds and map projections for footprints

use cgmath::{InnerSpace, Vector3};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// A 2D point. For geographic points `x` is longitude and `y` latitude.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Default)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    #[inline]
    #[must_use]
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Create a point from longitude and latitude in degrees.
    #[inline]
    #[must_use]
    pub fn lonlat(lon: f64, lat: f64) -> Self {
        Self { x: lon, y: lat }
    }

    #[inline]
    pub fn lon(&self) -> f64 {
        self.x
    }

    #[inline]
    pub fn lat(&self) -> f64 {
        self.y
    }

    /// Unit vector on the sphere for this lon/lat point
    pub fn to_unit_vector(&self) -> Vector3<f64> {
        let lon = self.x.to_radians();
        let lat = self.y.to_radians();
        Vector3::new(lat.cos() * lon.cos(), lat.cos() * lon.sin(), lat.sin())
    }

    /// Inverse of `to_unit_vector`. The vector need not be normalized.
    pub fn from_vector(v: Vector3<f64>) -> Self {
        let v = v.normalize();
        Self::lonlat(v.y.atan2(v.x).to_degrees(), v.z.asin().to_degrees())
    }
}

impl From<(f64, f64)> for Point {
    #[inline]
    fn from((x, y): (f64, f64)) -> Self {
        Self::new(x, y)
    }
}

/// Axis-aligned bounding box
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Bounds {
    /// Smallest box containing all points. `None` for an empty slice.
    pub fn from_points(points: &[Point]) -> Option<Self> {
        let first = points.first()?;
        let init = Bounds {
            min_x: first.x,
            min_y: first.y,
            max_x: first.x,
            max_y: first.y,
        };
        Some(points.iter().skip(1).fold(init, |b, p| Bounds {
            min_x: b.min_x.min(p.x),
            min_y: b.min_y.min(p.y),
            max_x: b.max_x.max(p.x),
            max_y: b.max_y.max(p.y),
        }))
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    pub fn contains(&self, p: Point) -> bool {
        p.x >= self.min_x && p.x <= self.max_x && p.y >= self.min_y && p.y <= self.max_y
    }
}

/// Map projections available to the viewer
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub enum ProjectionKind {
    /// Plate carrée centred on a longitude
    Equirectangular { center_lon: f64 },
    /// Spherical mercator in degrees-equivalent units
    Mercator { center_lon: f64 },
}

impl ProjectionKind {
    fn center_lon(&self) -> f64 {
        match *self {
            ProjectionKind::Equirectangular { center_lon }
            | ProjectionKind::Mercator { center_lon } => center_lon,
        }
    }

    /// Project a lon/lat point to display coordinates.
    pub fn project(&self, p: Point) -> Point {
        let x = wrap_lon(p.lon() - self.center_lon());
        match self {
            ProjectionKind::Equirectangular { .. } => Point::new(x, p.lat()),
            ProjectionKind::Mercator { .. } => {
                let lat = p.lat().clamp(-85.0511, 85.0511).to_radians();
                let y = (PI / 4.0 + lat / 2.0).tan().ln().to_degrees();
                Point::new(x, y)
            }
        }
    }
}

impl Default for ProjectionKind {
    fn default() -> Self {
        ProjectionKind::Equirectangular { center_lon: 0.0 }
    }
}

/// The projection in force plus a generation number.
///
/// The generation changes whenever the projection does, which lets records
/// detect that their cached display geometry is out of date.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActiveProjection {
    pub generation: u64,
    pub kind: ProjectionKind,
}

impl ActiveProjection {
    pub fn new(kind: ProjectionKind) -> Self {
        Self { generation: 0, kind }
    }

    /// Successor state after switching to `kind`
    pub fn switch_to(&self, kind: ProjectionKind) -> Self {
        Self {
            generation: self.generation + 1,
            kind,
        }
    }
}

impl Default for ActiveProjection {
    fn default() -> Self {
        Self::new(ProjectionKind::default())
    }
}

/// Wrap a longitude into [-180, 180).
pub fn wrap_lon(lon: f64) -> f64 {
    let wrapped = (lon + 180.0).rem_euclid(360.0) - 180.0;
    if wrapped.is_nan() {
        lon
    } else {
        wrapped
    }
}

/// Unwrap a path so consecutive longitudes never jump by more than 180 degrees.
///
/// The first point keeps its longitude; the rest are shifted by whole turns.
pub fn unwrap_path(points: &[Point]) -> Vec<Point> {
    let mut out: Vec<Point> = Vec::with_capacity(points.len());
    for p in points {
        let next = match out.last() {
            None => *p,
            Some(prev) => {
                let delta = wrap_lon(p.x - prev.x);
                Point::new(prev.x + delta, p.y)
            }
        };
        out.push(next);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_lon() {
        assert_eq!(wrap_lon(190.0), -170.0);
        assert_eq!(wrap_lon(-190.0), 170.0);
        assert_eq!(wrap_lon(45.0), 45.0);
    }

    #[test]
    fn test_unwrap_across_dateline() {
        let path = [
            Point::lonlat(179.0, 0.0),
            Point::lonlat(-179.0, 0.0),
            Point::lonlat(-179.0, 1.0),
            Point::lonlat(179.0, 1.0),
        ];
        let unwrapped = unwrap_path(&path);
        assert_eq!(unwrapped[1].x, 181.0);
        assert_eq!(unwrapped[2].x, 181.0);
        assert_eq!(unwrapped[3].x, 179.0);
        let bounds = Bounds::from_points(&unwrapped).unwrap();
        assert!((bounds.width() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_unit_vector_round_trip() {
        let p = Point::lonlat(-122.4, 37.8);
        let back = Point::from_vector(p.to_unit_vector());
        assert!((back.lon() - p.lon()).abs() < 1e-9);
        assert!((back.lat() - p.lat()).abs() < 1e-9);
    }

    #[test]
    fn test_mercator_equator_is_zero() {
        let proj = ProjectionKind::Mercator { center_lon: 0.0 };
        let p = proj.project(Point::lonlat(10.0, 0.0));
        assert!((p.x - 10.0).abs() < 1e-9);
        assert!(p.y.abs() < 1e-9);
    }

    #[test]
    fn test_projection_recenters() {
        let proj = ProjectionKind::Equirectangular { center_lon: 170.0 };
        let p = proj.project(Point::lonlat(-175.0, 3.0));
        assert!((p.x - 15.0).abs() < 1e-9);
        assert_eq!(p.y, 3.0);
    }

    #[test]
    fn test_bounds_empty() {
        assert!(Bounds::from_points(&[]).is_none());
    }
}
