/// Footprint records and their lazily derived geometry

use std::sync::{Arc, Mutex, OnceLock};

use cgmath::{Vector3, Zero};

use super::geometry::{unwrap_path, ActiveProjection, Bounds, Point};
use crate::orientation::{apply_orientation, Orientation};
use crate::source::{FieldValue, Row};

/// Projection-dependent geometry, cached per projection generation
#[derive(Debug, Default)]
struct DerivedGeometry {
    generation: Option<u64>,
    projected: Option<Arc<[Point]>>,
    normalized: Option<Arc<[Point]>>,
    bounds: Option<Bounds>,
}

impl DerivedGeometry {
    fn clear(&mut self) {
        *self = DerivedGeometry::default();
    }

    /// Drop everything if it was computed under a different projection
    fn sync(&mut self, projection: &ActiveProjection) {
        if self.generation != Some(projection.generation) {
            self.clear();
            self.generation = Some(projection.generation);
        }
    }
}

/// An immutable image footprint.
///
/// Corners are lon/lat in `[top-left, top-right, bottom-right, bottom-left]`
/// order of the canonical image.
#[derive(Debug)]
pub struct StampRecord {
    id: String,
    corners: [Point; 4],
    fields: Vec<(String, FieldValue)>,
    centroid: OnceLock<Point>,
    derived: Mutex<DerivedGeometry>,
}

impl StampRecord {
    pub fn new(id: impl Into<String>, corners: [Point; 4], fields: Vec<(String, FieldValue)>) -> Self {
        Self {
            id: id.into(),
            corners,
            fields,
            centroid: OnceLock::new(),
            derived: Mutex::new(DerivedGeometry::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn corners(&self) -> &[Point; 4] {
        &self.corners
    }

    /// Corners reordered for an image shown in `orientation`
    pub fn oriented_corners(&self, orientation: Orientation) -> [Point; 4] {
        match orientation {
            Orientation::Normal => self.corners,
            op => apply_orientation(&self.corners, op),
        }
    }

    pub fn fields(&self) -> &[(String, FieldValue)] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Centre of the footprint on the sphere.
    ///
    /// Averages the corners as unit vectors, so it is independent of the
    /// map projection and never invalidated.
    pub fn centroid(&self) -> Point {
        *self.centroid.get_or_init(|| {
            let sum = self
                .corners
                .iter()
                .fold(Vector3::zero(), |acc, p| acc + p.to_unit_vector());
            Point::from_vector(sum)
        })
    }

    /// Corners in display coordinates
    pub fn projected_path(&self, projection: &ActiveProjection) -> Arc<[Point]> {
        let mut derived = self.lock_derived();
        derived.sync(projection);
        if let Some(path) = &derived.projected {
            return Arc::clone(path);
        }
        let path: Arc<[Point]> = self
            .corners
            .iter()
            .map(|p| projection.kind.project(*p))
            .collect();
        derived.projected = Some(Arc::clone(&path));
        path
    }

    /// Projected path with longitudes unwrapped across the seam
    pub fn normalized_path(&self, projection: &ActiveProjection) -> Arc<[Point]> {
        let projected = self.projected_path(projection);
        let mut derived = self.lock_derived();
        derived.sync(projection);
        if let Some(path) = &derived.normalized {
            return Arc::clone(path);
        }
        let path: Arc<[Point]> = unwrap_path(&projected).into();
        derived.normalized = Some(Arc::clone(&path));
        path
    }

    pub fn bounds(&self, projection: &ActiveProjection) -> Option<Bounds> {
        let normalized = self.normalized_path(projection);
        let mut derived = self.lock_derived();
        derived.sync(projection);
        if derived.bounds.is_none() {
            derived.bounds = Bounds::from_points(&normalized);
        }
        derived.bounds
    }

    /// Forget projection-dependent geometry. Recomputed on next access.
    pub fn invalidate(&self) {
        self.lock_derived().clear();
    }

    /// True when display geometry is cached for some projection
    pub fn has_derived_geometry(&self) -> bool {
        self.lock_derived().projected.is_some()
    }

    fn lock_derived(&self) -> std::sync::MutexGuard<'_, DerivedGeometry> {
        // Derived geometry is a pure cache; a poisoned lock still holds
        // consistent (or cleared) data.
        self.derived.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Converts one result row into a record. Must be a pure function of the row.
pub trait RowMapper: Send + Sync {
    fn map_row(&self, row: &Row) -> Option<StampRecord>;
}

impl<F> RowMapper for F
where
    F: Fn(&Row) -> Option<StampRecord> + Send + Sync,
{
    fn map_row(&self, row: &Row) -> Option<StampRecord> {
        self(row)
    }
}

/// Stock mapper reading the id and corner coordinates from named columns.
///
/// All columns, including the ones consumed here, are kept as auxiliary fields.
#[derive(Debug, Clone)]
pub struct CornerColumns {
    pub id: String,
    /// Longitude columns, in corner order
    pub lon: [String; 4],
    /// Latitude columns, in corner order
    pub lat: [String; 4],
}

impl Default for CornerColumns {
    fn default() -> Self {
        let names = |axis: &str| {
            ["ul", "ur", "lr", "ll"].map(|corner| format!("{}_{}", corner, axis))
        };
        Self {
            id: "id".to_string(),
            lon: names("lon"),
            lat: names("lat"),
        }
    }
}

impl RowMapper for CornerColumns {
    fn map_row(&self, row: &Row) -> Option<StampRecord> {
        let id = row.get_text(&self.id)?;
        let mut corners = [Point::default(); 4];
        for (i, corner) in corners.iter_mut().enumerate() {
            *corner = Point::lonlat(row.get_f64(&self.lon[i])?, row.get_f64(&self.lat[i])?);
        }
        let fields = row
            .fields()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect();
        Some(StampRecord::new(id, corners, fields))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::RowSet;
    use crate::stamp::geometry::ProjectionKind;

    fn square(id: &str, lon: f64, lat: f64) -> StampRecord {
        StampRecord::new(
            id,
            [
                Point::lonlat(lon, lat + 1.0),
                Point::lonlat(lon + 1.0, lat + 1.0),
                Point::lonlat(lon + 1.0, lat),
                Point::lonlat(lon, lat),
            ],
            vec![("orbit".to_string(), FieldValue::Integer(42))],
        )
    }

    #[test]
    fn test_centroid_is_projection_independent() {
        let rec = square("a", 10.0, 20.0);
        let c = rec.centroid();
        assert!((c.lon() - 10.5).abs() < 1e-2);
        assert!((c.lat() - 20.5).abs() < 1e-2);

        rec.invalidate();
        assert_eq!(rec.centroid(), c);
    }

    #[test]
    fn test_centroid_across_dateline() {
        let rec = square("b", 179.5, 0.0);
        let c = rec.centroid();
        // Naive averaging would land near 0
        assert!(c.lon().abs() > 179.0);
    }

    #[test]
    fn test_projection_change_recomputes_lazily() {
        let rec = square("c", 10.0, 0.0);
        let first = ActiveProjection::new(ProjectionKind::Equirectangular { center_lon: 0.0 });
        let path = rec.projected_path(&first);
        assert_eq!(path[0], Point::new(10.0, 1.0));
        assert!(rec.has_derived_geometry());

        rec.invalidate();
        assert!(!rec.has_derived_geometry());

        let second = first.switch_to(ProjectionKind::Equirectangular { center_lon: 5.0 });
        let path = rec.projected_path(&second);
        assert_eq!(path[0], Point::new(5.0, 1.0));

        // A stale generation is also detected without an explicit invalidate
        let path = rec.projected_path(&first);
        assert_eq!(path[0], Point::new(10.0, 1.0));
    }

    #[test]
    fn test_bounds_use_normalized_path() {
        let rec = square("d", 179.5, 0.0);
        let proj = ActiveProjection::default();
        let bounds = rec.bounds(&proj).unwrap();
        assert!((bounds.width() - 1.0).abs() < 1e-9);
        assert!((bounds.height() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_oriented_corners() {
        let rec = square("e", 0.0, 0.0);
        let flipped = rec.oriented_corners(Orientation::VFlipped);
        assert_eq!(flipped[0], rec.corners()[3]);
        assert_eq!(rec.oriented_corners(Orientation::Normal), *rec.corners());
    }

    #[test]
    fn test_corner_columns_mapper() {
        let names: Vec<String> = ["id", "ul_lon", "ul_lat", "ur_lon", "ur_lat", "lr_lon", "lr_lat", "ll_lon", "ll_lat"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let set = RowSet::from_values(
            names,
            vec![vec![
                FieldValue::Integer(7),
                0.0.into(), 1.0.into(),
                1.0.into(), 1.0.into(),
                1.0.into(), 0.0.into(),
                0.0.into(), 0.0.into(),
            ]],
        );
        let rec = CornerColumns::default().map_row(&set.rows[0]).unwrap();
        assert_eq!(rec.id(), "7");
        assert_eq!(rec.corners()[1], Point::lonlat(1.0, 1.0));
        assert_eq!(rec.fields().len(), 9);
        assert_eq!(rec.field("lr_lat"), Some(&FieldValue::Real(0.0)));
    }

    #[test]
    fn test_mapper_rejects_incomplete_rows() {
        let set = RowSet::from_values(vec!["id".into()], vec![vec!["x".into()]]);
        assert!(CornerColumns::default().map_row(&set.rows[0]).is_none());

        let closure = |row: &Row| row.get_text("id").map(|id| StampRecord::new(id, [Point::default(); 4], vec![]));
        assert_eq!(closure.map_row(&set.rows[0]).unwrap().id(), "x");
    }
}
