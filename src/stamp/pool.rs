/// Session-wide pool that deduplicates records by id
///
/// Every layer built from the same session shares this pool, so two queries
/// that return the same footprint hand out the same `Arc<StampRecord>` and
/// its cached display geometry.

use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

use super::record::StampRecord;

#[derive(Debug, Default)]
pub struct StampPool {
    records: DashMap<String, Arc<StampRecord>>,
}

impl StampPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the pooled instance for this record's id, adding it if new.
    ///
    /// When the id is already pooled the argument is dropped; records are
    /// immutable, so the first instance wins.
    pub fn intern(&self, record: StampRecord) -> Arc<StampRecord> {
        let entry = self
            .records
            .entry(record.id().to_string())
            .or_insert_with(|| Arc::new(record));
        Arc::clone(entry.value())
    }

    pub fn get(&self, id: &str) -> Option<Arc<StampRecord>> {
        self.records.get(id).map(|r| Arc::clone(r.value()))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Clear projection-dependent geometry on every pooled record
    pub fn invalidate_all(&self) {
        for entry in self.records.iter() {
            entry.value().invalidate();
        }
        debug!(records = self.records.len(), "Invalidated derived geometry");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stamp::geometry::{ActiveProjection, Point};

    fn record(id: &str, lon: f64) -> StampRecord {
        StampRecord::new(id, [Point::lonlat(lon, 0.0); 4], vec![])
    }

    #[test]
    fn test_intern_deduplicates() {
        let pool = StampPool::new();
        let a = pool.intern(record("s1", 1.0));
        let b = pool.intern(record("s1", 99.0));
        assert!(Arc::ptr_eq(&a, &b));
        // First instance wins
        assert_eq!(b.corners()[0].lon(), 1.0);
        assert_eq!(pool.len(), 1);

        pool.intern(record("s2", 2.0));
        assert_eq!(pool.len(), 2);
        assert!(pool.get("s2").is_some());
        assert!(pool.get("s3").is_none());
    }

    #[test]
    fn test_invalidate_all() {
        let pool = StampPool::new();
        let rec = pool.intern(record("s1", 1.0));
        rec.projected_path(&ActiveProjection::default());
        assert!(rec.has_derived_geometry());

        pool.invalidate_all();
        assert!(!rec.has_derived_geometry());
    }
}
