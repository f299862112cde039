/// Footprint ("stamp") records
///
/// - Points, bounds and projections (geometry.rs)
/// - Immutable records with lazily derived geometry (record.rs)
/// - Session-wide deduplicating pool (pool.rs)

pub mod geometry;
pub mod pool;
pub mod record;

pub use geometry::{ActiveProjection, Bounds, Point, ProjectionKind};
pub use pool::StampPool;
pub use record::{CornerColumns, RowMapper, StampRecord};
