/// Tiered footprint cache and lazy tiled image store
///
/// This crate handles:
/// - Loading footprint records from a local cache, a remote store or a
///   bundled snapshot (loader.rs, catalog/, source/)
/// - Reusing loaded queries and evicting unused ones (layer.rs, registry.rs)
/// - Decoding image bands lazily into disk-backed tiles (raster/)
/// - Rotation and flip bookkeeping for footprints and pixels (orientation.rs)
/// - The session that owns all of the above (session.rs)

pub mod catalog;
pub mod config;
pub mod error;
pub mod flush;
pub mod guard;
pub mod layer;
pub mod loader;
pub mod logging;
pub mod orientation;
pub mod raster;
pub mod registry;
pub mod session;
pub mod source;
pub mod stamp;

pub use config::{CacheConfig, CacheSchema};
pub use error::{CacheError, ConfigError, LoadError, SourceError, TileError};
pub use layer::StampLayer;
pub use loader::{LoadOutcome, PartialCacheChoice, QueryDescriptor, SourceKind, TieredLoader};
pub use orientation::{apply_orientation, Orientation};
pub use registry::LayerRegistry;
pub use session::{LayerView, Session};
