/// Local persistent cache
///
/// This module handles:
/// - The SQLite store, its version guard and advisory lock (store.rs)
/// - Opening the store on first use, shared by the session (lazy.rs)
/// - Reading the bundled offline snapshot directly (snapshot.rs)

pub mod lazy;
pub mod snapshot;
pub mod store;

pub use lazy::LazyCache;
pub use snapshot::SnapshotSource;
pub use store::{create_snapshot, LocalCache, RecordState};
