/// Row sources
///
/// - Generic row contract and typed values (row.rs)
/// - Remote store wrapper (remote.rs)
/// - TCP liveness probe (probe.rs)

pub mod probe;
pub mod remote;
pub mod row;

pub use probe::HostProbe;
pub use remote::RemoteSource;
pub use row::{ColumnMeta, FieldKind, FieldValue, Row, RowSet, RowSource};
