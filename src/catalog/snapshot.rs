use rusqlite::{Connection, OpenFlags};
use std::path::{Path, PathBuf};
use tracing::debug;

use super::store::{quote_ident, read_version, select_sql};
use crate::config::CacheSchema;
use crate::error::SourceError;
use crate::guard::is_version_changed;
use crate::source::row::query_connection;
use crate::source::RowSet;

/// Direct read-only access to the bundled snapshot.
///
/// Used as the last tier when the local cache cannot be opened and the
/// remote source is unreachable.
#[derive(Debug, Clone)]
pub struct SnapshotSource {
    path: PathBuf,
    schema: CacheSchema,
}

impl SnapshotSource {
    pub fn new(path: impl Into<PathBuf>, schema: CacheSchema) -> Self {
        Self {
            path: path.into(),
            schema,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_present(&self) -> bool {
        self.path.is_file()
    }

    /// Run a cache-form filter against the snapshot table.
    pub fn query(&self, filter: &str) -> Result<RowSet, SourceError> {
        let conn = Connection::open_with_flags(&self.path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;

        let stored = read_version(&conn).map_err(|e| SourceError::Query(e.to_string()))?;
        if is_version_changed(&self.schema.version, stored.as_ref()) {
            return Err(SourceError::Query(format!(
                "snapshot {} has an incompatible version",
                self.path.display()
            )));
        }

        let table = format!("main.{}", quote_ident(&self.schema.version.table_name));
        let sql = select_sql(&table, filter);
        debug!(path = %self.path.display(), sql = %sql, "Snapshot query");
        Ok(query_connection(&conn, &sql)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::store::create_snapshot;
    use crate::source::FieldValue;

    #[test]
    fn test_query_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bundled.db");
        let rows = RowSet::from_values(
            vec!["id".into(), "instrument".into()],
            vec![
                vec!["a".into(), "ctx".into()],
                vec!["b".into(), "hirise".into()],
            ],
        );
        create_snapshot(&path, &CacheSchema::default(), &rows).unwrap();

        let source = SnapshotSource::new(&path, CacheSchema::default());
        assert!(source.is_present());
        let result = source.query("instrument = 'hirise'").unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result.rows[0].get("id"), Some(&FieldValue::from("b")));
    }

    #[test]
    fn test_incompatible_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bundled.db");
        let mut old = CacheSchema::default();
        old.version.revision = 0;
        create_snapshot(&path, &old, &RowSet::default()).unwrap();

        let source = SnapshotSource::new(&path, CacheSchema::default());
        assert!(matches!(source.query(""), Err(SourceError::Query(_))));
    }

    #[test]
    fn test_missing_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let source = SnapshotSource::new(dir.path().join("none.db"), CacheSchema::default());
        assert!(!source.is_present());
        assert!(source.query("").is_err());
    }
}
