use chrono::{DateTime, Utc};
use fs4::FileExt;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::CacheSchema;
use crate::error::CacheError;
use crate::guard::{compute_fingerprint, is_stale, is_version_changed, Fingerprint, VersionTag};
use crate::source::row::query_connection;
use crate::source::{RowSet, RowSource};

const META_KEY_VERSION: &str = "version_tag";
const META_KEY_SNAPSHOT: &str = "snapshot_fingerprint";
const META_KEY_LAST_REFRESH: &str = "last_refresh";
const SNAPSHOT_COPY: &str = "snapshot.db";
const SNAPSHOT_ALIAS: &str = "snapshot";

/// Small per-record state persisted beside the cached rows
#[derive(Debug, Clone, PartialEq)]
pub struct RecordState {
    pub id: String,
    pub key: String,
    pub value: serde_json::Value,
}

/// The local persistent cache.
///
/// A SQLite file holding the same logical rows as the remote source, plus
/// a `meta` table with the version tag and snapshot fingerprint. Holding a
/// `LocalCache` means holding the advisory lock on `<db>.lock`.
pub struct LocalCache {
    conn: Connection,
    db_path: PathBuf,
    schema: CacheSchema,
    /// True when this open destroyed and recreated the store
    rebuilt: bool,
    /// True when the snapshot copy is attached as an overlay
    overlay: bool,
    _lock: File,
}

impl LocalCache {
    /// Open (creating if needed) the cache at `db_path`.
    ///
    /// Fails fast with `CacheError::Locked` when another process holds the
    /// store. A missing, unreadable or mismatched version tag wipes the
    /// store and starts empty.
    pub fn open(db_path: &Path, schema: CacheSchema) -> Result<Self, CacheError> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let lock = acquire_lock(db_path)?;
        let (conn, rebuilt) = open_checked(db_path, &schema)?;

        info!(path = %db_path.display(), rebuilt, "Local cache opened");

        Ok(LocalCache {
            conn,
            db_path: db_path.to_path_buf(),
            schema,
            rebuilt,
            overlay: false,
            _lock: lock,
        })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    pub fn schema(&self) -> &CacheSchema {
        &self.schema
    }

    pub fn was_rebuilt(&self) -> bool {
        self.rebuilt
    }

    pub fn has_overlay(&self) -> bool {
        self.overlay
    }

    fn snapshot_copy_path(&self) -> PathBuf {
        snapshot_copy_for(&self.db_path)
    }

    /// Bring in the bundled snapshot as a read-only overlay.
    ///
    /// The file is copied beside the store when it changed since the last
    /// import, when the store was just rebuilt, or when the copy is gone.
    /// Returns whether a fresh copy was made.
    pub fn import_snapshot(&mut self, snapshot: &Path) -> Result<bool, CacheError> {
        let Some(current) = compute_fingerprint(snapshot) else {
            debug!(path = %snapshot.display(), "No bundled snapshot");
            return Ok(false);
        };

        let stored: Option<Fingerprint> = self.meta_json(META_KEY_SNAPSHOT)?;
        let copy = self.snapshot_copy_path();
        let needs_copy = self.rebuilt || is_stale(stored.as_ref(), Some(&current)) || !copy.exists();

        if needs_copy {
            if !snapshot_matches_schema(snapshot, &self.schema.version) {
                warn!(path = %snapshot.display(), "Bundled snapshot has an incompatible version, ignoring");
                return Ok(false);
            }

            self.detach_overlay()?;
            if copy != snapshot {
                fs::copy(snapshot, &copy)?;
            }

            let tx = self.conn.transaction()?;
            set_meta(&tx, META_KEY_SNAPSHOT, &serde_json::to_string(&current)?)?;
            set_meta(&tx, META_KEY_VERSION, &self.schema.version.to_json()?)?;
            tx.commit()?;

            info!(
                path = %snapshot.display(),
                length = current.length,
                "Imported bundled snapshot"
            );
        }

        self.attach_overlay()?;
        Ok(needs_copy)
    }

    fn attach_overlay(&mut self) -> Result<(), CacheError> {
        if self.overlay {
            return Ok(());
        }
        let uri = format!("file:{}?mode=ro", self.snapshot_copy_path().display());
        self.conn
            .execute("ATTACH DATABASE ?1 AS snapshot", params![uri])?;

        let table = quote_ident(&self.schema.version.table_name);
        let key = quote_ident(&self.schema.key_column);
        self.conn.execute_batch(&format!(
            "CREATE TEMP VIEW IF NOT EXISTS {view} AS
                SELECT * FROM main.{table}
                UNION ALL
                SELECT * FROM {alias}.{table}
                WHERE {key} NOT IN (SELECT {key} FROM main.{table})",
            view = self.overlay_view(),
            alias = SNAPSHOT_ALIAS,
        ))?;
        self.overlay = true;
        Ok(())
    }

    fn detach_overlay(&mut self) -> Result<(), CacheError> {
        if !self.overlay {
            return Ok(());
        }
        self.conn
            .execute_batch(&format!("DROP VIEW IF EXISTS temp.{};", self.overlay_view()))?;
        self.conn.execute("DETACH DATABASE snapshot", [])?;
        self.overlay = false;
        Ok(())
    }

    fn overlay_view(&self) -> String {
        quote_ident(&format!("{}_overlay", self.schema.version.table_name))
    }

    /// Table or view queries read from
    fn read_source(&self) -> String {
        if self.overlay {
            format!("temp.{}", self.overlay_view())
        } else {
            format!("main.{}", quote_ident(&self.schema.version.table_name))
        }
    }

    /// Run a filter against the cached rows (and the snapshot overlay).
    ///
    /// `filter` is a SQL boolean expression over the table's columns; an
    /// empty filter selects everything.
    pub fn query(&self, filter: &str) -> Result<RowSet, CacheError> {
        let sql = select_sql(&self.read_source(), filter);
        debug!(sql = %sql, "Local cache query");
        Ok(query_connection(&self.conn, &sql)?)
    }

    pub fn row_count(&self) -> Result<i64, CacheError> {
        let count = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", self.read_source()),
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Merge rows from the remote source into the store.
    ///
    /// Runs in one transaction; on failure nothing changes and the rows
    /// already present stay queryable.
    pub fn update(&mut self, rows: &RowSet, replace_all: bool) -> Result<usize, CacheError> {
        let table = quote_ident(&self.schema.version.table_name);
        let tx = self.conn.transaction()?;

        if replace_all {
            tx.execute(&format!("DELETE FROM main.{}", table), [])?;
        }

        if !rows.is_empty() {
            let columns: Vec<String> = rows.column_names().iter().map(|c| quote_ident(c)).collect();
            let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();
            let mut stmt = tx.prepare(&format!(
                "INSERT OR REPLACE INTO main.{} ({}) VALUES ({})",
                table,
                columns.join(", "),
                placeholders.join(", "),
            ))?;
            for row in &rows.rows {
                stmt.execute(params_from_iter(row.values().iter()))?;
            }
        }

        set_meta(&tx, META_KEY_LAST_REFRESH, &Utc::now().to_rfc3339())?;
        tx.commit()?;

        debug!(rows = rows.len(), replace_all, "Local cache updated");
        Ok(rows.len())
    }

    /// Merge rows fetched by `fetch_refresh`. A failed merge is reported
    /// as `CacheError::Incomplete`.
    pub fn merge_refresh(&mut self, rows: &RowSet) -> Result<usize, CacheError> {
        self.update(rows, false)
            .map_err(|e| CacheError::Incomplete(format!("merge failed: {}", e)))
    }

    /// Time of the last successful `update`
    pub fn last_refresh(&self) -> Result<Option<DateTime<Utc>>, CacheError> {
        let value = self.meta_value(META_KEY_LAST_REFRESH)?;
        Ok(value
            .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
            .map(|t| t.with_timezone(&Utc)))
    }

    /// Write a batch of per-record state in one transaction
    pub fn store_record_state(&mut self, batch: &[RecordState]) -> Result<(), CacheError> {
        let now = Utc::now().timestamp();
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO record_state (id, key, value, updated_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id, key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            )?;
            for state in batch {
                stmt.execute(params![state.id, state.key, state.value.to_string(), now])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn record_state(&self, id: &str) -> Result<Vec<RecordState>, CacheError> {
        let mut stmt = self
            .conn
            .prepare("SELECT key, value FROM record_state WHERE id = ?1 ORDER BY key")?;
        let rows = stmt.query_map(params![id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut states = Vec::new();
        for row in rows {
            let (key, value) = row?;
            states.push(RecordState {
                id: id.to_string(),
                key,
                value: serde_json::from_str(&value)?,
            });
        }
        Ok(states)
    }

    fn meta_value(&self, key: &str) -> Result<Option<String>, CacheError> {
        Ok(self
            .conn
            .query_row("SELECT value FROM meta WHERE key = ?1", params![key], |row| row.get(0))
            .optional()?)
    }

    fn meta_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        match self.meta_value(key)? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Fingerprint of the last imported snapshot
    pub fn stored_fingerprint(&self) -> Result<Option<Fingerprint>, CacheError> {
        self.meta_json(META_KEY_SNAPSHOT)
    }

    pub fn stored_version(&self) -> Result<Option<VersionTag>, CacheError> {
        self.meta_json(META_KEY_VERSION)
    }
}

impl std::fmt::Debug for LocalCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCache")
            .field("db_path", &self.db_path)
            .field("rebuilt", &self.rebuilt)
            .field("overlay", &self.overlay)
            .finish()
    }
}

fn acquire_lock(db_path: &Path) -> Result<File, CacheError> {
    let lock_path = db_path.with_extension("lock");
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(&lock_path)?;
    match file.try_lock_exclusive() {
        Ok(()) => Ok(file),
        Err(err) if err.kind() == ErrorKind::WouldBlock => {
            warn!(path = %db_path.display(), "Local cache locked by another process");
            Err(CacheError::Locked(db_path.to_path_buf()))
        }
        Err(err) => Err(err.into()),
    }
}

/// Open the database, wiping it first if its version tag does not match.
fn open_checked(db_path: &Path, schema: &CacheSchema) -> Result<(Connection, bool), CacheError> {
    let conn = Connection::open(db_path)?;
    match read_version(&conn) {
        Ok(stored) if !is_version_changed(&schema.version, stored.as_ref()) => {
            return Ok((conn, false));
        }
        Ok(Some(stored)) => {
            warn!(
                expected = ?schema.version,
                found = ?stored,
                "Local cache version mismatch, rebuilding"
            );
        }
        Ok(None) => debug!(path = %db_path.display(), "Initializing new local cache"),
        Err(e) => warn!(path = %db_path.display(), error = %e, "Local cache unreadable, rebuilding"),
    }

    drop(conn);
    remove_store_files(db_path)?;

    let conn = Connection::open(db_path)?;
    init_schema(&conn, schema)?;
    Ok((conn, true))
}

fn init_schema(conn: &Connection, schema: &CacheSchema) -> Result<(), CacheError> {
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS meta (
            key     TEXT PRIMARY KEY,
            value   TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS record_state (
            id          TEXT NOT NULL,
            key         TEXT NOT NULL,
            value       TEXT NOT NULL,
            updated_at  INTEGER NOT NULL,
            PRIMARY KEY(id, key)
        );
        CREATE TABLE IF NOT EXISTS {} ({});",
        quote_ident(&schema.version.table_name),
        schema.version.table_structure,
    ))?;
    set_meta(conn, META_KEY_VERSION, &schema.version.to_json()?)?;
    Ok(())
}

fn remove_store_files(db_path: &Path) -> Result<(), CacheError> {
    let mut doomed = vec![db_path.to_path_buf(), snapshot_copy_for(db_path)];
    for suffix in ["-wal", "-shm", "-journal"] {
        let mut name = db_path.as_os_str().to_owned();
        name.push(suffix);
        doomed.push(PathBuf::from(name));
    }
    for path in doomed {
        match fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "Removed stale cache file"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

fn snapshot_copy_for(db_path: &Path) -> PathBuf {
    db_path.with_file_name(SNAPSHOT_COPY)
}

fn set_meta(conn: &Connection, key: &str, value: &str) -> Result<(), CacheError> {
    conn.execute(
        "INSERT INTO meta (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

/// Version tag recorded in a database, `None` for a database without one
pub(crate) fn read_version(conn: &Connection) -> Result<Option<VersionTag>, CacheError> {
    let has_meta: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'meta'",
        [],
        |row| row.get(0),
    )?;
    if has_meta == 0 {
        return Ok(None);
    }
    let json: Option<String> = conn
        .query_row(
            "SELECT value FROM meta WHERE key = ?1",
            params![META_KEY_VERSION],
            |row| row.get(0),
        )
        .optional()?;
    match json {
        Some(json) => Ok(Some(VersionTag::from_json(&json)?)),
        None => Ok(None),
    }
}

fn snapshot_matches_schema(snapshot: &Path, expected: &VersionTag) -> bool {
    let conn = match Connection::open_with_flags(snapshot, rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY) {
        Ok(conn) => conn,
        Err(_) => return false,
    };
    matches!(read_version(&conn), Ok(stored) if !is_version_changed(expected, stored.as_ref()))
}

pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub(crate) fn select_sql(source: &str, filter: &str) -> String {
    if filter.trim().is_empty() {
        format!("SELECT * FROM {}", source)
    } else {
        format!("SELECT * FROM {} WHERE {}", source, filter)
    }
}

/// Write `value` as JSON into the meta table of `conn`
pub(crate) fn write_meta_json<T: Serialize>(conn: &Connection, key: &str, value: &T) -> Result<(), CacheError> {
    set_meta(conn, key, &serde_json::to_string(value)?)
}

/// Run the refresh query against `remote`. Called without the cache lock
/// held; a failure is reported as `CacheError::Incomplete`.
pub fn fetch_refresh(remote: &dyn RowSource, query: &str) -> Result<RowSet, CacheError> {
    remote
        .execute(query)
        .map_err(|e| CacheError::Incomplete(format!("{}: {}", remote.name(), e)))
}

/// Create a database in the cache layout, for bundling as a snapshot.
pub fn create_snapshot(path: &Path, schema: &CacheSchema, rows: &RowSet) -> Result<(), CacheError> {
    let conn = Connection::open(path)?;
    init_schema(&conn, schema)?;
    write_meta_json(&conn, "created_at", &Utc::now().to_rfc3339())?;
    if !rows.is_empty() {
        let columns: Vec<String> = rows.column_names().iter().map(|c| quote_ident(c)).collect();
        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();
        let mut stmt = conn.prepare(&format!(
            "INSERT OR REPLACE INTO {} ({}) VALUES ({})",
            quote_ident(&schema.version.table_name),
            columns.join(", "),
            placeholders.join(", "),
        ))?;
        for row in &rows.rows {
            stmt.execute(params_from_iter(row.values().iter()))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::FieldValue;

    fn rows(ids: &[&str]) -> RowSet {
        RowSet::from_values(
            vec!["id".into(), "ul_lon".into(), "instrument".into()],
            ids.iter()
                .map(|id| vec![FieldValue::from(*id), FieldValue::Real(1.0), FieldValue::from("ctx")])
                .collect(),
        )
    }

    #[test]
    fn test_open_creates_and_records_version() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::open(&dir.path().join("c.db"), CacheSchema::default()).unwrap();
        assert!(cache.was_rebuilt());
        assert_eq!(cache.stored_version().unwrap(), Some(CacheSchema::default().version));
        assert_eq!(cache.row_count().unwrap(), 0);
    }

    #[test]
    fn test_update_and_query() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = LocalCache::open(&dir.path().join("c.db"), CacheSchema::default()).unwrap();
        assert_eq!(cache.update(&rows(&["a", "b", "c"]), false).unwrap(), 3);
        assert_eq!(cache.query("").unwrap().len(), 3);
        assert_eq!(cache.query("id = 'b'").unwrap().len(), 1);
        assert!(cache.last_refresh().unwrap().is_some());

        cache.update(&rows(&["z"]), true).unwrap();
        let all = cache.query("").unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all.rows[0].get_text("id"), Some("z".into()));
    }

    #[test]
    fn test_failed_update_keeps_existing_rows() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = LocalCache::open(&dir.path().join("c.db"), CacheSchema::default()).unwrap();
        cache.update(&rows(&["a", "b"]), false).unwrap();

        let bad = RowSet::from_values(vec!["no_such_column".into()], vec![vec![FieldValue::Integer(1)]]);
        assert!(cache.update(&bad, true).is_err());
        assert_eq!(cache.row_count().unwrap(), 2);
    }

    #[test]
    fn test_version_change_wipes_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.db");
        {
            let mut cache = LocalCache::open(&path, CacheSchema::default()).unwrap();
            cache.update(&rows(&["a"]), false).unwrap();
        }
        {
            let cache = LocalCache::open(&path, CacheSchema::default()).unwrap();
            assert!(!cache.was_rebuilt());
            assert_eq!(cache.row_count().unwrap(), 1);
        }

        let mut schema = CacheSchema::default();
        schema.version.revision += 1;
        let cache = LocalCache::open(&path, schema.clone()).unwrap();
        assert!(cache.was_rebuilt());
        assert_eq!(cache.row_count().unwrap(), 0);
        assert_eq!(cache.stored_version().unwrap(), Some(schema.version));
    }

    #[test]
    fn test_corrupt_file_is_rebuilt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.db");
        fs::write(&path, b"this is not a sqlite database, not even close....").unwrap();
        let cache = LocalCache::open(&path, CacheSchema::default()).unwrap();
        assert!(cache.was_rebuilt());
        assert_eq!(cache.row_count().unwrap(), 0);
    }

    #[test]
    fn test_second_open_is_locked() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.db");
        let _first = LocalCache::open(&path, CacheSchema::default()).unwrap();
        let second = LocalCache::open(&path, CacheSchema::default());
        assert!(matches!(second, Err(CacheError::Locked(_))));
    }

    #[test]
    fn test_lock_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.db");
        drop(LocalCache::open(&path, CacheSchema::default()).unwrap());
        assert!(LocalCache::open(&path, CacheSchema::default()).is_ok());
    }

    #[test]
    fn test_snapshot_overlay() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = dir.path().join("bundled.db");
        create_snapshot(&snapshot, &CacheSchema::default(), &rows(&["s1", "s2", "a"])).unwrap();

        let data = dir.path().join("data");
        let mut cache = LocalCache::open(&data.join("c.db"), CacheSchema::default()).unwrap();
        cache.update(&rows(&["a", "b"]), false).unwrap();

        assert!(cache.import_snapshot(&snapshot).unwrap());
        assert!(cache.has_overlay());
        // a, b from main; s1, s2 from the snapshot; snapshot's "a" shadowed
        assert_eq!(cache.row_count().unwrap(), 4);
        assert_eq!(cache.stored_fingerprint().unwrap(), compute_fingerprint(&snapshot));

        // Unchanged snapshot is not copied again
        drop(cache);
        let mut cache = LocalCache::open(&data.join("c.db"), CacheSchema::default()).unwrap();
        assert!(!cache.import_snapshot(&snapshot).unwrap());
        assert_eq!(cache.row_count().unwrap(), 4);
    }

    #[test]
    fn test_snapshot_with_other_version_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = dir.path().join("bundled.db");
        let mut old = CacheSchema::default();
        old.version.schema_major = 0;
        create_snapshot(&snapshot, &old, &rows(&["s1"])).unwrap();

        let mut cache = LocalCache::open(&dir.path().join("c.db"), CacheSchema::default()).unwrap();
        assert!(!cache.import_snapshot(&snapshot).unwrap());
        assert!(!cache.has_overlay());
        assert_eq!(cache.row_count().unwrap(), 0);
    }

    #[test]
    fn test_missing_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = LocalCache::open(&dir.path().join("c.db"), CacheSchema::default()).unwrap();
        assert!(!cache.import_snapshot(&dir.path().join("nope.db")).unwrap());
    }

    #[test]
    fn test_record_state_upserts() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = LocalCache::open(&dir.path().join("c.db"), CacheSchema::default()).unwrap();
        let state = |v: i64| RecordState {
            id: "a".into(),
            key: "offset".into(),
            value: serde_json::json!({ "dx": v }),
        };
        cache.store_record_state(&[state(1)]).unwrap();
        cache.store_record_state(&[state(2)]).unwrap();
        assert_eq!(cache.record_state("a").unwrap(), vec![state(2)]);
        assert!(cache.record_state("b").unwrap().is_empty());
    }
}
