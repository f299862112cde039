/// Staleness detection for imported snapshots and the local cache schema
///
/// Both guards are cheap identity checks: a snapshot is identified by its
/// size and modification time, the cache by a version tag. Neither ever
/// compares contents.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Identity of a bundled snapshot file
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    /// Modification time in UTC milliseconds
    pub last_modified: i64,
    /// File length in bytes
    pub length: u64,
}

impl Fingerprint {
    pub fn new(last_modified: i64, length: u64) -> Self {
        Self { last_modified, length }
    }

    /// Modification time as a chrono timestamp, if representable
    pub fn modified_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.last_modified).single()
    }
}

/// Storage format identity of the local cache.
///
/// `table_structure` is the column definition list the cache table is
/// created with, so changing a column changes the tag.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct VersionTag {
    pub schema_major: u32,
    pub schema_minor: u32,
    pub table_name: String,
    pub table_structure: String,
    pub revision: u32,
}

impl VersionTag {
    pub fn new(
        schema_major: u32,
        schema_minor: u32,
        table_name: impl Into<String>,
        table_structure: impl Into<String>,
        revision: u32,
    ) -> Self {
        Self {
            schema_major,
            schema_minor,
            table_name: table_name.into(),
            table_structure: table_structure.into(),
            revision,
        }
    }

    /// Convert to JSON string for meta table storage
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse from JSON string (from the meta table)
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Read a file's fingerprint from its metadata.
///
/// Returns `None` when the file does not exist or its metadata is unreadable.
pub fn compute_fingerprint(path: &Path) -> Option<Fingerprint> {
    let meta = fs::metadata(path).ok()?;
    if !meta.is_file() {
        return None;
    }
    let modified: DateTime<Utc> = meta.modified().ok()?.into();
    Some(Fingerprint::new(modified.timestamp_millis(), meta.len()))
}

/// True when the last known fingerprint no longer describes the current file.
pub fn is_stale(last_known: Option<&Fingerprint>, current: Option<&Fingerprint>) -> bool {
    last_known != current
}

/// True when the stored tag is missing or differs in any field.
pub fn is_version_changed(expected: &VersionTag, stored: Option<&VersionTag>) -> bool {
    stored != Some(expected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn tag() -> VersionTag {
        VersionTag::new(2, 1, "stamps", "id TEXT PRIMARY KEY, lon REAL", 7)
    }

    #[test]
    fn test_equal_fingerprints_are_fresh() {
        let a = Fingerprint::new(1_700_000_000_000, 4096);
        let b = Fingerprint::new(1_700_000_000_000, 4096);
        assert!(!is_stale(Some(&a), Some(&b)));
        assert!(!is_stale(None, None));
    }

    #[test]
    fn test_any_field_difference_is_stale() {
        let base = Fingerprint::new(1_700_000_000_000, 4096);
        assert!(is_stale(Some(&base), Some(&Fingerprint::new(1_700_000_000_001, 4096))));
        assert!(is_stale(Some(&base), Some(&Fingerprint::new(1_700_000_000_000, 4097))));
        assert!(is_stale(Some(&base), None));
        assert!(is_stale(None, Some(&base)));
    }

    #[test]
    fn test_compute_fingerprint_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(compute_fingerprint(&dir.path().join("absent.db")), None);
        // Directories are not snapshots
        assert_eq!(compute_fingerprint(dir.path()), None);
    }

    #[test]
    fn test_compute_fingerprint_reads_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.db");
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(&[0u8; 123]).unwrap();
        drop(file);

        let fp = compute_fingerprint(&path).unwrap();
        assert_eq!(fp.length, 123);
        assert!(fp.modified_at().is_some());
        assert!(!is_stale(Some(&fp), compute_fingerprint(&path).as_ref()));
    }

    #[test]
    fn test_version_changed() {
        let expected = tag();
        assert!(is_version_changed(&expected, None));
        assert!(!is_version_changed(&expected, Some(&tag())));

        let mut other = tag();
        other.revision = 8;
        assert!(is_version_changed(&expected, Some(&other)));

        let mut other = tag();
        other.table_structure.push_str(", lat REAL");
        assert!(is_version_changed(&expected, Some(&other)));
    }

    #[test]
    fn test_version_tag_json() {
        let json = tag().to_json().unwrap();
        assert_eq!(VersionTag::from_json(&json).unwrap(), tag());
    }
}
