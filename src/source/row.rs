/// Generic row contract shared by every backing store
///
/// A source executes a query string and hands back rows with named, typed
/// columns. Nothing else about the backing store leaks into the loader.

use rusqlite::types::{ToSqlOutput, Value, ValueRef};
use rusqlite::ToSql;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::SourceError;

/// A typed column value
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", content = "value")]
pub enum FieldValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

/// Column type as reported by the source
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Integer,
    Real,
    Text,
    Blob,
}

impl FieldValue {
    pub fn kind(&self) -> Option<FieldKind> {
        match self {
            FieldValue::Null => None,
            FieldValue::Integer(_) => Some(FieldKind::Integer),
            FieldValue::Real(_) => Some(FieldKind::Real),
            FieldValue::Text(_) => Some(FieldKind::Text),
            FieldValue::Blob(_) => Some(FieldKind::Blob),
        }
    }

    /// Numeric view; integers widen to f64
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            FieldValue::Integer(v) => Some(v as f64),
            FieldValue::Real(v) => Some(v),
            _ => None,
        }
    }

    /// Textual view; integers are formatted so numeric keys work as ids
    pub fn as_text(&self) -> Option<String> {
        match self {
            FieldValue::Text(s) => Some(s.clone()),
            FieldValue::Integer(v) => Some(v.to_string()),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }
}

impl From<ValueRef<'_>> for FieldValue {
    fn from(value: ValueRef<'_>) -> Self {
        match value {
            ValueRef::Null => FieldValue::Null,
            ValueRef::Integer(v) => FieldValue::Integer(v),
            ValueRef::Real(v) => FieldValue::Real(v),
            ValueRef::Text(bytes) => FieldValue::Text(String::from_utf8_lossy(bytes).into_owned()),
            ValueRef::Blob(bytes) => FieldValue::Blob(bytes.to_vec()),
        }
    }
}

impl ToSql for FieldValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            FieldValue::Null => ToSqlOutput::Owned(Value::Null),
            FieldValue::Integer(v) => ToSqlOutput::Owned(Value::Integer(*v)),
            FieldValue::Real(v) => ToSqlOutput::Owned(Value::Real(*v)),
            FieldValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            FieldValue::Blob(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
        })
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Integer(v)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Real(v)
    }
}

/// Name and type of one result column
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ColumnMeta {
    pub name: String,
    /// `None` when every value seen in the column was NULL
    pub kind: Option<FieldKind>,
}

/// One result row. Column metadata is shared across the rows of a result.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<Vec<ColumnMeta>>,
    values: Vec<FieldValue>,
}

impl Row {
    pub fn new(columns: Arc<Vec<ColumnMeta>>, values: Vec<FieldValue>) -> Self {
        Self { columns, values }
    }

    pub fn columns(&self) -> &[ColumnMeta] {
        &self.columns
    }

    pub fn values(&self) -> &[FieldValue] {
        &self.values
    }

    /// Value of the named column
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        let idx = self.columns.iter().position(|c| c.name == name)?;
        self.values.get(idx)
    }

    pub fn get_f64(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(FieldValue::as_f64)
    }

    pub fn get_text(&self, name: &str) -> Option<String> {
        self.get(name).and_then(FieldValue::as_text)
    }

    /// Name/value pairs in column order
    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.columns
            .iter()
            .map(|c| c.name.as_str())
            .zip(self.values.iter())
    }
}

/// A complete query result
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowSet {
    pub columns: Arc<Vec<ColumnMeta>>,
    pub rows: Vec<Row>,
}

impl RowSet {
    /// Build a result from column names and raw value rows, inferring
    /// column types from the first non-null value in each column.
    pub fn from_values(names: Vec<String>, rows: Vec<Vec<FieldValue>>) -> Self {
        let columns: Vec<ColumnMeta> = names
            .into_iter()
            .enumerate()
            .map(|(i, name)| ColumnMeta {
                kind: rows
                    .iter()
                    .filter_map(|r| r.get(i).and_then(FieldValue::kind))
                    .next(),
                name,
            })
            .collect();
        let columns = Arc::new(columns);
        let rows = rows
            .into_iter()
            .map(|values| Row::new(Arc::clone(&columns), values))
            .collect();
        RowSet { columns, rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }
}

/// Anything that can execute a query string and return rows.
pub trait RowSource: Send + Sync {
    /// Name used in logs and load qualifiers
    fn name(&self) -> &str;

    fn execute(&self, query: &str) -> Result<RowSet, SourceError>;
}

/// Run a query on a SQLite connection and collect the result
pub(crate) fn query_connection(
    conn: &rusqlite::Connection,
    sql: &str,
) -> rusqlite::Result<RowSet> {
    let mut stmt = conn.prepare(sql)?;
    let names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
    let width = names.len();

    let mut rows = Vec::new();
    let mut cursor = stmt.query([])?;
    while let Some(row) = cursor.next()? {
        let mut values = Vec::with_capacity(width);
        for i in 0..width {
            values.push(FieldValue::from(row.get_ref(i)?));
        }
        rows.push(values);
    }

    Ok(RowSet::from_values(names, rows))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infers_kinds_past_nulls() {
        let set = RowSet::from_values(
            vec!["id".into(), "lon".into(), "note".into()],
            vec![
                vec!["a".into(), FieldValue::Null, FieldValue::Null],
                vec!["b".into(), 12.5.into(), FieldValue::Null],
            ],
        );
        assert_eq!(set.columns[0].kind, Some(FieldKind::Text));
        assert_eq!(set.columns[1].kind, Some(FieldKind::Real));
        assert_eq!(set.columns[2].kind, None);
        assert_eq!(set.rows[1].get_f64("lon"), Some(12.5));
        assert_eq!(set.rows[0].get("missing"), None);
    }

    #[test]
    fn test_query_connection() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE t (id INTEGER, name TEXT, v REAL);
             INSERT INTO t VALUES (1, 'one', 1.5), (2, NULL, 2.5);",
        )
        .unwrap();

        let set = query_connection(&conn, "SELECT * FROM t ORDER BY id").unwrap();
        assert_eq!(set.column_names(), vec!["id", "name", "v"]);
        assert_eq!(set.len(), 2);
        assert_eq!(set.rows[0].get_text("id"), Some("1".to_string()));
        assert!(set.rows[1].get("name").unwrap().is_null());
    }

    #[test]
    fn test_field_value_json() {
        let v = FieldValue::Real(3.25);
        let json = serde_json::to_string(&v).unwrap();
        assert_eq!(serde_json::from_str::<FieldValue>(&json).unwrap(), v);
    }
}
