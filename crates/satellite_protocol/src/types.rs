//! Core value, relation and transaction types shared by the codec and the
//! oplog model.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// A single SQLite column value.
///
/// Serialises untagged so a [`Row`] round-trips through the JSON snapshots
/// the change-capture triggers write (`json_object(...)`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlValue {
    /// SQL `NULL`.
    Null,
    /// 64-bit signed integer.
    Integer(i64),
    /// 64-bit float.
    Real(f64),
    /// UTF-8 text.
    Text(String),
    /// Raw bytes.
    Blob(Vec<u8>),
}

impl SqlValue {
    /// Returns true for `NULL`.
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Returns the integer value, parsing text if needed.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Integer(v) => Some(*v),
            SqlValue::Text(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Returns the text value, if this is text.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Renders the value as text, the way it travels on the wire and in
    /// primary-key strings. Returns `None` for `NULL`.
    pub fn to_text(&self) -> Option<String> {
        match self {
            SqlValue::Null => None,
            SqlValue::Integer(v) => Some(v.to_string()),
            SqlValue::Real(v) => Some(v.to_string()),
            SqlValue::Text(s) => Some(s.clone()),
            SqlValue::Blob(b) => Some(b.iter().map(|byte| format!("{byte:02x}")).collect()),
        }
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Integer(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Real(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(v: Vec<u8>) -> Self {
        SqlValue::Blob(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

/// A row keyed by column name.
pub type Row = BTreeMap<String, SqlValue>;

/// Builds a [`Row`] from `(column, value)` pairs.
pub fn row<I, K, V>(pairs: I) -> Row
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<SqlValue>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// A table name qualified by its namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QualifiedTablename {
    /// Schema namespace (`main` for the default SQLite schema).
    pub namespace: String,
    /// Table name.
    pub tablename: String,
}

impl QualifiedTablename {
    /// Creates a qualified table name.
    pub fn new(namespace: impl Into<String>, tablename: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            tablename: tablename.into(),
        }
    }

    /// Quoted form usable in SQL: `"namespace"."tablename"`.
    pub fn quoted(&self) -> String {
        format!(
            "{}.{}",
            quote_identifier(&self.namespace),
            quote_identifier(&self.tablename)
        )
    }
}

impl fmt::Display for QualifiedTablename {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.namespace, self.tablename)
    }
}

/// Quotes an SQL identifier with double quotes.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Replication log position. Opaque to the client, ordered
/// lexicographically by the server.
pub type Lsn = Vec<u8>;

/// Encodes an oplog rowid as an outbound LSN (8 bytes, big-endian).
pub fn rowid_to_lsn(rowid: u64) -> Lsn {
    rowid.to_be_bytes().to_vec()
}

/// Decodes an outbound LSN produced by [`rowid_to_lsn`].
///
/// Shorter inputs are treated as left-padded; anything longer than eight
/// bytes is not a rowid position.
pub fn lsn_to_rowid(lsn: &[u8]) -> Option<u64> {
    if lsn.len() > 8 {
        return None;
    }
    let mut buf = [0u8; 8];
    buf[8 - lsn.len()..].copy_from_slice(lsn);
    Some(u64::from_be_bytes(buf))
}

/// Kind of relation announced by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TableType {
    /// Ordinary table.
    #[default]
    Table,
    /// Index.
    Index,
    /// View.
    View,
    /// Trigger.
    Trigger,
}

/// A column of a [`Relation`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationColumn {
    /// Column name.
    pub name: String,
    /// Declared SQL type (e.g. `INTEGER`, `TEXT`).
    pub column_type: String,
    /// Whether the column is part of the primary key.
    pub primary_key: bool,
}

impl RelationColumn {
    /// Creates a column description.
    pub fn new(name: impl Into<String>, column_type: impl Into<String>, primary_key: bool) -> Self {
        Self {
            name: name.into(),
            column_type: column_type.into(),
            primary_key,
        }
    }
}

/// Table schema as exchanged with the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relation {
    /// Identifier, valid for one replication session.
    pub id: u32,
    /// Schema name.
    pub schema: String,
    /// Table name.
    pub table: String,
    /// Kind of relation.
    pub table_type: TableType,
    /// Columns in declaration order.
    pub columns: Vec<RelationColumn>,
}

impl Relation {
    /// Iterates over primary-key column names in declaration order.
    pub fn primary_keys(&self) -> impl Iterator<Item = &str> {
        self.columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| c.name.as_str())
    }
}

/// Relations keyed by table name.
pub type RelationsCache = HashMap<String, Relation>;

/// Kind of a row change inside a [`Transaction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    /// Row inserted.
    Insert,
    /// Row updated.
    Update,
    /// Row deleted.
    Delete,
}

/// A single row change.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    /// Relation the row belongs to.
    pub relation: Relation,
    /// Kind of change.
    pub change_type: ChangeType,
    /// New row values (insert/update).
    pub record: Option<Row>,
    /// Previous row values (update/delete).
    pub old_record: Option<Row>,
}

/// A transaction exchanged with the server. Its changes apply atomically and
/// in order.
#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    /// Position of this transaction in the sender's log.
    pub lsn: Lsn,
    /// Commit time in milliseconds since the Unix epoch.
    pub commit_timestamp: u64,
    /// Ordered row changes.
    pub changes: Vec<Change>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sql_value_json_shape() {
        let r = row([
            ("id", SqlValue::Integer(1)),
            ("value", SqlValue::from("a")),
            ("other", SqlValue::Null),
        ]);
        let json = serde_json::to_string(&r).unwrap();
        assert_eq!(json, r#"{"id":1,"other":null,"value":"a"}"#);

        let back: Row = serde_json::from_str(&json).unwrap();
        assert_eq!(back, r);
    }

    #[test]
    fn real_is_not_integer() {
        let v: SqlValue = serde_json::from_str("1.5").unwrap();
        assert_eq!(v, SqlValue::Real(1.5));
    }

    #[test]
    fn qualified_display_and_quoting() {
        let qt = QualifiedTablename::new("main", "parent");
        assert_eq!(qt.to_string(), "main.parent");
        assert_eq!(qt.quoted(), "\"main\".\"parent\"");
        assert_eq!(quote_identifier("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn lsn_rowid_ordering() {
        assert_eq!(lsn_to_rowid(&rowid_to_lsn(42)), Some(42));
        assert!(rowid_to_lsn(255) < rowid_to_lsn(256));
        assert_eq!(lsn_to_rowid(&[1]), Some(1));
        assert_eq!(lsn_to_rowid(&[0; 9]), None);
    }

    #[test]
    fn relation_primary_keys() {
        let rel = Relation {
            id: 1,
            schema: "public".into(),
            table: "child".into(),
            table_type: TableType::Table,
            columns: vec![
                RelationColumn::new("id", "INTEGER", true),
                RelationColumn::new("parent", "INTEGER", false),
            ],
        };
        assert_eq!(rel.primary_keys().collect::<Vec<_>>(), vec!["id"]);
    }
}
