//! Oplog entries and the transformations between captured row changes,
//! per-column change sets and wire transactions.
//!
//! Every function here is pure. Callers pass entries already sorted by
//! capture order (ascending rowid); out-of-order input silently produces a
//! wrong last-write-wins result.

use crate::error::{ProtocolError, ProtocolResult};
use crate::types::{
    rowid_to_lsn, Change, ChangeType, QualifiedTablename, RelationsCache, Row, SqlValue,
    Transaction,
};
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

/// Namespace given to rows received from the server.
pub const DEFAULT_NAMESPACE: &str = "main";

/// Operation recorded by the change-capture triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpType {
    /// Row inserted.
    Insert,
    /// Row updated.
    Update,
    /// Row deleted.
    Delete,
}

impl OpType {
    /// Name stored in the oplog table.
    pub fn as_str(&self) -> &'static str {
        match self {
            OpType::Insert => "INSERT",
            OpType::Update => "UPDATE",
            OpType::Delete => "DELETE",
        }
    }
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OpType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INSERT" => Ok(OpType::Insert),
            "UPDATE" => Ok(OpType::Update),
            "DELETE" => Ok(OpType::Delete),
            other => Err(ProtocolError::UnknownOpType(other.to_string())),
        }
    }
}

/// Operation type after normalisation: inserts and updates collapse into
/// upserts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangesOpType {
    /// Row must be removed.
    Delete,
    /// Row must exist with the merged column values.
    Upsert,
}

/// One row of the local oplog table.
#[derive(Debug, Clone, PartialEq)]
pub struct OplogEntry {
    /// Schema namespace of the changed table.
    pub namespace: String,
    /// Changed table.
    pub tablename: String,
    /// Primary-key columns of the changed row.
    pub primary_key: Row,
    /// Local sequence number (`-1` for entries built from remote data).
    pub rowid: i64,
    /// Captured operation.
    pub optype: OpType,
    /// Capture time, `None` until a snapshot stamps it.
    pub timestamp: Option<DateTime<Utc>>,
    /// Row after the change.
    pub new_row: Option<Row>,
    /// Row before the change.
    pub old_row: Option<Row>,
}

impl OplogEntry {
    /// Qualified name of the changed table.
    pub fn qualified_tablename(&self) -> QualifiedTablename {
        QualifiedTablename::new(self.namespace.clone(), self.tablename.clone())
    }

    /// Capture time in milliseconds, `0` when not yet stamped.
    pub fn timestamp_millis(&self) -> i64 {
        self.timestamp.map(|t| t.timestamp_millis()).unwrap_or(0)
    }
}

/// A column value together with the time it was written.
#[derive(Debug, Clone, PartialEq)]
pub struct OplogColumnChange {
    /// Column value.
    pub value: SqlValue,
    /// Write time in milliseconds.
    pub timestamp: i64,
}

impl OplogColumnChange {
    /// Creates a column change.
    pub fn new(value: impl Into<SqlValue>, timestamp: i64) -> Self {
        Self {
            value: value.into(),
            timestamp,
        }
    }
}

/// Column name to its latest change.
pub type OplogColumnChanges = BTreeMap<String, OplogColumnChange>;

/// All changes to one row, collapsed.
#[derive(Debug, Clone, PartialEq)]
pub struct OplogEntryChanges {
    /// Schema namespace.
    pub namespace: String,
    /// Table name.
    pub tablename: String,
    /// Primary-key columns of the row.
    pub primary_key_cols: Row,
    /// Effective operation.
    pub optype: ChangesOpType,
    /// Changed columns.
    pub changes: OplogColumnChanges,
}

/// Changes grouped by table, then by primary-key string.
pub type OplogTableChanges = BTreeMap<QualifiedTablename, BTreeMap<String, OplogEntryChanges>>;

/// Formats a capture timestamp the way it is stored in the oplog table.
pub fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parses a stored capture timestamp.
pub fn parse_timestamp(s: &str) -> ProtocolResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| ProtocolError::InvalidTimestamp(format!("{s}: {e}")))
}

/// Converts milliseconds since the epoch into a capture timestamp.
pub fn timestamp_from_millis(millis: i64) -> ProtocolResult<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| ProtocolError::InvalidTimestamp(millis.to_string()))
}

/// Parses a JSON row snapshot as written by the triggers.
pub fn parse_row(json: &str) -> ProtocolResult<Row> {
    Ok(serde_json::from_str(json)?)
}

/// Serialises a row snapshot to JSON.
pub fn row_to_json(row: &Row) -> ProtocolResult<String> {
    Ok(serde_json::to_string(row)?)
}

/// Builds the stable key of a row: primary-key values as text, sorted and
/// joined with `_`, so column declaration order does not matter.
pub fn primary_key_to_str(primary_key_cols: &Row) -> String {
    let mut values: Vec<String> = primary_key_cols
        .values()
        .map(|v| v.to_text().unwrap_or_default())
        .collect();
    values.sort();
    values.join("_")
}

/// Turns one oplog entry into its per-column change set.
///
/// Columns equal in `old_row` and `new_row` are dropped; everything else is
/// stamped with the entry timestamp.
pub fn entry_to_changes(entry: &OplogEntry) -> OplogEntryChanges {
    let timestamp = entry.timestamp_millis();
    let optype = match entry.optype {
        OpType::Delete => ChangesOpType::Delete,
        OpType::Insert | OpType::Update => ChangesOpType::Upsert,
    };

    let mut changes = OplogColumnChanges::new();
    if let Some(new_row) = &entry.new_row {
        for (column, value) in new_row {
            let unchanged = entry
                .old_row
                .as_ref()
                .and_then(|old| old.get(column))
                .is_some_and(|old| old == value);
            if !unchanged {
                changes.insert(column.clone(), OplogColumnChange::new(value.clone(), timestamp));
            }
        }
    }

    OplogEntryChanges {
        namespace: entry.namespace.clone(),
        tablename: entry.tablename.clone(),
        primary_key_cols: entry.primary_key.clone(),
        optype,
        changes,
    }
}

/// Folds entries into one change set per row.
///
/// The last entry decides the operation; column changes overwrite earlier
/// ones. An INSERT following a DELETE of the same row nulls every column it
/// does not set itself, so a recreated row never inherits values from
/// before its deletion.
pub fn operations_to_table_changes(entries: &[OplogEntry]) -> OplogTableChanges {
    let mut acc = OplogTableChanges::new();

    for entry in entries {
        let entry_changes = entry_to_changes(entry);
        let key = primary_key_to_str(&entry_changes.primary_key_cols);
        let rows = acc.entry(entry.qualified_tablename()).or_default();

        match rows.get_mut(&key) {
            None => {
                rows.insert(key, entry_changes);
            }
            Some(existing) => {
                if entry.optype == OpType::Insert && existing.optype == ChangesOpType::Delete {
                    let timestamp = entry.timestamp_millis();
                    for (column, change) in existing.changes.iter_mut() {
                        if !entry_changes.changes.contains_key(column) {
                            *change = OplogColumnChange::new(SqlValue::Null, timestamp);
                        }
                    }
                }
                existing.optype = entry_changes.optype;
                existing.changes.extend(entry_changes.changes);
            }
        }
    }

    acc
}

/// Converts a transaction received from the server into oplog entries.
///
/// Primary keys come from the local relation of each table, since the
/// server's relation messages do not flag key columns.
pub fn from_transaction(
    transaction: &Transaction,
    relations: &RelationsCache,
) -> ProtocolResult<Vec<OplogEntry>> {
    let timestamp = timestamp_from_millis(transaction.commit_timestamp as i64)?;

    transaction
        .changes
        .iter()
        .map(|change| {
            let relation = relations
                .get(&change.relation.table)
                .ok_or_else(|| ProtocolError::UnknownRelation(change.relation.table.clone()))?;

            let source = change
                .record
                .as_ref()
                .or(change.old_record.as_ref())
                .ok_or_else(|| ProtocolError::invalid_row("change carries no row data"))?;

            let primary_key = relation
                .primary_keys()
                .map(|col| {
                    let value = source.get(col).cloned().unwrap_or(SqlValue::Null);
                    (col.to_string(), value)
                })
                .collect();

            let optype = match change.change_type {
                ChangeType::Insert => OpType::Insert,
                ChangeType::Update => OpType::Update,
                ChangeType::Delete => OpType::Delete,
            };

            Ok(OplogEntry {
                namespace: DEFAULT_NAMESPACE.to_string(),
                tablename: change.relation.table.clone(),
                primary_key,
                rowid: -1,
                optype,
                timestamp: Some(timestamp),
                new_row: change.record.clone(),
                old_row: change.old_record.clone(),
            })
        })
        .collect()
}

struct PendingChange<'a> {
    table: QualifiedTablename,
    key: String,
    has_insert: bool,
    first_old_row: Option<&'a Row>,
    last_new_row: Option<&'a Row>,
    last_old_row: Option<&'a Row>,
}

/// Converts local oplog entries into outbound transactions.
///
/// Consecutive entries sharing a capture timestamp (one snapshot) form one
/// transaction whose LSN is its highest rowid. Repeated changes to a row
/// within a transaction collapse into a single change carrying the full
/// latest row.
pub fn to_transactions(
    entries: &[OplogEntry],
    relations: &RelationsCache,
) -> ProtocolResult<Vec<Transaction>> {
    let mut transactions = Vec::new();

    for group in entries.chunk_by(|a, b| a.timestamp == b.timestamp) {
        let folded = operations_to_table_changes(group);

        let mut order: Vec<PendingChange<'_>> = Vec::new();
        let mut index: HashMap<(QualifiedTablename, String), usize> = HashMap::new();

        for entry in group {
            let table = entry.qualified_tablename();
            let key = primary_key_to_str(&entry.primary_key);
            let slot = *index.entry((table.clone(), key.clone())).or_insert_with(|| {
                order.push(PendingChange {
                    table,
                    key,
                    has_insert: false,
                    first_old_row: entry.old_row.as_ref(),
                    last_new_row: None,
                    last_old_row: None,
                });
                order.len() - 1
            });
            let pending = &mut order[slot];
            pending.has_insert |= entry.optype == OpType::Insert;
            if entry.new_row.is_some() {
                pending.last_new_row = entry.new_row.as_ref();
            }
            if entry.old_row.is_some() {
                pending.last_old_row = entry.old_row.as_ref();
            }
        }

        let mut changes = Vec::with_capacity(order.len());
        for pending in order {
            let relation = relations
                .get(&pending.table.tablename)
                .ok_or_else(|| ProtocolError::UnknownRelation(pending.table.tablename.clone()))?;
            let optype = folded
                .get(&pending.table)
                .and_then(|rows| rows.get(&pending.key))
                .map(|c| c.optype)
                .unwrap_or(ChangesOpType::Upsert);

            let change = match optype {
                ChangesOpType::Delete => Change {
                    relation: relation.clone(),
                    change_type: ChangeType::Delete,
                    record: None,
                    old_record: pending.last_old_row.cloned(),
                },
                ChangesOpType::Upsert if pending.has_insert => Change {
                    relation: relation.clone(),
                    change_type: ChangeType::Insert,
                    record: pending.last_new_row.cloned(),
                    old_record: None,
                },
                ChangesOpType::Upsert => Change {
                    relation: relation.clone(),
                    change_type: ChangeType::Update,
                    record: pending.last_new_row.cloned(),
                    old_record: pending.first_old_row.cloned(),
                },
            };
            changes.push(change);
        }

        let max_rowid = group.iter().map(|e| e.rowid).max().unwrap_or(0).max(0) as u64;
        let commit_timestamp = group
            .first()
            .map(|e| e.timestamp_millis())
            .unwrap_or(0)
            .max(0) as u64;

        transactions.push(Transaction {
            lsn: rowid_to_lsn(max_rowid),
            commit_timestamp,
            changes,
        });
    }

    Ok(transactions)
}

/// Last full row seen for every (table, primary key), taking `new_row` and
/// falling back to `old_row` so a deleted row keeps its pre-delete values.
pub fn last_known_rows(entries: &[OplogEntry]) -> HashMap<(QualifiedTablename, String), Row> {
    let mut rows = HashMap::new();
    for entry in entries {
        if let Some(row) = entry.new_row.as_ref().or(entry.old_row.as_ref()) {
            rows.insert(
                (entry.qualified_tablename(), primary_key_to_str(&entry.primary_key)),
                row.clone(),
            );
        }
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{row, Relation, RelationColumn, TableType};

    fn ts(millis: i64) -> Option<DateTime<Utc>> {
        Some(timestamp_from_millis(millis).unwrap())
    }

    fn parent_entry(
        rowid: i64,
        optype: OpType,
        millis: i64,
        new_row: Option<Row>,
        old_row: Option<Row>,
    ) -> OplogEntry {
        OplogEntry {
            namespace: "main".into(),
            tablename: "parent".into(),
            primary_key: row([("id", SqlValue::Integer(1))]),
            rowid,
            optype,
            timestamp: ts(millis),
            new_row,
            old_row,
        }
    }

    fn parent_relation() -> Relation {
        Relation {
            id: 1,
            schema: "main".into(),
            table: "parent".into(),
            table_type: TableType::Table,
            columns: vec![
                RelationColumn::new("id", "INTEGER", true),
                RelationColumn::new("value", "TEXT", false),
                RelationColumn::new("otherValue", "INTEGER", false),
            ],
        }
    }

    fn relations() -> RelationsCache {
        let mut r = RelationsCache::new();
        r.insert("parent".into(), parent_relation());
        r
    }

    #[test]
    fn optype_parse() {
        assert_eq!("DELETE".parse::<OpType>().unwrap(), OpType::Delete);
        assert!(matches!(
            "COMPENSATION".parse::<OpType>(),
            Err(ProtocolError::UnknownOpType(_))
        ));
    }

    #[test]
    fn timestamp_format_round_trip() {
        let t = timestamp_from_millis(1_700_000_000_123).unwrap();
        let s = format_timestamp(&t);
        assert_eq!(s, "2023-11-14T22:13:20.123Z");
        assert_eq!(parse_timestamp(&s).unwrap(), t);
    }

    #[test]
    fn entry_diff_keeps_only_changed_columns() {
        let entry = parent_entry(
            2,
            OpType::Update,
            5,
            Some(row([
                ("id", SqlValue::Integer(1)),
                ("value", SqlValue::from("b")),
                ("otherValue", SqlValue::Integer(0)),
            ])),
            Some(row([
                ("id", SqlValue::Integer(1)),
                ("value", SqlValue::from("a")),
                ("otherValue", SqlValue::Integer(0)),
            ])),
        );
        let changes = entry_to_changes(&entry);
        assert_eq!(changes.optype, ChangesOpType::Upsert);
        assert_eq!(changes.changes.len(), 1);
        assert_eq!(changes.changes["value"], OplogColumnChange::new("b", 5));
    }

    #[test]
    fn null_differs_from_absent() {
        let entry = parent_entry(
            1,
            OpType::Insert,
            1,
            Some(row([("id", SqlValue::Integer(1)), ("value", SqlValue::Null)])),
            None,
        );
        let changes = entry_to_changes(&entry);
        assert_eq!(changes.changes["value"].value, SqlValue::Null);
    }

    #[test]
    fn delete_has_no_column_changes() {
        let entry = parent_entry(
            1,
            OpType::Delete,
            1,
            None,
            Some(row([("id", SqlValue::Integer(1)), ("value", SqlValue::from("a"))])),
        );
        let changes = entry_to_changes(&entry);
        assert_eq!(changes.optype, ChangesOpType::Delete);
        assert!(changes.changes.is_empty());
    }

    #[test]
    fn batch_coalescing() {
        let entries = vec![
            parent_entry(
                1,
                OpType::Insert,
                1,
                Some(row([("id", SqlValue::Integer(1)), ("value", SqlValue::from("a"))])),
                None,
            ),
            parent_entry(
                2,
                OpType::Update,
                2,
                Some(row([("id", SqlValue::Integer(1)), ("value", SqlValue::from("b"))])),
                Some(row([("id", SqlValue::Integer(1)), ("value", SqlValue::from("a"))])),
            ),
        ];

        let table_changes = operations_to_table_changes(&entries);
        let rows = &table_changes[&QualifiedTablename::new("main", "parent")];
        assert_eq!(rows.len(), 1);

        let changes = &rows["1"];
        assert_eq!(changes.optype, ChangesOpType::Upsert);
        assert_eq!(changes.changes["value"], OplogColumnChange::new("b", 2));
        assert_eq!(changes.changes["id"], OplogColumnChange::new(1i64, 1));
    }

    #[test]
    fn insert_after_delete_nullifies_unset_columns() {
        let entries = vec![
            parent_entry(
                1,
                OpType::Insert,
                1,
                Some(row([("id", SqlValue::Integer(1)), ("value", SqlValue::from("x"))])),
                None,
            ),
            parent_entry(
                2,
                OpType::Delete,
                2,
                None,
                Some(row([("id", SqlValue::Integer(1)), ("value", SqlValue::from("x"))])),
            ),
            parent_entry(
                3,
                OpType::Insert,
                3,
                Some(row([("id", SqlValue::Integer(1))])),
                None,
            ),
        ];

        let table_changes = operations_to_table_changes(&entries);
        let changes = &table_changes[&QualifiedTablename::new("main", "parent")]["1"];
        assert_eq!(changes.optype, ChangesOpType::Upsert);
        assert_eq!(changes.changes["value"], OplogColumnChange::new(SqlValue::Null, 3));
    }

    #[test]
    fn primary_key_string_is_order_independent() {
        let a = row([("a", SqlValue::from("y")), ("b", SqlValue::from("x"))]);
        let b = row([("b", SqlValue::from("y")), ("a", SqlValue::from("x"))]);
        assert_eq!(primary_key_to_str(&a), "x_y");
        assert_eq!(primary_key_to_str(&a), primary_key_to_str(&b));
    }

    #[test]
    fn oplog_entries_from_transaction() {
        let transaction = Transaction {
            lsn: vec![0],
            commit_timestamp: 0,
            changes: vec![Change {
                relation: parent_relation(),
                change_type: ChangeType::Insert,
                record: Some(row([("id", SqlValue::Integer(0))])),
                old_record: None,
            }],
        };

        let entries = from_transaction(&transaction, &relations()).unwrap();
        assert_eq!(
            entries,
            vec![OplogEntry {
                namespace: "main".into(),
                tablename: "parent".into(),
                primary_key: row([("id", SqlValue::Integer(0))]),
                rowid: -1,
                optype: OpType::Insert,
                timestamp: ts(0),
                new_row: Some(row([("id", SqlValue::Integer(0))])),
                old_row: None,
            }]
        );
    }

    #[test]
    fn from_transaction_unknown_relation() {
        let mut relation = parent_relation();
        relation.table = "missing".into();
        let transaction = Transaction {
            lsn: vec![],
            commit_timestamp: 0,
            changes: vec![Change {
                relation,
                change_type: ChangeType::Delete,
                record: None,
                old_record: Some(row([("id", SqlValue::Integer(0))])),
            }],
        };
        assert!(matches!(
            from_transaction(&transaction, &relations()),
            Err(ProtocolError::UnknownRelation(_))
        ));
    }

    #[test]
    fn transactions_grouped_by_timestamp() {
        let mut second = parent_entry(
            2,
            OpType::Insert,
            1,
            Some(row([("id", SqlValue::Integer(2)), ("value", SqlValue::from("b"))])),
            None,
        );
        second.primary_key = row([("id", SqlValue::Integer(2))]);
        let entries = vec![
            parent_entry(
                1,
                OpType::Insert,
                1,
                Some(row([("id", SqlValue::Integer(1)), ("value", SqlValue::from("a"))])),
                None,
            ),
            second,
            parent_entry(
                3,
                OpType::Update,
                2,
                Some(row([("id", SqlValue::Integer(1)), ("value", SqlValue::from("c"))])),
                Some(row([("id", SqlValue::Integer(1)), ("value", SqlValue::from("a"))])),
            ),
        ];

        let txns = to_transactions(&entries, &relations()).unwrap();
        assert_eq!(txns.len(), 2);

        assert_eq!(txns[0].lsn, rowid_to_lsn(2));
        assert_eq!(txns[0].commit_timestamp, 1);
        assert_eq!(txns[0].changes.len(), 2);
        assert_eq!(txns[0].changes[0].change_type, ChangeType::Insert);

        assert_eq!(txns[1].lsn, rowid_to_lsn(3));
        let update = &txns[1].changes[0];
        assert_eq!(update.change_type, ChangeType::Update);
        assert_eq!(update.record.as_ref().unwrap()["value"], SqlValue::from("c"));
        assert_eq!(update.old_record.as_ref().unwrap()["value"], SqlValue::from("a"));
    }

    #[test]
    fn repeated_row_in_one_snapshot_collapses() {
        let entries = vec![
            parent_entry(
                1,
                OpType::Insert,
                7,
                Some(row([("id", SqlValue::Integer(1)), ("value", SqlValue::from("a"))])),
                None,
            ),
            parent_entry(
                2,
                OpType::Update,
                7,
                Some(row([("id", SqlValue::Integer(1)), ("value", SqlValue::from("b"))])),
                Some(row([("id", SqlValue::Integer(1)), ("value", SqlValue::from("a"))])),
            ),
            parent_entry(
                3,
                OpType::Delete,
                7,
                None,
                Some(row([("id", SqlValue::Integer(1)), ("value", SqlValue::from("b"))])),
            ),
        ];

        let txns = to_transactions(&entries, &relations()).unwrap();
        assert_eq!(txns.len(), 1);
        assert_eq!(txns[0].changes.len(), 1);
        let change = &txns[0].changes[0];
        assert_eq!(change.change_type, ChangeType::Delete);
        assert_eq!(change.old_record.as_ref().unwrap()["value"], SqlValue::from("b"));
    }

    #[test]
    fn last_known_rows_survive_delete() {
        let entries = vec![
            parent_entry(
                1,
                OpType::Insert,
                1,
                Some(row([("id", SqlValue::Integer(1)), ("value", SqlValue::from("1"))])),
                None,
            ),
            parent_entry(
                2,
                OpType::Delete,
                2,
                None,
                Some(row([("id", SqlValue::Integer(1)), ("value", SqlValue::from("1"))])),
            ),
        ];
        let rows = last_known_rows(&entries);
        let known = &rows[&(QualifiedTablename::new("main", "parent"), "1".to_string())];
        assert_eq!(known["value"], SqlValue::from("1"));
    }
}
