//! Dump oplog command implementation.

use super::{open_existing, CommandResult};
use satellite_engine::{OplogTable, SatelliteOpts};
use satellite_protocol::oplog::format_timestamp;
use satellite_protocol::{OplogEntry, Row};
use serde::Serialize;
use std::path::Path;

/// Oplog entry representation for output.
#[derive(Debug, Serialize)]
pub struct OplogRecord {
    /// Local sequence number.
    pub rowid: i64,
    /// Schema namespace.
    pub namespace: String,
    /// Changed table.
    pub tablename: String,
    /// Captured operation.
    pub optype: String,
    /// Primary-key columns.
    pub primary_key: Row,
    /// Snapshot stamp (absent while pending).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    /// Row after the change.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_row: Option<Row>,
    /// Row before the change.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_row: Option<Row>,
}

impl From<OplogEntry> for OplogRecord {
    fn from(entry: OplogEntry) -> Self {
        Self {
            rowid: entry.rowid,
            optype: entry.optype.to_string(),
            timestamp: entry.timestamp.as_ref().map(format_timestamp),
            namespace: entry.namespace,
            tablename: entry.tablename,
            primary_key: entry.primary_key,
            new_row: entry.new_row,
            old_row: entry.old_row,
        }
    }
}

/// Runs the dump-oplog command.
pub fn run(
    path: &Path,
    limit: Option<u64>,
    offset: u64,
    pending_only: bool,
    format: &str,
) -> CommandResult<()> {
    let records = collect(path, limit, offset, pending_only)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
        _ => {
            print_text_output(&records);
        }
    }

    Ok(())
}

/// Reads oplog entries in rowid order.
///
/// `limit` and `offset` page over the whole oplog; `pending_only` then
/// keeps the entries no snapshot has stamped yet.
pub fn collect(
    path: &Path,
    limit: Option<u64>,
    offset: u64,
    pending_only: bool,
) -> CommandResult<Vec<OplogRecord>> {
    let adapter = open_existing(path)?;
    let opts = SatelliteOpts::default();
    let oplog = OplogTable::new(&opts.oplog_table);

    let entries = oplog.entries_page(
        adapter.as_ref(),
        limit.unwrap_or(i64::MAX as u64),
        offset,
    )?;

    Ok(entries
        .into_iter()
        .filter(|entry| !pending_only || entry.timestamp.is_none())
        .map(OplogRecord::from)
        .collect())
}

fn print_text_output(records: &[OplogRecord]) {
    println!("Oplog Entries");
    println!("=============");
    println!();

    if records.is_empty() {
        println!("(no entries)");
        return;
    }

    for record in records {
        let pk = serde_json::to_string(&record.primary_key).unwrap_or_default();
        println!(
            "[{:>6}] {:<7} {}.{} pk={} {}",
            record.rowid,
            record.optype,
            record.namespace,
            record.tablename,
            pk,
            record.timestamp.as_deref().unwrap_or("(pending)")
        );
    }

    println!();
    println!("Total: {} entries", records.len());
}

#[cfg(test)]
mod tests {
    use super::*;
    use satellite_engine::{BundleMigrator, Executor, Migrator, SqliteAdapter, Statement};
    use satellite_protocol::SqlValue;
    use std::sync::Arc;

    fn with_entries(path: &Path) {
        let adapter = Arc::new(SqliteAdapter::open(path).unwrap());
        BundleMigrator::new(adapter.clone(), &SatelliteOpts::default(), Vec::new())
            .up()
            .unwrap();
        adapter
            .run(&Statement::new(
                "INSERT INTO _electric_oplog (namespace, tablename, optype, primaryKey, newRow, oldRow, timestamp) \
                 VALUES ('main', 'parent', 'INSERT', '{\"id\":1}', '{\"id\":1,\"value\":\"a\"}', NULL, '2024-01-01T00:00:00.000Z'), \
                        ('main', 'parent', 'UPDATE', '{\"id\":1}', '{\"id\":1,\"value\":\"b\"}', '{\"id\":1,\"value\":\"a\"}', NULL), \
                        ('main', 'parent', 'DELETE', '{\"id\":1}', NULL, '{\"id\":1,\"value\":\"b\"}', NULL)",
            ))
            .unwrap();
    }

    #[test]
    fn dumps_entries_in_rowid_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.db");
        with_entries(&path);

        let records = collect(&path, None, 0, false).unwrap();

        let ops: Vec<&str> = records.iter().map(|r| r.optype.as_str()).collect();
        assert_eq!(ops, ["INSERT", "UPDATE", "DELETE"]);
        assert_eq!(records[0].rowid, 1);
        assert_eq!(
            records[0].timestamp.as_deref(),
            Some("2024-01-01T00:00:00.000Z")
        );
        assert_eq!(records[1].old_row.as_ref().unwrap()["value"], SqlValue::from("a"));
        assert!(records[2].new_row.is_none());
    }

    #[test]
    fn limit_offset_and_pending_filter() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.db");
        with_entries(&path);

        let page = collect(&path, Some(1), 1, false).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].rowid, 2);

        let pending = collect(&path, None, 0, true).unwrap();
        let rowids: Vec<i64> = pending.iter().map(|r| r.rowid).collect();
        assert_eq!(rowids, [2, 3]);
    }

    #[test]
    fn pending_records_omit_timestamp_in_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.db");
        with_entries(&path);

        let records = collect(&path, None, 0, true).unwrap();
        let json = serde_json::to_value(&records[0]).unwrap();

        assert!(json.get("timestamp").is_none());
        assert_eq!(json["primary_key"]["id"], 1);
    }

    #[test]
    fn missing_database_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(collect(&dir.path().join("missing.db"), None, 0, false).is_err());
    }
}
