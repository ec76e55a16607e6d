//! Reads and writes of the local oplog table.

use crate::adapter::{Executor, Statement};
use crate::error::SatelliteResult;
use chrono::{DateTime, Utc};
use satellite_protocol::oplog::{format_timestamp, parse_row, parse_timestamp, row_to_json};
use satellite_protocol::{quote_identifier, OpType, OplogEntry, ProtocolError, Row, SqlValue};

const COLUMNS: &str =
    "rowid, namespace, tablename, optype, primaryKey, newRow, oldRow, timestamp";

/// The oplog table the change-capture triggers write to.
#[derive(Debug, Clone)]
pub struct OplogTable {
    table: String,
}

impl OplogTable {
    /// Accesses the oplog table named `table`.
    pub fn new(table: &str) -> Self {
        Self {
            table: quote_identifier(table),
        }
    }

    /// Stamps every unstamped entry after `after_rowid` with `timestamp`.
    pub fn stamp<E: Executor + ?Sized>(
        &self,
        db: &E,
        timestamp: &DateTime<Utc>,
        after_rowid: u64,
    ) -> SatelliteResult<usize> {
        Ok(db.run(&Statement::with_args(
            format!(
                "UPDATE {table} SET timestamp = ? WHERE rowid IN \
                 (SELECT rowid FROM {table} WHERE timestamp IS NULL AND rowid > ? ORDER BY rowid ASC)",
                table = self.table
            ),
            vec![format_timestamp(timestamp).into(), rowid_arg(after_rowid)],
        ))?)
    }

    /// Entries carrying exactly `timestamp`, in rowid order.
    pub fn entries_stamped<E: Executor + ?Sized>(
        &self,
        db: &E,
        timestamp: &DateTime<Utc>,
    ) -> SatelliteResult<Vec<OplogEntry>> {
        self.select(
            db,
            "timestamp = ?",
            vec![format_timestamp(timestamp).into()],
        )
    }

    /// Stamped entries after `after_rowid`, in rowid order.
    pub fn entries_since<E: Executor + ?Sized>(
        &self,
        db: &E,
        after_rowid: u64,
    ) -> SatelliteResult<Vec<OplogEntry>> {
        self.select(
            db,
            "timestamp IS NOT NULL AND rowid > ?",
            vec![rowid_arg(after_rowid)],
        )
    }

    /// Every entry, stamped or not, in rowid order, paged.
    pub fn entries_page<E: Executor + ?Sized>(
        &self,
        db: &E,
        limit: u64,
        offset: u64,
    ) -> SatelliteResult<Vec<OplogEntry>> {
        let rows = db.query(&Statement::with_args(
            format!(
                "SELECT {COLUMNS} FROM {} ORDER BY rowid ASC LIMIT ? OFFSET ?",
                self.table
            ),
            vec![rowid_arg(limit), rowid_arg(offset)],
        ))?;
        rows.iter().map(entry_from_row).collect()
    }

    /// Number of entries.
    pub fn count<E: Executor + ?Sized>(&self, db: &E) -> SatelliteResult<u64> {
        let rows = db.query(&Statement::new(format!(
            "SELECT COUNT(*) AS count FROM {}",
            self.table
        )))?;
        Ok(rows
            .first()
            .and_then(|r| r.get("count"))
            .and_then(SqlValue::as_i64)
            .unwrap_or(0) as u64)
    }

    /// Deletes entries up to and including `rowid`.
    pub fn prune<E: Executor + ?Sized>(&self, db: &E, rowid: u64) -> SatelliteResult<usize> {
        Ok(db.run(&Statement::with_args(
            format!("DELETE FROM {} WHERE rowid <= ?", self.table),
            vec![rowid_arg(rowid)],
        ))?)
    }

    /// Appends an unstamped UPDATE recording that `row` was restored.
    pub fn insert_compensation<E: Executor + ?Sized>(
        &self,
        db: &E,
        namespace: &str,
        tablename: &str,
        primary_key: &Row,
        row: &Row,
    ) -> SatelliteResult<()> {
        db.run(&Statement::with_args(
            format!(
                "INSERT INTO {} (namespace, tablename, optype, primaryKey, newRow, oldRow, timestamp) \
                 VALUES (?, ?, ?, ?, ?, NULL, NULL)",
                self.table
            ),
            vec![
                namespace.into(),
                tablename.into(),
                OpType::Update.as_str().into(),
                row_to_json(primary_key)?.into(),
                row_to_json(row)?.into(),
            ],
        ))?;
        Ok(())
    }

    fn select<E: Executor + ?Sized>(
        &self,
        db: &E,
        condition: &str,
        args: Vec<SqlValue>,
    ) -> SatelliteResult<Vec<OplogEntry>> {
        let rows = db.query(&Statement::with_args(
            format!(
                "SELECT {COLUMNS} FROM {} WHERE {condition} ORDER BY rowid ASC",
                self.table
            ),
            args,
        ))?;
        rows.iter().map(entry_from_row).collect()
    }
}

fn rowid_arg(rowid: u64) -> SqlValue {
    SqlValue::Integer(i64::try_from(rowid).unwrap_or(i64::MAX))
}

fn text_column<'a>(row: &'a Row, column: &str) -> Result<Option<&'a str>, ProtocolError> {
    match row.get(column) {
        None => Err(ProtocolError::invalid_row(format!(
            "oplog row has no {column} column"
        ))),
        Some(SqlValue::Null) => Ok(None),
        Some(SqlValue::Text(s)) => Ok(Some(s)),
        Some(other) => Err(ProtocolError::invalid_row(format!(
            "oplog {column} is not text: {other:?}"
        ))),
    }
}

fn required_text<'a>(row: &'a Row, column: &str) -> Result<&'a str, ProtocolError> {
    text_column(row, column)?
        .ok_or_else(|| ProtocolError::invalid_row(format!("oplog {column} is null")))
}

/// Parses one row of the oplog table.
pub fn entry_from_row(row: &Row) -> SatelliteResult<OplogEntry> {
    let rowid = row
        .get("rowid")
        .and_then(SqlValue::as_i64)
        .ok_or_else(|| ProtocolError::invalid_row("oplog row has no rowid"))?;

    Ok(OplogEntry {
        namespace: required_text(row, "namespace")?.to_string(),
        tablename: required_text(row, "tablename")?.to_string(),
        primary_key: parse_row(required_text(row, "primaryKey")?)?,
        rowid,
        optype: required_text(row, "optype")?.parse()?,
        timestamp: text_column(row, "timestamp")?
            .map(parse_timestamp)
            .transpose()?,
        new_row: text_column(row, "newRow")?.map(parse_row).transpose()?,
        old_row: text_column(row, "oldRow")?.map(parse_row).transpose()?,
    })
}
