//! Writes merged remote changes to the local database.
//!
//! The applier runs inside the caller's transaction. Change capture is
//! switched off for every table it writes, so applied rows never re-enter the
//! oplog. With compensations on, rows whose removal would break a foreign key
//! are restored from their last known values and the restore is logged as an
//! oplog UPDATE so it replicates back to the server.

use crate::adapter::{Executor, Statement};
use crate::error::SatelliteResult;
use crate::oplog_table::OplogTable;
use crate::schema::{ForeignKey, LocalSchema};
use satellite_protocol::{
    primary_key_to_str, quote_identifier, ChangesOpType, OplogEntryChanges, OplogTableChanges,
    QualifiedTablename, Row, SqlValue,
};
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{debug, warn};

/// A row identified by its table and primary-key string.
pub(crate) type RowKey = (QualifiedTablename, String);

/// What one apply wrote.
#[derive(Debug, Default)]
pub(crate) struct ApplyOutcome {
    /// Tables written by the incoming changes.
    pub tables: BTreeSet<QualifiedTablename>,
    /// Rows restored to keep foreign keys intact.
    pub compensations: usize,
}

pub(crate) struct Applier<'a> {
    schema: &'a LocalSchema,
    oplog: &'a OplogTable,
    trigger_settings: String,
    compensations: bool,
    history: &'a HashMap<RowKey, Row>,
}

impl<'a> Applier<'a> {
    /// `history` holds the last known values of locally changed rows; they
    /// are the restore source for missing parents.
    pub fn new(
        schema: &'a LocalSchema,
        oplog: &'a OplogTable,
        trigger_settings_table: &str,
        compensations: bool,
        history: &'a HashMap<RowKey, Row>,
    ) -> Self {
        Self {
            schema,
            oplog,
            trigger_settings: quote_identifier(trigger_settings_table),
            compensations,
            history,
        }
    }

    pub fn apply(
        &self,
        tx: &dyn Executor,
        merged: &OplogTableChanges,
    ) -> SatelliteResult<ApplyOutcome> {
        tx.run(&"PRAGMA defer_foreign_keys = ON".into())?;

        let mut disabled = BTreeSet::new();
        let mut deleted: HashMap<RowKey, Row> = HashMap::new();
        let mut upserted: Vec<(QualifiedTablename, Row)> = Vec::new();

        for (table, rows) in merged {
            self.disable_triggers(tx, &mut disabled, table)?;
            for (key, change) in rows {
                match change.optype {
                    ChangesOpType::Delete => {
                        if let Some(existing) = select_row(tx, table, &change.primary_key_cols)? {
                            deleted.insert((table.clone(), key.clone()), existing);
                        }
                        tx.run(&delete_statement(table, &change.primary_key_cols))?;
                    }
                    ChangesOpType::Upsert => {
                        tx.run(&upsert_statement(table, change))?;
                        upserted.push((table.clone(), change.primary_key_cols.clone()));
                    }
                }
            }
        }

        let mut outcome = ApplyOutcome {
            tables: merged.keys().cloned().collect(),
            compensations: 0,
        };
        if self.compensations {
            outcome.compensations = self.compensate(tx, &mut disabled, &deleted, &upserted)?;
        }

        for table in &disabled {
            set_trigger_flag(tx, &self.trigger_settings, table, 1)?;
        }
        Ok(outcome)
    }

    fn disable_triggers(
        &self,
        tx: &dyn Executor,
        disabled: &mut BTreeSet<QualifiedTablename>,
        table: &QualifiedTablename,
    ) -> SatelliteResult<()> {
        if disabled.insert(table.clone()) {
            set_trigger_flag(tx, &self.trigger_settings, table, 0)?;
        }
        Ok(())
    }

    fn compensate(
        &self,
        tx: &dyn Executor,
        disabled: &mut BTreeSet<QualifiedTablename>,
        deleted: &HashMap<RowKey, Row>,
        upserted: &[(QualifiedTablename, Row)],
    ) -> SatelliteResult<usize> {
        let mut restored: HashSet<RowKey> = HashSet::new();
        let mut unchecked: Vec<(QualifiedTablename, Row)> = Vec::new();

        for (table, primary_key) in upserted {
            if let Some(row) = select_row(tx, table, primary_key)? {
                unchecked.push((table.clone(), row));
            }
        }

        // deleted rows a child still points at come back
        for (key, row) in deleted {
            if self.is_referenced(tx, &key.0, row)? && restored.insert(key.clone()) {
                self.restore(tx, disabled, &key.0, row)?;
                unchecked.push((key.0.clone(), row.clone()));
            }
        }

        // every written or restored row needs its parents, transitively
        while let Some((table, row)) = unchecked.pop() {
            for fk in self.schema.references_from(&table.tablename) {
                let Some(parent_key) = referenced_key(fk, &row).filter(|k| !k.is_empty()) else {
                    continue;
                };
                let parent = QualifiedTablename::new(table.namespace.clone(), fk.parent_table.clone());
                if select_row(tx, &parent, &parent_key)?.is_some() {
                    continue;
                }

                let key = (parent.clone(), primary_key_to_str(&parent_key));
                if restored.contains(&key) {
                    continue;
                }
                match deleted.get(&key).or_else(|| self.history.get(&key)) {
                    Some(source) => {
                        restored.insert(key);
                        self.restore(tx, disabled, &parent, source)?;
                        unchecked.push((parent, source.clone()));
                    }
                    None => warn!("no known values to restore {} {}", parent, key.1),
                }
            }
        }

        Ok(restored.len())
    }

    fn is_referenced(
        &self,
        tx: &dyn Executor,
        table: &QualifiedTablename,
        row: &Row,
    ) -> SatelliteResult<bool> {
        for fk in self.schema.references_to(&table.tablename) {
            let mut args = Vec::with_capacity(fk.parent_columns.len());
            for column in &fk.parent_columns {
                match row.get(column) {
                    Some(value) if !value.is_null() => args.push(value.clone()),
                    _ => return Ok(false),
                }
            }

            let child = QualifiedTablename::new(table.namespace.clone(), fk.table.clone());
            let found = tx.query(&Statement::with_args(
                format!(
                    "SELECT 1 AS found FROM {} WHERE {} LIMIT 1",
                    child.quoted(),
                    where_clause(fk.columns.iter())
                ),
                args,
            ))?;
            if !found.is_empty() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn restore(
        &self,
        tx: &dyn Executor,
        disabled: &mut BTreeSet<QualifiedTablename>,
        table: &QualifiedTablename,
        row: &Row,
    ) -> SatelliteResult<()> {
        self.disable_triggers(tx, disabled, table)?;

        let columns: Vec<String> = row.keys().map(|c| quote_identifier(c)).collect();
        tx.run(&Statement::with_args(
            format!(
                "INSERT OR IGNORE INTO {} ({}) VALUES ({})",
                table.quoted(),
                columns.join(", "),
                placeholders(columns.len())
            ),
            row.values().cloned().collect(),
        ))?;

        let primary_key: Row = match self.schema.relation(&table.tablename) {
            Some(relation) => relation
                .primary_keys()
                .map(|c| (c.to_string(), row.get(c).cloned().unwrap_or(SqlValue::Null)))
                .collect(),
            None => Row::new(),
        };
        self.oplog
            .insert_compensation(tx, &table.namespace, &table.tablename, &primary_key, row)?;

        debug!("restored {} {}", table, primary_key_to_str(&primary_key));
        Ok(())
    }
}

/// Parent key a row points at through `fk`; `None` when any column is null.
fn referenced_key(fk: &ForeignKey, row: &Row) -> Option<Row> {
    fk.columns
        .iter()
        .zip(&fk.parent_columns)
        .map(|(column, parent_column)| match row.get(column) {
            Some(value) if !value.is_null() => Some((parent_column.clone(), value.clone())),
            _ => None,
        })
        .collect()
}

fn set_trigger_flag(
    tx: &dyn Executor,
    trigger_settings: &str,
    table: &QualifiedTablename,
    flag: i64,
) -> SatelliteResult<()> {
    tx.run(&Statement::with_args(
        format!("UPDATE {trigger_settings} SET flag = ? WHERE tablename = ?"),
        vec![SqlValue::Integer(flag), table.to_string().into()],
    ))?;
    Ok(())
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

fn where_clause<'c>(columns: impl Iterator<Item = &'c String>) -> String {
    columns
        .map(|c| format!("{} = ?", quote_identifier(c)))
        .collect::<Vec<_>>()
        .join(" AND ")
}

fn select_row(
    tx: &dyn Executor,
    table: &QualifiedTablename,
    primary_key: &Row,
) -> SatelliteResult<Option<Row>> {
    if primary_key.is_empty() {
        return Ok(None);
    }
    let rows = tx.query(&Statement::with_args(
        format!(
            "SELECT * FROM {} WHERE {}",
            table.quoted(),
            where_clause(primary_key.keys())
        ),
        primary_key.values().cloned().collect(),
    ))?;
    Ok(rows.into_iter().next())
}

fn delete_statement(table: &QualifiedTablename, primary_key: &Row) -> Statement {
    Statement::with_args(
        format!(
            "DELETE FROM {} WHERE {}",
            table.quoted(),
            where_clause(primary_key.keys())
        ),
        primary_key.values().cloned().collect(),
    )
}

/// Upsert of the merged columns. A change touching only key columns must
/// not overwrite anything and becomes `INSERT OR IGNORE`.
fn upsert_statement(table: &QualifiedTablename, change: &OplogEntryChanges) -> Statement {
    let mut columns = Vec::new();
    let mut args = Vec::new();
    for (column, value) in &change.primary_key_cols {
        columns.push(quote_identifier(column));
        args.push(value.clone());
    }

    let mut updates = Vec::new();
    for (column, column_change) in &change.changes {
        if change.primary_key_cols.contains_key(column) {
            continue;
        }
        let quoted = quote_identifier(column);
        updates.push(format!("{quoted} = excluded.{quoted}"));
        columns.push(quoted);
        args.push(column_change.value.clone());
    }

    let sql = if updates.is_empty() {
        format!(
            "INSERT OR IGNORE INTO {} ({}) VALUES ({})",
            table.quoted(),
            columns.join(", "),
            placeholders(columns.len())
        )
    } else {
        let conflict: Vec<String> = change
            .primary_key_cols
            .keys()
            .map(|c| quote_identifier(c))
            .collect();
        format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) DO UPDATE SET {}",
            table.quoted(),
            columns.join(", "),
            placeholders(columns.len()),
            conflict.join(", "),
            updates.join(", ")
        )
    };
    Statement::with_args(sql, args)
}
