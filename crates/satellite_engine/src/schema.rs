//! Introspection of the replicated tables in the local database.

use crate::adapter::{Executor, Statement};
use crate::config::SatelliteOpts;
use crate::error::SatelliteResult;
use satellite_protocol::{Relation, RelationColumn, RelationsCache, SqlValue, TableType};

/// Schema name announced for local tables.
pub const SERVER_SCHEMA: &str = "public";

/// A foreign key from a child table to a parent table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
    /// Referencing table.
    pub table: String,
    /// Referencing columns.
    pub columns: Vec<String>,
    /// Referenced table.
    pub parent_table: String,
    /// Referenced columns, aligned with `columns`.
    pub parent_columns: Vec<String>,
}

/// Relations and foreign keys of every replicated table.
#[derive(Debug, Clone, Default)]
pub struct LocalSchema {
    /// Relations keyed by table name.
    pub relations: RelationsCache,
    /// Foreign keys between replicated tables.
    pub foreign_keys: Vec<ForeignKey>,
}

impl LocalSchema {
    /// Loads the schema of all user tables, skipping system tables.
    pub fn load<E: Executor + ?Sized>(db: &E, opts: &SatelliteOpts) -> SatelliteResult<Self> {
        let system = opts.system_tables();
        let tables: Vec<String> = db
            .query(&Statement::new(
                "SELECT name FROM sqlite_master WHERE type = 'table' \
                 AND name NOT LIKE 'sqlite_%' ORDER BY name",
            ))?
            .into_iter()
            .filter_map(|mut row| match row.remove("name") {
                Some(SqlValue::Text(name)) => Some(name),
                _ => None,
            })
            .filter(|name| !system.contains(&name.as_str()))
            .collect();

        let mut schema = LocalSchema::default();
        for (index, table) in tables.iter().enumerate() {
            let relation = load_relation(db, table, index as u32 + 1)?;
            schema.relations.insert(table.clone(), relation);
        }

        for table in &tables {
            let keys = load_foreign_keys(db, table)?;
            for mut fk in keys {
                if fk.parent_columns.is_empty() {
                    // REFERENCES parent without columns targets its primary key
                    if let Some(parent) = schema.relations.get(&fk.parent_table) {
                        fk.parent_columns = parent.primary_keys().map(String::from).collect();
                    }
                }
                schema.foreign_keys.push(fk);
            }
        }

        Ok(schema)
    }

    /// Relation of `table`.
    pub fn relation(&self, table: &str) -> Option<&Relation> {
        self.relations.get(table)
    }

    /// Foreign keys declared on `table`.
    pub fn references_from<'a>(&'a self, table: &'a str) -> impl Iterator<Item = &'a ForeignKey> {
        self.foreign_keys.iter().filter(move |fk| fk.table == table)
    }

    /// Foreign keys pointing at `table`.
    pub fn references_to<'a>(&'a self, table: &'a str) -> impl Iterator<Item = &'a ForeignKey> {
        self.foreign_keys
            .iter()
            .filter(move |fk| fk.parent_table == table)
    }
}

fn text(row: &satellite_protocol::Row, column: &str) -> Option<String> {
    match row.get(column) {
        Some(SqlValue::Text(s)) => Some(s.clone()),
        _ => None,
    }
}

fn load_relation<E: Executor + ?Sized>(db: &E, table: &str, id: u32) -> SatelliteResult<Relation> {
    let rows = db.query(&Statement::with_args(
        "SELECT name, type, pk FROM pragma_table_info(?) ORDER BY cid",
        vec![table.into()],
    ))?;

    let columns = rows
        .iter()
        .filter_map(|row| {
            let name = text(row, "name")?;
            let column_type = text(row, "type").unwrap_or_default();
            let primary_key = row.get("pk").and_then(SqlValue::as_i64).unwrap_or(0) > 0;
            Some(RelationColumn::new(name, column_type, primary_key))
        })
        .collect();

    Ok(Relation {
        id,
        schema: SERVER_SCHEMA.into(),
        table: table.to_string(),
        table_type: TableType::Table,
        columns,
    })
}

fn load_foreign_keys<E: Executor + ?Sized>(db: &E, table: &str) -> SatelliteResult<Vec<ForeignKey>> {
    let rows = db.query(&Statement::with_args(
        "SELECT id, \"table\" AS parent, \"from\" AS child_column, \"to\" AS parent_column \
         FROM pragma_foreign_key_list(?) ORDER BY id, seq",
        vec![table.into()],
    ))?;

    let mut keys: Vec<(i64, ForeignKey)> = Vec::new();
    for row in &rows {
        let id = row.get("id").and_then(SqlValue::as_i64).unwrap_or(0);
        let (Some(parent), Some(column)) = (text(row, "parent"), text(row, "child_column")) else {
            continue;
        };
        let parent_column = text(row, "parent_column");

        match keys.last_mut() {
            Some((last_id, fk)) if *last_id == id => {
                fk.columns.push(column);
                fk.parent_columns.extend(parent_column);
            }
            _ => keys.push((
                id,
                ForeignKey {
                    table: table.to_string(),
                    columns: vec![column],
                    parent_table: parent,
                    parent_columns: parent_column.into_iter().collect(),
                },
            )),
        }
    }

    Ok(keys.into_iter().map(|(_, fk)| fk).collect())
}
