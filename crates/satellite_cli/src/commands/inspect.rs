//! Inspect command implementation.

use super::{open_existing, CommandResult};
use satellite_engine::{
    BundleMigrator, Executor, LocalSchema, MetaKey, MetaState, OplogTable, SatelliteOpts,
    Statement, SYSTEM_MIGRATION,
};
use satellite_protocol::{quote_identifier, SqlValue};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

/// Database inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Database path.
    pub path: String,
    /// File size in bytes.
    pub size: u64,
    /// Applied migration names, oldest first.
    pub migrations: Vec<String>,
    /// Meta table contents, rendered for display.
    pub meta: BTreeMap<String, String>,
    /// Oplog statistics.
    pub oplog: OplogStats,
    /// Replicated tables (if requested).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tables: Option<Vec<TableInfo>>,
}

/// Oplog statistics.
#[derive(Debug, Serialize)]
pub struct OplogStats {
    /// Entries in the oplog.
    pub total: u64,
    /// Entries no snapshot has stamped yet.
    pub pending: u64,
}

/// A replicated table.
#[derive(Debug, Serialize)]
pub struct TableInfo {
    /// Table name.
    pub name: String,
    /// `(column, declared type)` in declaration order.
    pub columns: Vec<(String, String)>,
    /// Primary-key columns.
    pub primary_key: Vec<String>,
    /// Tables this one references.
    pub references: Vec<String>,
}

/// Runs the inspect command.
pub fn run(path: &Path, show_schema: bool, format: &str) -> CommandResult<()> {
    let result = collect(path, show_schema)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    Ok(())
}

/// Gathers the inspection result for the database at `path`.
pub fn collect(path: &Path, show_schema: bool) -> CommandResult<InspectResult> {
    let adapter = open_existing(path)?;
    let opts = SatelliteOpts::default();

    let migrator = BundleMigrator::new(adapter.clone(), &opts, Vec::new());
    let migrations: Vec<String> = migrator
        .applied()?
        .into_iter()
        .map(|(name, _)| name)
        .collect();
    if !migrations.iter().any(|name| name == SYSTEM_MIGRATION) {
        return Err(format!(
            "{:?} has no Satellite system tables; run `satellite migrate` first",
            path
        )
        .into());
    }

    let db = adapter.as_ref();
    let state = MetaState::new(&opts.meta_table);
    let mut meta = BTreeMap::new();
    for key in MetaKey::all() {
        let value = state.get(db, key)?;
        meta.insert(key.to_string(), render_meta(key, value.as_ref()));
    }

    let oplog = OplogStats {
        total: OplogTable::new(&opts.oplog_table).count(db)?,
        pending: count_pending(db, &opts.oplog_table)?,
    };

    let tables = if show_schema {
        Some(table_infos(&LocalSchema::load(db, &opts)?))
    } else {
        None
    };

    Ok(InspectResult {
        path: path.display().to_string(),
        size: std::fs::metadata(path)?.len(),
        migrations,
        meta,
        oplog,
        tables,
    })
}

fn count_pending<E: Executor + ?Sized>(db: &E, oplog_table: &str) -> CommandResult<u64> {
    let rows = db.query(&Statement::new(format!(
        "SELECT COUNT(*) AS count FROM {} WHERE timestamp IS NULL",
        quote_identifier(oplog_table)
    )))?;
    Ok(rows
        .first()
        .and_then(|row| row.get("count"))
        .and_then(SqlValue::as_i64)
        .unwrap_or(0) as u64)
}

fn table_infos(schema: &LocalSchema) -> Vec<TableInfo> {
    let mut tables: Vec<TableInfo> = schema
        .relations
        .values()
        .map(|relation| {
            let mut references: Vec<String> = schema
                .references_from(&relation.table)
                .map(|fk| fk.parent_table.clone())
                .collect();
            references.dedup();
            TableInfo {
                name: relation.table.clone(),
                columns: relation
                    .columns
                    .iter()
                    .map(|c| (c.name.clone(), c.column_type.clone()))
                    .collect(),
                primary_key: relation.primary_keys().map(String::from).collect(),
                references,
            }
        })
        .collect();
    tables.sort_by(|a, b| a.name.cmp(&b.name));
    tables
}

fn render_meta(key: MetaKey, value: Option<&SqlValue>) -> String {
    match (key, value) {
        (_, None) => "(missing)".into(),
        (MetaKey::Token | MetaKey::RefreshToken, Some(SqlValue::Text(t))) if !t.is_empty() => {
            "(set)".into()
        }
        (_, Some(SqlValue::Null)) => "NULL".into(),
        (_, Some(SqlValue::Integer(i))) => i.to_string(),
        (_, Some(SqlValue::Real(f))) => f.to_string(),
        (_, Some(SqlValue::Text(t))) => t.clone(),
        (_, Some(SqlValue::Blob(b))) if b.is_empty() => "(empty)".into(),
        (_, Some(SqlValue::Blob(b))) => format!("0x{}", hex_encode(b)),
    }
}

fn print_text_output(result: &InspectResult) {
    println!("Satellite Database Inspection");
    println!("=============================");
    println!();
    println!("Path: {}", result.path);
    println!("Size: {}", format_size(result.size));
    println!();
    println!("Migrations ({}):", result.migrations.len());
    for name in &result.migrations {
        println!("  {}", name);
    }
    println!();
    println!("Replication state:");
    for (key, value) in &result.meta {
        println!("  {:14} {}", key, value);
    }
    println!();
    println!("Oplog:");
    println!("  Entries: {}", result.oplog.total);
    println!("  Pending: {}", result.oplog.pending);

    if let Some(tables) = &result.tables {
        println!();
        println!("Tables:");
        for table in tables {
            let columns: Vec<String> = table
                .columns
                .iter()
                .map(|(name, ty)| format!("{} {}", name, ty))
                .collect();
            println!("  {} ({})", table.name, columns.join(", "));
            println!("      primary key: {}", table.primary_key.join(", "));
            if !table.references.is_empty() {
                println!("      references: {}", table.references.join(", "));
            }
        }
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} bytes", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use satellite_engine::{Migration, Migrator, SqliteAdapter};
    use std::sync::Arc;

    fn migrated(path: &Path) -> Arc<SqliteAdapter> {
        let adapter = Arc::new(SqliteAdapter::open(path).unwrap());
        let migrations = vec![Migration::new(
            "0001_tables",
            [
                "CREATE TABLE parent (id INTEGER PRIMARY KEY, value TEXT)",
                "CREATE TABLE child (id INTEGER PRIMARY KEY, parent INTEGER REFERENCES parent (id))",
            ],
        )];
        BundleMigrator::new(adapter.clone(), &SatelliteOpts::default(), migrations)
            .up()
            .unwrap();
        adapter
    }

    #[test]
    fn reports_cursors_and_oplog() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.db");
        let adapter = migrated(&path);
        adapter
            .run(&Statement::new(
                "INSERT INTO _electric_oplog (namespace, tablename, optype, primaryKey, newRow, timestamp) \
                 VALUES ('main', 'parent', 'INSERT', '{\"id\":1}', '{\"id\":1}', NULL), \
                        ('main', 'parent', 'UPDATE', '{\"id\":1}', '{\"id\":1}', '2024-01-01T00:00:00.000Z')",
            ))
            .unwrap();

        let result = collect(&path, false).unwrap();

        assert_eq!(result.migrations, [SYSTEM_MIGRATION, "0001_tables"]);
        assert_eq!(result.meta["lastAckdRowId"], "0");
        assert_eq!(result.meta["lsn"], "(empty)");
        assert_eq!(result.oplog.total, 2);
        assert_eq!(result.oplog.pending, 1);
        assert!(result.tables.is_none());
    }

    #[test]
    fn schema_lists_tables_and_references() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.db");
        migrated(&path);

        let tables = collect(&path, true).unwrap().tables.unwrap();

        let names: Vec<&str> = tables.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["child", "parent"]);
        assert_eq!(tables[0].references, ["parent"]);
        assert_eq!(tables[1].primary_key, ["id"]);
    }

    #[test]
    fn token_is_not_printed() {
        assert_eq!(
            render_meta(MetaKey::Token, Some(&SqlValue::from("secret"))),
            "(set)"
        );
        assert_eq!(
            render_meta(MetaKey::Lsn, Some(&SqlValue::Blob(vec![0, 1]))),
            "0x0001"
        );
    }

    #[test]
    fn missing_or_unmigrated_database_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(collect(&dir.path().join("missing.db"), false).is_err());

        let path = dir.path().join("plain.db");
        SqliteAdapter::open(&path).unwrap();
        assert!(collect(&path, false).is_err());
    }
}
