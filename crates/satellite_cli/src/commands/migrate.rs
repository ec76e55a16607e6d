//! Migration commands.

use super::CommandResult;
use satellite_engine::{BundleMigrator, Migration, Migrator, SatelliteOpts, SqliteAdapter};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Separates statements inside one migration file.
pub const STATEMENT_BREAKPOINT: &str = "--> statement-breakpoint";

/// Applied and pending migrations of a database.
#[derive(Debug)]
pub struct MigrationStatus {
    /// `(name, sha256)` of applied migrations, oldest first.
    pub applied: Vec<(String, String)>,
    /// Names of bundled migrations not applied yet.
    pub pending: Vec<String>,
}

/// Show applied and pending migrations.
pub fn status(db_path: &Path, dir: Option<&Path>) -> CommandResult<()> {
    info!("Checking migration status for {:?}", db_path);

    let migrator = migrator(db_path, dir)?;
    let status = collect_status(&migrator)?;

    println!("Migration Status");
    println!("================");
    println!("  Applied migrations: {}", status.applied.len());
    for (name, sha) in &status.applied {
        println!("    ✓ {} ({})", name, &sha[..12.min(sha.len())]);
    }
    println!("  Pending migrations: {}", status.pending.len());
    for name in &status.pending {
        println!("    ○ {}", name);
    }

    Ok(())
}

/// Apply pending migrations.
pub fn run(db_path: &Path, dir: Option<&Path>, dry_run: bool) -> CommandResult<()> {
    info!("Running migrations for {:?}", db_path);

    let migrator = migrator(db_path, dir)?;

    if dry_run {
        let status = collect_status(&migrator)?;
        println!(
            "Dry run - would apply {} migration(s):",
            status.pending.len()
        );
        for name in &status.pending {
            println!("  {}", name);
        }
        return Ok(());
    }

    let applied = migrator.up()?;
    if applied == 0 {
        println!("✓ No pending migrations to run.");
    } else {
        println!("✓ Successfully applied {} migration(s)", applied);
    }
    Ok(())
}

fn migrator(db_path: &Path, dir: Option<&Path>) -> CommandResult<BundleMigrator> {
    let migrations = match dir {
        Some(dir) => load_dir(dir)?,
        None => Vec::new(),
    };
    let adapter = Arc::new(SqliteAdapter::open(db_path)?);
    Ok(BundleMigrator::new(
        adapter,
        &SatelliteOpts::default(),
        migrations,
    ))
}

fn collect_status(migrator: &BundleMigrator) -> CommandResult<MigrationStatus> {
    let applied = migrator.applied()?;
    let pending = migrator
        .migrations()
        .get(applied.len()..)
        .unwrap_or_default()
        .iter()
        .map(|m| m.name.clone())
        .collect();
    Ok(MigrationStatus { applied, pending })
}

/// Loads every `.sql` file in `dir` as one migration named after the file,
/// in file name order.
pub fn load_dir(dir: &Path) -> CommandResult<Vec<Migration>> {
    let mut files: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == "sql"))
        .collect();
    files.sort();

    let mut migrations = Vec::with_capacity(files.len());
    for file in files {
        let name = file
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .ok_or_else(|| format!("Invalid migration file name {:?}", file))?;
        let sql = std::fs::read_to_string(&file)?;
        migrations.push(Migration::new(name, split_statements(&sql)));
    }
    Ok(migrations)
}

/// Splits a migration file at [`STATEMENT_BREAKPOINT`] markers.
pub fn split_statements(sql: &str) -> Vec<String> {
    sql.split(STATEMENT_BREAKPOINT)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use satellite_engine::SYSTEM_MIGRATION;
    use std::fs;

    const ITEMS: &str = "CREATE TABLE items (value TEXT PRIMARY KEY);\n\
                         --> statement-breakpoint\n\
                         INSERT OR IGNORE INTO _electric_trigger_settings (tablename, flag) VALUES ('main.items', 1);\n";

    #[test]
    fn statements_split_at_breakpoints() {
        let statements = split_statements(ITEMS);
        assert_eq!(statements.len(), 2);
        assert!(statements[0].starts_with("CREATE TABLE items"));
        assert!(statements[1].ends_with("1);"));
    }

    #[test]
    fn migrations_load_in_file_name_order() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("0002_more.sql"), "SELECT 1").unwrap();
        fs::write(dir.path().join("0001_items.sql"), ITEMS).unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let migrations = load_dir(dir.path()).unwrap();
        let names: Vec<&str> = migrations.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, ["0001_items", "0002_more"]);
    }

    #[test]
    fn run_applies_pending_once() {
        let dir = tempfile::tempdir().unwrap();
        let sql = dir.path().join("sql");
        fs::create_dir(&sql).unwrap();
        fs::write(sql.join("0001_items.sql"), ITEMS).unwrap();
        let db = dir.path().join("app.db");

        let migrator = migrator(&db, Some(&sql)).unwrap();
        let before = collect_status(&migrator).unwrap();
        assert!(before.applied.is_empty());
        assert_eq!(before.pending, [SYSTEM_MIGRATION, "0001_items"]);

        run(&db, Some(&sql), false).unwrap();
        run(&db, Some(&sql), false).unwrap();

        let after = collect_status(&migrator).unwrap();
        assert_eq!(after.applied.len(), 2);
        assert!(after.pending.is_empty());
    }

    #[test]
    fn dry_run_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("app.db");

        run(&db, None, true).unwrap();

        let status = collect_status(&migrator(&db, None).unwrap()).unwrap();
        assert!(status.applied.is_empty());
        assert_eq!(status.pending, [SYSTEM_MIGRATION]);
    }
}
