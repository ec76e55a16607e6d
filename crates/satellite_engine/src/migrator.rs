//! Schema migrations.
//!
//! Migrations are bundled with the application and applied in order. Each
//! applied migration is recorded with the SHA-256 of its statements; a
//! recorded migration whose bundled definition changed stops the process.

use crate::adapter::{DatabaseAdapter, Statement};
use crate::config::SatelliteOpts;
use crate::error::{SatelliteError, SatelliteResult};
use crate::meta::MetaKey;
use chrono::Utc;
use satellite_protocol::oplog::format_timestamp;
use satellite_protocol::{quote_identifier, SqlValue};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info};

/// Name of the migration creating the system tables.
pub const SYSTEM_MIGRATION: &str = "0000_satellite_system_tables";

/// Applies pending migrations.
pub trait Migrator: Send + Sync {
    /// Applies every pending migration, returning how many were applied.
    fn up(&self) -> SatelliteResult<usize>;
}

/// One named migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    /// Unique name; migrations apply in bundle order.
    pub name: String,
    /// SQL statements.
    pub statements: Vec<String>,
}

impl Migration {
    /// Creates a migration.
    pub fn new<S: Into<String>>(name: impl Into<String>, statements: impl IntoIterator<Item = S>) -> Self {
        Self {
            name: name.into(),
            statements: statements.into_iter().map(Into::into).collect(),
        }
    }

    /// Hex SHA-256 over the statements, each followed by a newline.
    pub fn sha256(&self) -> String {
        let mut hasher = Sha256::new();
        for statement in &self.statements {
            hasher.update(statement.as_bytes());
            hasher.update(b"\n");
        }
        hasher
            .finalize()
            .iter()
            .map(|byte| format!("{byte:02x}"))
            .collect()
    }
}

/// Migration creating the oplog, meta, migrations and trigger settings
/// tables, seeding the meta keys.
pub fn system_migration(opts: &SatelliteOpts) -> Migration {
    let oplog = quote_identifier(&opts.oplog_table);
    let meta = quote_identifier(&opts.meta_table);
    let migrations = quote_identifier(&opts.migrations_table);
    let triggers = quote_identifier(&opts.trigger_settings_table);

    let mut statements = vec![
        format!(
            "CREATE TABLE IF NOT EXISTS {oplog} (\n  \
             rowid INTEGER PRIMARY KEY AUTOINCREMENT,\n  \
             namespace TEXT NOT NULL,\n  \
             tablename TEXT NOT NULL,\n  \
             optype TEXT NOT NULL,\n  \
             primaryKey TEXT NOT NULL,\n  \
             newRow TEXT,\n  \
             oldRow TEXT,\n  \
             timestamp TEXT\n)"
        ),
        format!("CREATE TABLE IF NOT EXISTS {meta} (key TEXT PRIMARY KEY, value BLOB)"),
        format!(
            "CREATE TABLE IF NOT EXISTS {migrations} (\n  \
             id INTEGER PRIMARY KEY AUTOINCREMENT,\n  \
             name TEXT NOT NULL UNIQUE,\n  \
             sha256 TEXT NOT NULL,\n  \
             applied_at TEXT NOT NULL\n)"
        ),
        format!("CREATE TABLE IF NOT EXISTS {triggers} (tablename TEXT PRIMARY KEY, flag INTEGER)"),
    ];

    for key in MetaKey::all() {
        let value = match key {
            MetaKey::Compensations => "0",
            MetaKey::LastAckdRowId | MetaKey::LastSentRowId => "'0'",
            MetaKey::Lsn => "x''",
            MetaKey::ClientId | MetaKey::Token | MetaKey::RefreshToken => "''",
        };
        statements.push(format!(
            "INSERT OR IGNORE INTO {meta} (key, value) VALUES ('{}', {value})",
            key.as_str()
        ));
    }

    Migration::new(SYSTEM_MIGRATION, statements)
}

/// A [`Migrator`] applying a fixed bundle of migrations after the system
/// migration.
pub struct BundleMigrator {
    adapter: Arc<dyn DatabaseAdapter>,
    migrations: Vec<Migration>,
    table: String,
}

impl BundleMigrator {
    /// Creates a migrator for `migrations`.
    pub fn new(
        adapter: Arc<dyn DatabaseAdapter>,
        opts: &SatelliteOpts,
        migrations: Vec<Migration>,
    ) -> Self {
        let mut bundle = vec![system_migration(opts)];
        bundle.extend(migrations);
        Self {
            adapter,
            migrations: bundle,
            table: quote_identifier(&opts.migrations_table),
        }
    }

    /// Every migration in the bundle, system migration first.
    pub fn migrations(&self) -> &[Migration] {
        &self.migrations
    }

    /// `(name, sha256)` of applied migrations, oldest first.
    pub fn applied(&self) -> SatelliteResult<Vec<(String, String)>> {
        let exists = self.adapter.query(&Statement::with_args(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?",
            vec![unquote(&self.table).into()],
        ))?;
        if exists.is_empty() {
            return Ok(Vec::new());
        }

        let rows = self.adapter.query(&Statement::new(format!(
            "SELECT name, sha256 FROM {} ORDER BY id ASC",
            self.table
        )))?;
        Ok(rows
            .into_iter()
            .filter_map(|mut row| match (row.remove("name"), row.remove("sha256")) {
                (Some(SqlValue::Text(name)), Some(SqlValue::Text(sha))) => Some((name, sha)),
                _ => None,
            })
            .collect())
    }

    fn validate(&self, applied: &[(String, String)]) -> SatelliteResult<()> {
        for (index, (name, sha)) in applied.iter().enumerate() {
            let Some(bundled) = self.migrations.get(index) else {
                return Err(SatelliteError::MigrationMismatch {
                    name: name.clone(),
                    reason: "applied migration is missing from the bundle".into(),
                });
            };
            if &bundled.name != name {
                return Err(SatelliteError::MigrationMismatch {
                    name: name.clone(),
                    reason: format!("bundle has {} at this position", bundled.name),
                });
            }
            if &bundled.sha256() != sha {
                return Err(SatelliteError::MigrationMismatch {
                    name: name.clone(),
                    reason: "statements changed since it was applied".into(),
                });
            }
        }
        Ok(())
    }
}

fn unquote(identifier: &str) -> String {
    identifier.trim_matches('"').replace("\"\"", "\"")
}

impl Migrator for BundleMigrator {
    fn up(&self) -> SatelliteResult<usize> {
        let applied = self.applied()?;
        self.validate(&applied)?;

        let pending = &self.migrations[applied.len()..];
        for migration in pending {
            info!("Applying migration {}", migration.name);
            let record = Statement::with_args(
                format!(
                    "INSERT INTO {} (name, sha256, applied_at) VALUES (?, ?, ?)",
                    self.table
                ),
                vec![
                    migration.name.clone().into(),
                    migration.sha256().into(),
                    format_timestamp(&Utc::now()).into(),
                ],
            );
            self.adapter.transaction(&mut |tx| {
                for sql in &migration.statements {
                    tx.run(&Statement::new(sql.as_str()))?;
                }
                tx.run(&record)?;
                Ok(())
            })?;
        }

        debug!("{} migrations applied, {} pending", applied.len(), pending.len());
        Ok(pending.len())
    }
}
