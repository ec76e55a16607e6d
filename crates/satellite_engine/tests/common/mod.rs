//! Shared fixture: a SQLite database with replicated `parent`, `child` and
//! `items` tables whose triggers capture writes into the oplog.

#![allow(dead_code)]

use chrono::{DateTime, Utc};
use satellite_engine::{
    BundleMigrator, Client, EventNotifier, Executor, MetaKey, MetaState, Migration,
    MockClient, OplogTable, SatelliteOpts, SatelliteProcess, SqliteAdapter, Statement,
    DEFAULT_META_TABLE, DEFAULT_OPLOG_TABLE,
};
use satellite_protocol::{row, OpType, OplogEntry, Row, SqlValue};
use std::path::Path;
use std::sync::Arc;

pub const DB_NAME: &str = "fixture.db";

/// `(table, primary key columns, all columns)`
const TABLES: [(&str, &[&str], &[&str]); 3] = [
    ("parent", &["id"], &["id", "value", "otherValue"]),
    ("child", &["id"], &["id", "parent"]),
    ("items", &["value"], &["value"]),
];

fn json_object(prefix: &str, columns: &[&str]) -> String {
    let pairs: Vec<String> = columns
        .iter()
        .map(|c| format!("'{c}', {prefix}.{c}"))
        .collect();
    format!("json_object({})", pairs.join(", "))
}

fn capture_triggers(table: &str, pk: &[&str], columns: &[&str]) -> Vec<String> {
    let when = format!(
        "WHEN 1 == (SELECT flag FROM _electric_trigger_settings WHERE tablename == 'main.{table}')"
    );
    let insert = |op: &str, key: &str, new_row: String, old_row: String| {
        format!(
            "CREATE TRIGGER IF NOT EXISTS {op_lower}_main_{table}_into_oplog\n\
             AFTER {op} ON main.{table}\n\
             {when}\n\
             BEGIN\n  \
             INSERT INTO _electric_oplog (namespace, tablename, optype, primaryKey, newRow, oldRow, timestamp)\n  \
             VALUES ('main', '{table}', '{op}', {key}, {new_row}, {old_row}, NULL);\n\
             END",
            op_lower = op.to_lowercase(),
        )
    };

    vec![
        insert(
            "INSERT",
            &json_object("new", pk),
            json_object("new", columns),
            "NULL".into(),
        ),
        insert(
            "UPDATE",
            &json_object("new", pk),
            json_object("new", columns),
            json_object("old", columns),
        ),
        insert(
            "DELETE",
            &json_object("old", pk),
            "NULL".into(),
            json_object("old", columns),
        ),
    ]
}

/// Migration creating the replicated tables and their capture triggers.
pub fn tables_migration() -> Migration {
    let mut statements = vec![
        "CREATE TABLE IF NOT EXISTS main.parent (id INTEGER PRIMARY KEY, value TEXT, otherValue INTEGER DEFAULT 0)".to_string(),
        "CREATE TABLE IF NOT EXISTS main.child (id INTEGER PRIMARY KEY, parent INTEGER NOT NULL, FOREIGN KEY (parent) REFERENCES parent (id))".to_string(),
        "CREATE TABLE IF NOT EXISTS main.items (value TEXT PRIMARY KEY NOT NULL)".to_string(),
        "INSERT OR IGNORE INTO _electric_trigger_settings (tablename, flag) VALUES ('main.child', 1), ('main.items', 1), ('main.parent', 1)".to_string(),
    ];
    for (table, pk, columns) in TABLES {
        statements.extend(capture_triggers(table, pk, columns));
    }
    Migration::new("0001_fixture_tables", statements)
}

/// A process over an in-memory database with a scripted client.
pub struct Fixture {
    pub adapter: Arc<SqliteAdapter>,
    pub notifier: Arc<EventNotifier>,
    pub client: Arc<MockClient>,
    pub process: SatelliteProcess,
}

impl Fixture {
    /// Builds the fixture without initializing the process.
    pub fn new(opts: SatelliteOpts) -> Self {
        Self::with_adapter(SqliteAdapter::open_in_memory().unwrap(), opts)
    }

    /// Builds the fixture over the database file at `path`.
    pub fn open(path: &Path, opts: SatelliteOpts) -> Self {
        Self::with_adapter(SqliteAdapter::open(path).unwrap(), opts)
    }

    fn with_adapter(adapter: SqliteAdapter, opts: SatelliteOpts) -> Self {
        let adapter = Arc::new(adapter);
        let notifier = Arc::new(EventNotifier::new(DB_NAME));
        let client = Arc::new(MockClient::new());
        let migrator = Arc::new(BundleMigrator::new(
            adapter.clone(),
            &opts,
            vec![tables_migration()],
        ));
        let process = SatelliteProcess::new(
            DB_NAME,
            adapter.clone(),
            migrator,
            notifier.clone(),
            client.clone(),
            opts,
        );
        Self {
            adapter,
            notifier,
            client,
            process,
        }
    }

    /// Builds and initializes the fixture.
    pub async fn initialized() -> Self {
        let fixture = Self::new(SatelliteOpts::default());
        fixture.process.initialize().await.unwrap();
        fixture
    }

    pub fn exec(&self, sql: &str) {
        self.adapter.run(&Statement::new(sql)).unwrap();
    }

    pub fn rows(&self, sql: &str) -> Vec<Row> {
        self.adapter.query(&Statement::new(sql)).unwrap()
    }

    pub fn oplog(&self) -> Vec<OplogEntry> {
        OplogTable::new(DEFAULT_OPLOG_TABLE)
            .entries_page(self.adapter.as_ref(), 1000, 0)
            .unwrap()
    }

    pub fn meta(&self, key: MetaKey) -> Option<SqlValue> {
        MetaState::new(DEFAULT_META_TABLE)
            .get(self.adapter.as_ref(), key)
            .unwrap()
    }

    /// Sends and acknowledges every pending local change so it no longer
    /// takes part in merges.
    pub async fn settle(&self) {
        let was_active = self.client.is_outbound_active();
        self.client.set_outbound_active(true);
        self.process.perform_snapshot().await.unwrap();
        let sent = self.process.positions().await.last_sent_row_id;
        self.process.ack(sent).await.unwrap();
        self.client.set_outbound_active(was_active);
    }
}

/// A remote oplog entry for `main.<table>`.
pub fn remote(
    table: &str,
    optype: OpType,
    timestamp: DateTime<Utc>,
    primary_key: Row,
    new_row: Option<Row>,
    old_row: Option<Row>,
) -> OplogEntry {
    OplogEntry {
        namespace: "main".into(),
        tablename: table.into(),
        primary_key,
        rowid: -1,
        optype,
        timestamp: Some(timestamp),
        new_row,
        old_row,
    }
}

/// `parent` row with every column set.
pub fn parent_row(id: i64, value: &str, other_value: i64) -> Row {
    row([
        ("id", SqlValue::Integer(id)),
        ("value", SqlValue::from(value)),
        ("otherValue", SqlValue::Integer(other_value)),
    ])
}

pub fn id_key(id: i64) -> Row {
    row([("id", id)])
}
