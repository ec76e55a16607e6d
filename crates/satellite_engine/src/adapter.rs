//! Database adapter seam.
//!
//! The process never talks to a driver directly. It runs [`Statement`]s
//! through a [`DatabaseAdapter`], and everything that must happen atomically
//! runs inside [`DatabaseAdapter::transaction`] against the [`Executor`] it
//! hands out.

use crate::error::{AdapterResult, SatelliteResult};
use crate::notifier::Notifier;
use satellite_protocol::{Row, SqlValue};
use std::sync::Arc;

/// A SQL statement with positional arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    /// SQL text with `?` placeholders.
    pub sql: String,
    /// Bound arguments in placeholder order.
    pub args: Vec<SqlValue>,
}

impl Statement {
    /// Creates a statement without arguments.
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            args: Vec::new(),
        }
    }

    /// Creates a statement with arguments.
    pub fn with_args(sql: impl Into<String>, args: Vec<SqlValue>) -> Self {
        Self {
            sql: sql.into(),
            args,
        }
    }
}

impl From<&str> for Statement {
    fn from(sql: &str) -> Self {
        Self::new(sql)
    }
}

/// Runs statements against a connection or an open transaction.
pub trait Executor {
    /// Runs a statement, returning the number of rows it changed.
    fn run(&self, statement: &Statement) -> AdapterResult<usize>;

    /// Runs a query, returning every row keyed by column name.
    fn query(&self, statement: &Statement) -> AdapterResult<Vec<Row>>;
}

/// A database the replication process can drive.
///
/// Adapters are synchronous. Code running inside [`transaction`] must use the
/// executor it receives, never the adapter itself.
///
/// [`transaction`]: DatabaseAdapter::transaction
pub trait DatabaseAdapter: Executor + Send + Sync {
    /// Runs `f` inside one transaction. The transaction commits when `f`
    /// returns `Ok` and rolls back otherwise.
    fn transaction(
        &self,
        f: &mut dyn FnMut(&dyn Executor) -> SatelliteResult<()>,
    ) -> SatelliteResult<()>;

    /// Runs all statements in one transaction, returning total rows changed.
    fn run_in_transaction(&self, statements: &[Statement]) -> SatelliteResult<usize> {
        let mut changed = 0;
        self.transaction(&mut |tx| {
            changed = 0;
            for statement in statements {
                changed += tx.run(statement)?;
            }
            Ok(())
        })?;
        Ok(changed)
    }
}

impl<A: DatabaseAdapter + ?Sized> Executor for Arc<A> {
    fn run(&self, statement: &Statement) -> AdapterResult<usize> {
        (**self).run(statement)
    }

    fn query(&self, statement: &Statement) -> AdapterResult<Vec<Row>> {
        (**self).query(statement)
    }
}

impl<A: DatabaseAdapter + ?Sized> DatabaseAdapter for Arc<A> {
    fn transaction(
        &self,
        f: &mut dyn FnMut(&dyn Executor) -> SatelliteResult<()>,
    ) -> SatelliteResult<()> {
        (**self).transaction(f)
    }
}

/// Adapter decorator that reports every write as a potential data change.
///
/// Applications write through this wrapper so the replication process
/// snapshots soon after each write.
pub struct NotifyingAdapter<A> {
    inner: A,
    notifier: Arc<dyn Notifier>,
}

impl<A: DatabaseAdapter> NotifyingAdapter<A> {
    /// Wraps `inner`, reporting writes to `notifier`.
    pub fn new(inner: A, notifier: Arc<dyn Notifier>) -> Self {
        Self { inner, notifier }
    }

    /// The wrapped adapter.
    pub fn inner(&self) -> &A {
        &self.inner
    }
}

impl<A: DatabaseAdapter> Executor for NotifyingAdapter<A> {
    fn run(&self, statement: &Statement) -> AdapterResult<usize> {
        let changed = self.inner.run(statement)?;
        self.notifier.potentially_changed();
        Ok(changed)
    }

    fn query(&self, statement: &Statement) -> AdapterResult<Vec<Row>> {
        self.inner.query(statement)
    }
}

impl<A: DatabaseAdapter> DatabaseAdapter for NotifyingAdapter<A> {
    fn transaction(
        &self,
        f: &mut dyn FnMut(&dyn Executor) -> SatelliteResult<()>,
    ) -> SatelliteResult<()> {
        self.inner.transaction(f)?;
        self.notifier.potentially_changed();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::EventNotifier;
    use crate::sqlite::SqliteAdapter;

    #[tokio::test]
    async fn writes_report_potential_changes() {
        let notifier = Arc::new(EventNotifier::new("test.db"));
        let mut changes = notifier.subscribe_to_potential_data_changes();
        let adapter = NotifyingAdapter::new(
            SqliteAdapter::open_in_memory().unwrap(),
            notifier.clone(),
        );

        adapter.run(&"CREATE TABLE t (id INTEGER PRIMARY KEY)".into()).unwrap();
        changes.recv().await.unwrap();

        adapter
            .run_in_transaction(&["INSERT INTO t VALUES (1)".into(), "INSERT INTO t VALUES (2)".into()])
            .unwrap();
        changes.recv().await.unwrap();

        adapter.query(&"SELECT * FROM t".into()).unwrap();
        assert!(changes.try_recv().is_err());
    }
}
