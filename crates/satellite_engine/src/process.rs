//! The replication process.
//!
//! One [`SatelliteProcess`] runs per local database. It owns the adapter,
//! migrator, notifier and client, and serialises its three units of work
//! (snapshot, acknowledgement and apply) through one async mutex:
//!
//! ```text
//!   local writes ──> oplog ──snapshot──> client ──> server
//!                                  ^                  │
//!   tables <──apply (merge)────────┴──── client <─────┘
//! ```
//!
//! Background tasks started by [`SatelliteProcess::start`] request snapshots
//! on a polling interval and on potential data changes, react to
//! connectivity changes and consume client events. [`SatelliteProcess::stop`]
//! tears them down after in-flight work finishes.

use crate::adapter::{DatabaseAdapter, Executor, Statement};
use crate::applier::{Applier, RowKey};
use crate::config::{AuthConfig, SatelliteOpts};
use crate::error::{SatelliteError, SatelliteResult};
use crate::meta::{MetaKey, MetaState};
use crate::migrator::Migrator;
use crate::notifier::{Change, ConnectivityState, ConnectivityStateChange, Notifier};
use crate::oplog_table::OplogTable;
use crate::schema::LocalSchema;
use crate::throttle::Throttle;
use crate::transport::{AuthState, Client, ClientEvent};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use satellite_protocol::{
    from_transaction, last_known_rows, lsn_to_rowid, merge_entries, to_transactions, Lsn,
    OplogEntry, QualifiedTablename, RelationsCache, Row, SqlValue, Transaction,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Lifecycle of a replication process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Not running.
    Stopped,
    /// Migrating and loading state.
    Starting,
    /// Background tasks running.
    Started,
}

/// Counters describing what the process has done.
#[derive(Debug, Clone, Default)]
pub struct ProcessStats {
    /// Snapshots taken.
    pub snapshots: u64,
    /// Local transactions handed to the client.
    pub transactions_sent: u64,
    /// Remote transactions applied.
    pub transactions_applied: u64,
    /// Rows restored to keep foreign keys intact.
    pub compensations: u64,
    /// Acknowledgements that pruned the oplog.
    pub acks: u64,
    /// Last error raised by background work.
    pub last_error: Option<String>,
}

/// Replication positions of the process.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Positions {
    /// Highest oplog row acknowledged by the server.
    pub last_ackd_row_id: u64,
    /// Highest oplog row handed to the client.
    pub last_sent_row_id: u64,
    /// Position of the last applied remote transaction.
    pub lsn: Option<Lsn>,
}

struct Cursors {
    positions: Positions,
    schema: LocalSchema,
}

struct Background {
    shutdown: watch::Sender<bool>,
    throttle: Throttle,
    tasks: Vec<JoinHandle<()>>,
}

struct ProcessInner {
    db_name: String,
    adapter: Arc<dyn DatabaseAdapter>,
    migrator: Arc<dyn Migrator>,
    notifier: Arc<dyn Notifier>,
    client: Arc<dyn Client>,
    opts: SatelliteOpts,
    meta: MetaState,
    oplog: OplogTable,
    state: RwLock<ProcessState>,
    stats: RwLock<ProcessStats>,
    auth: RwLock<Option<AuthState>>,
    work: tokio::sync::Mutex<Cursors>,
    background: Mutex<Option<Background>>,
}

/// Replication process of one local database.
///
/// Cloning is cheap; clones share the same process.
#[derive(Clone)]
pub struct SatelliteProcess {
    inner: Arc<ProcessInner>,
}

impl SatelliteProcess {
    /// Creates a stopped process.
    pub fn new(
        db_name: impl Into<String>,
        adapter: Arc<dyn DatabaseAdapter>,
        migrator: Arc<dyn Migrator>,
        notifier: Arc<dyn Notifier>,
        client: Arc<dyn Client>,
        opts: SatelliteOpts,
    ) -> Self {
        let meta = MetaState::new(&opts.meta_table);
        let oplog = OplogTable::new(&opts.oplog_table);
        Self {
            inner: Arc::new(ProcessInner {
                db_name: db_name.into(),
                adapter,
                migrator,
                notifier,
                client,
                opts,
                meta,
                oplog,
                state: RwLock::new(ProcessState::Stopped),
                stats: RwLock::new(ProcessStats::default()),
                auth: RwLock::new(None),
                work: tokio::sync::Mutex::new(Cursors {
                    positions: Positions::default(),
                    schema: LocalSchema::default(),
                }),
                background: Mutex::new(None),
            }),
        }
    }

    fn from_weak(weak: &Weak<ProcessInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    /// Name of the database this process replicates.
    pub fn db_name(&self) -> &str {
        &self.inner.db_name
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ProcessState {
        *self.inner.state.read()
    }

    /// Counters so far.
    pub fn stats(&self) -> ProcessStats {
        self.inner.stats.read().clone()
    }

    /// The replication client.
    pub fn client(&self) -> &Arc<dyn Client> {
        &self.inner.client
    }

    /// Current replication positions.
    pub async fn positions(&self) -> Positions {
        self.inner.work.lock().await.positions.clone()
    }

    /// Relations of the replicated tables.
    pub async fn relations(&self) -> RelationsCache {
        self.inner.work.lock().await.schema.relations.clone()
    }

    /// Turns foreign key compensation on or off.
    pub fn set_compensations(&self, enabled: bool) -> SatelliteResult<()> {
        self.inner.meta.set(
            self.inner.adapter.as_ref(),
            MetaKey::Compensations,
            SqlValue::Integer(i64::from(enabled)),
        )
    }

    /// Migrates the database and loads schema and cursors.
    ///
    /// Called by [`start`](Self::start); callable alone to drive snapshot,
    /// ack and apply without background tasks.
    pub async fn initialize(&self) -> SatelliteResult<()> {
        let applied = self.inner.migrator.up()?;
        debug!(db = %self.inner.db_name, "{applied} migrations applied");
        self.verify_tables()?;

        let db = self.inner.adapter.as_ref();
        let meta = &self.inner.meta;
        let schema = LocalSchema::load(db, &self.inner.opts)?;

        let mut cursors = self.inner.work.lock().await;
        cursors.positions = Positions {
            last_ackd_row_id: meta.get_row_id(db, MetaKey::LastAckdRowId)?,
            last_sent_row_id: meta.get_row_id(db, MetaKey::LastSentRowId)?,
            lsn: meta.get_lsn(db)?,
        };
        cursors.schema = schema;
        Ok(())
    }

    fn verify_tables(&self) -> SatelliteResult<()> {
        let opts = &self.inner.opts;
        for table in [&opts.meta_table, &opts.oplog_table, &opts.trigger_settings_table] {
            let found = self.inner.adapter.query(&Statement::with_args(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?",
                vec![table.as_str().into()],
            ))?;
            if found.is_empty() {
                return Err(SatelliteError::InvalidSchema(format!(
                    "missing system table {table}"
                )));
            }
        }
        Ok(())
    }

    fn ensure_client_id(&self) -> SatelliteResult<String> {
        let db = self.inner.adapter.as_ref();
        if let Some(id) = self.inner.meta.get_text(db, MetaKey::ClientId)? {
            return Ok(id);
        }
        let id = Uuid::new_v4().to_string();
        self.inner
            .meta
            .set(db, MetaKey::ClientId, SqlValue::Text(id.clone()))?;
        info!(db = %self.inner.db_name, "generated client id {id}");
        Ok(id)
    }

    /// Starts the process: migrates, spawns background work, then connects
    /// and starts replication.
    ///
    /// Connection failures do not fail the start; the process keeps running
    /// locally and reconnects when connectivity becomes available.
    pub async fn start(&self, auth: AuthConfig) -> SatelliteResult<()> {
        {
            let mut state = self.inner.state.write();
            if *state != ProcessState::Stopped {
                return Err(SatelliteError::UnexpectedState(format!(
                    "start while {:?}",
                    *state
                )));
            }
            *state = ProcessState::Starting;
        }

        if let Err(err) = self.prepare(auth).await {
            self.shutdown_background().await;
            *self.inner.state.write() = ProcessState::Stopped;
            return Err(err);
        }
        *self.inner.state.write() = ProcessState::Started;
        info!(db = %self.inner.db_name, "replication process started");

        if let Err(err) = self.connect_and_start().await {
            warn!(db = %self.inner.db_name, error = %err, "could not start replication");
            self.record_error(&err);
            self.inner
                .notifier
                .connectivity_state_change(&self.inner.db_name, ConnectivityState::Error);
        }
        Ok(())
    }

    async fn prepare(&self, auth: AuthConfig) -> SatelliteResult<()> {
        self.initialize().await?;

        let client_id = self.ensure_client_id()?;
        let db = self.inner.adapter.as_ref();
        let token = match auth.token {
            Some(token) => {
                self.inner
                    .meta
                    .set(db, MetaKey::Token, SqlValue::Text(token.clone()))?;
                Some(token)
            }
            None => self.inner.meta.get_text(db, MetaKey::Token)?,
        };
        *self.inner.auth.write() = Some(AuthState {
            app: auth.app,
            env: auth.env,
            client_id,
            token,
        });

        self.spawn_background();
        Ok(())
    }

    fn spawn_background(&self) {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let weak = Arc::downgrade(&self.inner);

        let snapshot_target = weak.clone();
        let (throttle, throttle_task) = Throttle::spawn(
            self.inner.opts.min_snapshot_window,
            shutdown_rx.clone(),
            move || {
                let target = snapshot_target.clone();
                async move {
                    if let Some(process) = SatelliteProcess::from_weak(&target) {
                        if let Err(err) = process.perform_snapshot().await {
                            warn!(db = %process.inner.db_name, error = %err, "snapshot failed");
                            process.record_error(&err);
                        }
                    }
                }
            },
        );

        let tasks = vec![
            throttle_task,
            tokio::spawn(poll(
                self.inner.opts.polling_interval,
                throttle.clone(),
                shutdown_rx.clone(),
            )),
            tokio::spawn(watch_potential_changes(
                self.inner.notifier.subscribe_to_potential_data_changes(),
                throttle.clone(),
                shutdown_rx.clone(),
            )),
            tokio::spawn(watch_connectivity(
                weak.clone(),
                self.inner.notifier.subscribe_to_connectivity_state_changes(),
                shutdown_rx.clone(),
            )),
            tokio::spawn(consume_client_events(
                weak,
                self.inner.client.subscribe(),
                shutdown_rx,
            )),
        ];

        *self.inner.background.lock() = Some(Background {
            shutdown,
            throttle,
            tasks,
        });
    }

    /// Connects the client if needed, authenticates and starts inbound
    /// replication from the last applied position.
    pub async fn connect_and_start(&self) -> SatelliteResult<()> {
        let auth = self
            .inner
            .auth
            .read()
            .clone()
            .ok_or_else(|| SatelliteError::UnexpectedState("process not started".into()))?;

        let client = &self.inner.client;
        if client.is_closed() {
            client.connect().await?;
        }
        client.authenticate(&auth).await?;

        let lsn = self.inner.work.lock().await.positions.lsn.clone();
        client.start_replication(lsn).await
    }

    /// Stops background work, waiting for in-flight work, and closes the
    /// client.
    pub async fn stop(&self) -> SatelliteResult<()> {
        self.shutdown_background().await;
        let closed = self.inner.client.close().await;
        *self.inner.state.write() = ProcessState::Stopped;
        info!(db = %self.inner.db_name, "replication process stopped");
        closed
    }

    async fn shutdown_background(&self) {
        let background = self.inner.background.lock().take();
        let Some(Background {
            shutdown,
            throttle,
            tasks,
        }) = background
        else {
            return;
        };

        let _ = shutdown.send(true);
        drop(throttle);
        for task in tasks {
            if let Err(err) = task.await {
                if err.is_panic() {
                    error!(db = %self.inner.db_name, "background task panicked");
                }
            }
        }
    }

    /// Asks the throttled snapshot task for a snapshot. Returns false when
    /// the process is not started.
    pub fn request_snapshot(&self) -> bool {
        match self.inner.background.lock().as_ref() {
            Some(background) => {
                background.throttle.request();
                true
            }
            None => false,
        }
    }

    /// Takes a snapshot now, returning the timestamp it stamped.
    ///
    /// Pending oplog entries get the snapshot timestamp, listeners learn
    /// which rows changed, and when the server accepts outbound data every
    /// stamped entry not yet sent is handed to the client.
    pub async fn perform_snapshot(&self) -> SatelliteResult<DateTime<Utc>> {
        let mut cursors = self.inner.work.lock().await;
        self.snapshot_locked(&mut cursors).await
    }

    async fn snapshot_locked(&self, cursors: &mut Cursors) -> SatelliteResult<DateTime<Utc>> {
        let db = self.inner.adapter.as_ref();
        let timestamp = Utc::now();

        let stamped = self
            .inner
            .oplog
            .stamp(db, &timestamp, cursors.positions.last_ackd_row_id)?;
        if stamped > 0 {
            let entries = self.inner.oplog.entries_stamped(db, &timestamp)?;
            self.notify_stamped(&entries);
            debug!(db = %self.inner.db_name, "snapshot stamped {stamped} entries");
        }
        self.inner.stats.write().snapshots += 1;

        if self.inner.client.is_outbound_active() {
            self.send_pending(cursors).await?;
        }
        Ok(timestamp)
    }

    fn notify_stamped(&self, entries: &[OplogEntry]) {
        let mut grouped: BTreeMap<QualifiedTablename, Vec<i64>> = BTreeMap::new();
        for entry in entries {
            grouped
                .entry(entry.qualified_tablename())
                .or_default()
                .push(entry.rowid);
        }
        let changes = grouped
            .into_iter()
            .map(|(qualified_tablename, rowids)| Change {
                qualified_tablename,
                rowids: Some(rowids),
            })
            .collect();
        self.inner
            .notifier
            .actually_changed(&self.inner.db_name, changes);
    }

    async fn send_pending(&self, cursors: &mut Cursors) -> SatelliteResult<()> {
        let db = self.inner.adapter.as_ref();
        let entries = self
            .inner
            .oplog
            .entries_since(db, cursors.positions.last_sent_row_id)?;
        if entries.is_empty() {
            return Ok(());
        }

        let transactions = to_transactions(&entries, &cursors.schema.relations)?;
        let count = transactions.len();
        for transaction in transactions {
            let rowid = outbound_row_id(&transaction.lsn)?;
            self.inner.client.enqueue_transaction(transaction).await?;
            self.inner
                .meta
                .set_row_id(db, MetaKey::LastSentRowId, rowid)?;
            cursors.positions.last_sent_row_id = rowid;
            self.inner.stats.write().transactions_sent += 1;
        }
        debug!(db = %self.inner.db_name, "sent {count} transactions");
        Ok(())
    }

    /// Records that the server holds every local change up to `rowid` and
    /// prunes those entries from the oplog.
    ///
    /// Acknowledging a position at or below the current one does nothing;
    /// acknowledging past what was sent is an [`SatelliteError::InvalidPosition`].
    pub async fn ack(&self, rowid: u64) -> SatelliteResult<()> {
        let mut cursors = self.inner.work.lock().await;
        let positions = &mut cursors.positions;

        if rowid <= positions.last_ackd_row_id {
            debug!(db = %self.inner.db_name, "ignoring stale ack {rowid}");
            return Ok(());
        }
        if rowid > positions.last_sent_row_id {
            return Err(SatelliteError::InvalidPosition {
                position: rowid,
                reason: format!("last sent row is {}", positions.last_sent_row_id),
            });
        }

        let meta = &self.inner.meta;
        let oplog = &self.inner.oplog;
        let mut pruned = 0;
        self.inner.adapter.transaction(&mut |tx| {
            meta.set_row_id(tx, MetaKey::LastAckdRowId, rowid)?;
            pruned = oplog.prune(tx, rowid)?;
            Ok(())
        })?;

        positions.last_ackd_row_id = rowid;
        self.inner.stats.write().acks += 1;
        debug!(db = %self.inner.db_name, "acknowledged up to {rowid}, pruned {pruned} entries");
        Ok(())
    }

    /// Applies a remote transaction.
    pub async fn apply_transaction(&self, transaction: &Transaction) -> SatelliteResult<()> {
        let mut cursors = self.inner.work.lock().await;
        let incoming = from_transaction(transaction, &cursors.schema.relations)?;
        self.apply_locked(&mut cursors, &incoming, &transaction.lsn)
            .await
    }

    /// Applies remote changes already in oplog form, recording `lsn` as
    /// the last applied position. An empty `lsn` keeps the current one.
    pub async fn apply(&self, incoming: &[OplogEntry], lsn: &[u8]) -> SatelliteResult<()> {
        let mut cursors = self.inner.work.lock().await;
        self.apply_locked(&mut cursors, incoming, lsn).await
    }

    async fn apply_locked(
        &self,
        cursors: &mut Cursors,
        incoming: &[OplogEntry],
        lsn: &[u8],
    ) -> SatelliteResult<()> {
        // local changes must be stamped to take part in the merge
        self.snapshot_locked(cursors).await?;

        let db = self.inner.adapter.as_ref();
        let local = self
            .inner
            .oplog
            .entries_since(db, cursors.positions.last_ackd_row_id)?;
        let merged = merge_entries(&local, incoming);
        let history: HashMap<RowKey, Row> = last_known_rows(&local);
        let compensations = self.inner.meta.compensations_enabled(db)?;

        let applier = Applier::new(
            &cursors.schema,
            &self.inner.oplog,
            &self.inner.opts.trigger_settings_table,
            compensations,
            &history,
        );
        let meta = &self.inner.meta;
        let mut outcome = None;
        self.inner.adapter.transaction(&mut |tx| {
            outcome = Some(applier.apply(tx, &merged)?);
            if !lsn.is_empty() {
                meta.set_lsn(tx, lsn)?;
            }
            Ok(())
        })?;
        let outcome = outcome.unwrap_or_default();

        if !lsn.is_empty() {
            cursors.positions.lsn = Some(lsn.to_vec());
        }
        {
            let mut stats = self.inner.stats.write();
            stats.transactions_applied += 1;
            stats.compensations += outcome.compensations as u64;
        }

        let changes: Vec<Change> = outcome
            .tables
            .into_iter()
            .map(|qualified_tablename| Change {
                qualified_tablename,
                rowids: None,
            })
            .collect();
        if !changes.is_empty() {
            self.inner
                .notifier
                .actually_changed(&self.inner.db_name, changes);
        }

        if let Err(err) = self.inner.client.ack_inbound(lsn.to_vec()).await {
            warn!(db = %self.inner.db_name, error = %err, "could not acknowledge inbound position");
        }
        Ok(())
    }

    async fn outbound_started(&self, lsn: Option<Lsn>) -> SatelliteResult<()> {
        {
            let mut cursors = self.inner.work.lock().await;
            let from = lsn.as_deref().and_then(lsn_to_rowid).unwrap_or(0);
            let last_sent = cursors.positions.last_ackd_row_id.max(from);
            self.inner.meta.set_row_id(
                self.inner.adapter.as_ref(),
                MetaKey::LastSentRowId,
                last_sent,
            )?;
            cursors.positions.last_sent_row_id = last_sent;
            info!(db = %self.inner.db_name, "outbound replication from row {last_sent}");
        }

        if !self.request_snapshot() {
            self.perform_snapshot().await?;
        }
        Ok(())
    }

    /// Reacts to an event from the client.
    pub async fn handle_client_event(&self, event: ClientEvent) {
        let result = match event {
            ClientEvent::Transaction(transaction) => self.apply_transaction(&transaction).await,
            ClientEvent::Ack { lsn } => match outbound_row_id(&lsn) {
                Ok(rowid) => self.ack(rowid).await,
                Err(err) => Err(err),
            },
            ClientEvent::OutboundStarted { lsn } => self.outbound_started(lsn).await,
            ClientEvent::Error(err) => {
                warn!(db = %self.inner.db_name, error = %err, "replication client error");
                Ok(())
            }
        };

        if let Err(err) = result {
            error!(db = %self.inner.db_name, error = %err, "failed to handle client event");
            self.record_error(&err);
        }
    }

    async fn handle_connectivity_change(&self, state: ConnectivityState) {
        match state {
            ConnectivityState::Available => {
                if let Err(err) = self.connect_and_start().await {
                    warn!(db = %self.inner.db_name, error = %err, "reconnect failed");
                    self.record_error(&err);
                }
            }
            ConnectivityState::Disconnected | ConnectivityState::Error => {
                if let Err(err) = self.inner.client.close().await {
                    warn!(db = %self.inner.db_name, error = %err, "closing client failed");
                }
            }
            ConnectivityState::Connected => {
                debug!(db = %self.inner.db_name, "client connected");
            }
        }
    }

    fn record_error(&self, err: &SatelliteError) {
        self.inner.stats.write().last_error = Some(err.to_string());
    }
}

async fn poll(interval: Duration, throttle: Throttle, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = ticker.tick() => throttle.request(),
        }
    }
}

async fn watch_potential_changes(
    mut changes: broadcast::Receiver<()>,
    throttle: Throttle,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            received = changes.recv() => match received {
                Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => throttle.request(),
                Err(broadcast::error::RecvError::Closed) => return,
            },
        }
    }
}

async fn watch_connectivity(
    process: Weak<ProcessInner>,
    mut changes: broadcast::Receiver<ConnectivityStateChange>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let change = tokio::select! {
            _ = shutdown.changed() => return,
            received = changes.recv() => match received {
                Ok(change) => change,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("missed {skipped} connectivity changes");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return,
            },
        };

        let Some(process) = SatelliteProcess::from_weak(&process) else {
            return;
        };
        if change.db_name == process.inner.db_name {
            process.handle_connectivity_change(change.state).await;
        }
    }
}

async fn consume_client_events(
    process: Weak<ProcessInner>,
    mut events: mpsc::UnboundedReceiver<ClientEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.changed() => return,
            event = events.recv() => match event {
                Some(event) => event,
                None => return,
            },
        };

        let Some(process) = SatelliteProcess::from_weak(&process) else {
            return;
        };
        process.handle_client_event(event).await;
    }
}

/// Decodes the LSN of an outbound transaction back to its oplog row id.
fn outbound_row_id(lsn: &[u8]) -> SatelliteResult<u64> {
    lsn_to_rowid(lsn).ok_or_else(|| SatelliteError::InvalidPosition {
        position: 0,
        reason: format!("{} byte lsn is not a row id", lsn.len()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use satellite_protocol::rowid_to_lsn;

    #[test]
    fn outbound_lsn_decodes_to_row_id() {
        assert_eq!(outbound_row_id(&rowid_to_lsn(42)).unwrap(), 42);
        assert_eq!(outbound_row_id(&[1, 0]).unwrap(), 256);
    }

    #[test]
    fn oversized_outbound_lsn_is_an_invalid_position() {
        let err = outbound_row_id(&[0; 9]).unwrap_err();
        assert!(matches!(err, SatelliteError::InvalidPosition { .. }));
        assert_eq!(err.code(), "INVALID_POSITION");
    }
}
