//! Wire-protocol replication client.
//!
//! A [`SatelliteClient`] owns one transport connection. A reader task owns
//! the read half, decodes frames and dispatches every message; requests are
//! written through an async mutex on the write half. Requests are correlated
//! with their responses by type, so only one may be outstanding at a time.
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> ReplicationStarting
//!      ^                           ^               |
//!      |                           |               v
//!    close()             ReplicationStopping <- Replicating
//! ```

use crate::config::ClientOptions;
use crate::error::{SatelliteError, SatelliteResult};
use crate::notifier::{ConnectivityState, Notifier};
use crate::socket::{BoxedSocket, SocketFactory};
use crate::transport::{
    AuthResponse, AuthState, Client, ClientEvent, ClientState, ReplicationStatus, ServerInfo,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use satellite_protocol::messages::{
    sat_auth_header_pair::HeaderKey, sat_in_start_replication_req::ReplicationOption,
    sat_trans_op, SatAuthHeaderPair, SatAuthReq, SatGetServerInfoReq, SatInStartReplicationReq,
    SatInStartReplicationResp, SatInStopReplicationReq, SatInStopReplicationResp, SatOpLog,
    SatOpRow, SatPingResp,
};
use satellite_protocol::{
    deserialize_row, encode_frame, relation_from_message, relation_to_message,
    transaction_to_oplog, Change, ChangeType, FrameDecoder, Lsn, Relation, SatMessage,
    Transaction,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, trace, warn};

/// Protocol version offered when authenticating.
pub const PROTOCOL_VERSION: &str = "1.0";

const READ_BUFFER_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestKind {
    Auth,
    ServerInfo,
    StartReplication,
    StopReplication,
}

impl RequestKind {
    fn name(self) -> &'static str {
        match self {
            RequestKind::Auth => "authenticate",
            RequestKind::ServerInfo => "get server info",
            RequestKind::StartReplication => "start replication",
            RequestKind::StopReplication => "stop replication",
        }
    }
}

struct PendingRequest {
    kind: RequestKind,
    reply: oneshot::Sender<SatelliteResult<SatMessage>>,
}

struct IncomingTransaction {
    commit_timestamp: u64,
    lsn: Lsn,
    changes: Vec<Change>,
}

#[derive(Default)]
struct Inbound {
    status: ReplicationStatus,
    relations: HashMap<u32, Relation>,
    ack_lsn: Option<Lsn>,
    incomplete: Option<IncomingTransaction>,
}

#[derive(Default)]
struct Outbound {
    status: ReplicationStatus,
    sent_relations: HashSet<u32>,
    enqueued_lsn: Option<Lsn>,
    ack_lsn: Option<Lsn>,
}

struct Session {
    connection: ClientState,
    inbound: Inbound,
    outbound: Outbound,
}

impl Session {
    fn new() -> Self {
        Self {
            connection: ClientState::Disconnected,
            inbound: Inbound::default(),
            outbound: Outbound::default(),
        }
    }

    fn reset(&mut self, connection: ClientState) {
        self.connection = connection;
        self.inbound = Inbound::default();
        self.outbound = Outbound::default();
    }

    fn state(&self) -> ClientState {
        if self.connection != ClientState::Connected {
            return self.connection;
        }
        match self.inbound.status {
            ReplicationStatus::Stopped => ClientState::Connected,
            ReplicationStatus::Starting => ClientState::ReplicationStarting,
            ReplicationStatus::Active => ClientState::Replicating,
            ReplicationStatus::Stopping => ClientState::ReplicationStopping,
        }
    }
}

/// State shared between the client handle and its reader task.
struct Shared {
    db_name: String,
    notifier: Arc<dyn Notifier>,
    sync_mode: bool,
    session: Mutex<Session>,
    pending: Mutex<Option<PendingRequest>>,
    writer: tokio::sync::Mutex<Option<WriteHalf<BoxedSocket>>>,
    activity: watch::Sender<u64>,
    events: Mutex<Option<mpsc::UnboundedSender<ClientEvent>>>,
}

impl Shared {
    async fn send(&self, message: &SatMessage) -> SatelliteResult<()> {
        trace!(db = %self.db_name, "sending {}", message.msg_type().name());
        let frame = encode_frame(message);

        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(SatelliteError::NotConnected)?;
        writer
            .write_all(&frame)
            .await
            .map_err(|e| SatelliteError::transport_retryable(e.to_string()))?;
        writer
            .flush()
            .await
            .map_err(|e| SatelliteError::transport_retryable(e.to_string()))
    }

    fn emit(&self, event: ClientEvent) {
        if let Some(events) = self.events.lock().as_ref() {
            let _ = events.send(event);
        }
    }

    fn notify(&self, state: ConnectivityState) {
        self.notifier.connectivity_state_change(&self.db_name, state);
    }

    fn reject_pending(&self, err: SatelliteError) {
        if let Some(pending) = self.pending.lock().take() {
            let _ = pending.reply.send(Err(err));
        }
    }

    /// Takes the pending request if `message` answers it.
    fn take_pending(&self, kind: RequestKind, message: &SatMessage) -> SatelliteResult<PendingRequest> {
        let mut pending = self.pending.lock();
        if pending.as_ref().is_some_and(|p| p.kind == kind) {
            if let Some(request) = pending.take() {
                return Ok(request);
            }
        }
        Err(SatelliteError::UnexpectedMessageType(
            message.msg_type().name().to_string(),
        ))
    }

    fn resolve(&self, kind: RequestKind, message: SatMessage) -> SatelliteResult<()> {
        let request = self.take_pending(kind, &message)?;
        let _ = request.reply.send(Ok(message));
        Ok(())
    }

    fn transport_closed(&self) {
        info!(db = %self.db_name, "replication connection closed by server");
        self.session.lock().reset(ClientState::Disconnected);
        self.reject_pending(SatelliteError::ConnectionClosed);
        self.notify(ConnectivityState::Disconnected);
    }

    fn fail(&self, err: SatelliteError) {
        warn!(db = %self.db_name, error = %err, "replication connection failed");
        self.session.lock().reset(ClientState::Errored);
        self.reject_pending(err.clone());
        self.emit(ClientEvent::Error(err));
        self.notify(ConnectivityState::Error);
    }

    async fn handle_message(&self, message: SatMessage) -> SatelliteResult<()> {
        trace!(db = %self.db_name, "received {}", message.msg_type().name());

        if !matches!(message, SatMessage::OpLog(_))
            && self.session.lock().inbound.incomplete.is_some()
        {
            return Err(SatelliteError::violation(format!(
                "{} inside an open transaction",
                message.msg_type().name()
            )));
        }

        match message {
            SatMessage::AuthResp(_) => self.resolve(RequestKind::Auth, message),
            SatMessage::GetServerInfoResp(_) => self.resolve(RequestKind::ServerInfo, message),
            SatMessage::StartReplicationResp(_) => {
                let request = self.take_pending(RequestKind::StartReplication, &message)?;
                {
                    let mut session = self.session.lock();
                    if session.inbound.status == ReplicationStatus::Starting {
                        session.inbound.status = ReplicationStatus::Active;
                    }
                }
                let _ = request.reply.send(Ok(message));
                Ok(())
            }
            SatMessage::StopReplicationResp(_) => {
                let request = self.take_pending(RequestKind::StopReplication, &message)?;
                self.session.lock().inbound.status = ReplicationStatus::Stopped;
                let _ = request.reply.send(Ok(message));
                Ok(())
            }
            SatMessage::ErrorResp(resp) => {
                let err = SatelliteError::Server {
                    code: resp.error_type(),
                };
                let pending = self.pending.lock().take();
                match pending {
                    Some(request) => {
                        let _ = request.reply.send(Err(err));
                    }
                    None => {
                        warn!(db = %self.db_name, error = %err, "server error");
                        self.emit(ClientEvent::Error(err));
                    }
                }
                Ok(())
            }
            SatMessage::PingReq(_) => {
                let lsn = self.session.lock().inbound.ack_lsn.clone();
                self.send(&SatMessage::PingResp(SatPingResp { lsn })).await
            }
            SatMessage::PingResp(resp) => {
                if let Some(lsn) = resp.lsn {
                    self.session.lock().outbound.ack_lsn = Some(lsn.clone());
                    self.emit(ClientEvent::Ack { lsn });
                }
                Ok(())
            }
            SatMessage::StartReplicationReq(req) => {
                let from_last_ack = req
                    .options
                    .contains(&(ReplicationOption::LastAcknowledged as i32));
                let lsn = if from_last_ack || req.lsn.is_empty() {
                    None
                } else {
                    Some(req.lsn)
                };
                {
                    let mut session = self.session.lock();
                    session.outbound.status = ReplicationStatus::Active;
                    session.outbound.sent_relations.clear();
                }
                self.send(&SatMessage::StartReplicationResp(SatInStartReplicationResp {}))
                    .await?;
                info!(db = %self.db_name, "outbound replication started");
                self.emit(ClientEvent::OutboundStarted { lsn });
                Ok(())
            }
            SatMessage::StopReplicationReq(_) => {
                self.session.lock().outbound.status = ReplicationStatus::Stopped;
                info!(db = %self.db_name, "outbound replication stopped");
                self.send(&SatMessage::StopReplicationResp(SatInStopReplicationResp {}))
                    .await
            }
            SatMessage::Relation(relation) => {
                let mut session = self.session.lock();
                if session.inbound.status == ReplicationStatus::Active {
                    session
                        .inbound
                        .relations
                        .insert(relation.relation_id, relation_from_message(&relation));
                } else {
                    debug!(
                        db = %self.db_name,
                        "ignoring relation {} while inbound is {:?}",
                        relation.table_name,
                        session.inbound.status
                    );
                }
                Ok(())
            }
            SatMessage::OpLog(log) => {
                for transaction in self.handle_oplog(log)? {
                    self.emit(ClientEvent::Transaction(transaction));
                }
                Ok(())
            }
            SatMessage::AuthReq(_) | SatMessage::GetServerInfoReq(_) => Err(
                SatelliteError::UnexpectedMessageType(message.msg_type().name().to_string()),
            ),
        }
    }

    /// Reassembles transactions; a transaction may span several messages.
    fn handle_oplog(&self, log: SatOpLog) -> SatelliteResult<Vec<Transaction>> {
        let mut session = self.session.lock();
        let inbound = &mut session.inbound;
        let mut completed = Vec::new();

        for op in log.ops {
            let change = match op.op {
                Some(sat_trans_op::Op::Begin(begin)) => {
                    if inbound.incomplete.is_some() {
                        return Err(SatelliteError::violation("begin inside an open transaction"));
                    }
                    inbound.incomplete = Some(IncomingTransaction {
                        commit_timestamp: begin.commit_timestamp,
                        lsn: begin.lsn,
                        changes: Vec::new(),
                    });
                    continue;
                }
                Some(sat_trans_op::Op::Commit(commit)) => {
                    let txn = inbound
                        .incomplete
                        .take()
                        .ok_or_else(|| SatelliteError::violation("commit without begin"))?;
                    let lsn = if commit.lsn.is_empty() {
                        txn.lsn
                    } else {
                        commit.lsn
                    };
                    completed.push(Transaction {
                        lsn,
                        commit_timestamp: txn.commit_timestamp,
                        changes: txn.changes,
                    });
                    continue;
                }
                Some(sat_trans_op::Op::Insert(insert)) => decode_change(
                    &inbound.relations,
                    insert.relation_id,
                    ChangeType::Insert,
                    insert.row_data.as_ref(),
                    None,
                )?,
                Some(sat_trans_op::Op::Update(update)) => decode_change(
                    &inbound.relations,
                    update.relation_id,
                    ChangeType::Update,
                    update.row_data.as_ref(),
                    update.old_row_data.as_ref(),
                )?,
                Some(sat_trans_op::Op::Delete(delete)) => decode_change(
                    &inbound.relations,
                    delete.relation_id,
                    ChangeType::Delete,
                    None,
                    delete.old_row_data.as_ref(),
                )?,
                None => return Err(SatelliteError::violation("empty transaction op")),
            };

            inbound
                .incomplete
                .as_mut()
                .ok_or_else(|| SatelliteError::violation("data op outside a transaction"))?
                .changes
                .push(change);
        }

        Ok(completed)
    }
}

fn decode_change(
    relations: &HashMap<u32, Relation>,
    relation_id: u32,
    change_type: ChangeType,
    row: Option<&SatOpRow>,
    old_row: Option<&SatOpRow>,
) -> SatelliteResult<Change> {
    let relation = relations
        .get(&relation_id)
        .ok_or_else(|| SatelliteError::violation(format!("unknown relation id {relation_id}")))?;

    let record = row.map(|r| deserialize_row(r, relation)).transpose()?;
    let old_record = old_row.map(|r| deserialize_row(r, relation)).transpose()?;

    match change_type {
        ChangeType::Insert | ChangeType::Update if record.is_none() => {
            return Err(SatelliteError::violation(format!(
                "{change_type:?} on {} without row data",
                relation.table
            )));
        }
        ChangeType::Delete if old_record.is_none() => {
            return Err(SatelliteError::violation(format!(
                "delete on {} without old row data",
                relation.table
            )));
        }
        _ => {}
    }

    Ok(Change {
        relation: relation.clone(),
        change_type,
        record,
        old_record,
    })
}

async fn read_loop(shared: Arc<Shared>, mut reader: ReadHalf<BoxedSocket>) {
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                shared.transport_closed();
                return;
            }
            Ok(n) => n,
            Err(err) => {
                shared.fail(SatelliteError::transport_retryable(err.to_string()));
                return;
            }
        };

        // any inbound traffic pushes the request deadline out
        shared.activity.send_modify(|count| *count = count.wrapping_add(1));
        decoder.extend(&buf[..n]);

        loop {
            let message = match decoder.next_message() {
                Ok(Some(message)) => message,
                Ok(None) => break,
                Err(err) => {
                    shared.fail(err.into());
                    return;
                }
            };

            match shared.handle_message(message).await {
                Ok(()) => {}
                Err(err @ SatelliteError::UnexpectedMessageType(_)) => {
                    warn!(db = %shared.db_name, error = %err, "dropping message");
                    shared.emit(ClientEvent::Error(err));
                }
                Err(err) => {
                    shared.fail(err);
                    return;
                }
            }
        }
    }
}

/// Replication client over a [`SocketFactory`] transport.
pub struct SatelliteClient {
    opts: ClientOptions,
    socket_factory: Arc<dyn SocketFactory>,
    shared: Arc<Shared>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl SatelliteClient {
    /// Creates a disconnected client for `db_name`.
    pub fn new(
        db_name: impl Into<String>,
        opts: ClientOptions,
        socket_factory: Arc<dyn SocketFactory>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let (activity, _) = watch::channel(0);
        let shared = Arc::new(Shared {
            db_name: db_name.into(),
            notifier,
            sync_mode: opts.sync_batch_size.is_some(),
            session: Mutex::new(Session::new()),
            pending: Mutex::new(None),
            writer: tokio::sync::Mutex::new(None),
            activity,
            events: Mutex::new(None),
        });

        Self {
            opts,
            socket_factory,
            shared,
            reader: Mutex::new(None),
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ClientState {
        self.shared.session.lock().state()
    }

    /// Status of outbound replication.
    pub fn outbound_status(&self) -> ReplicationStatus {
        self.shared.session.lock().outbound.status
    }

    /// Last outbound position the server acknowledged.
    pub fn outbound_ack_lsn(&self) -> Option<Lsn> {
        self.shared.session.lock().outbound.ack_lsn.clone()
    }

    /// Position of the last transaction enqueued for the server.
    pub fn enqueued_lsn(&self) -> Option<Lsn> {
        self.shared.session.lock().outbound.enqueued_lsn.clone()
    }

    /// Asks the server for its version.
    pub async fn get_server_info(&self) -> SatelliteResult<ServerInfo> {
        self.ensure_connected()?;
        let request = SatMessage::GetServerInfoReq(SatGetServerInfoReq {});
        match self.request(request, RequestKind::ServerInfo).await? {
            SatMessage::GetServerInfoResp(resp) => Ok(ServerInfo {
                server_version: resp.server_version,
                node: resp.node,
            }),
            other => Err(SatelliteError::UnexpectedMessageType(
                other.msg_type().name().to_string(),
            )),
        }
    }

    fn ensure_connected(&self) -> SatelliteResult<()> {
        if self.state().is_connected() {
            Ok(())
        } else {
            Err(SatelliteError::NotConnected)
        }
    }

    /// Sends `message` and waits for the response of `kind`.
    ///
    /// The deadline restarts whenever bytes arrive, so a busy stream never
    /// times a request out.
    async fn request(&self, message: SatMessage, kind: RequestKind) -> SatelliteResult<SatMessage> {
        let (reply, mut response) = oneshot::channel();
        let mut activity = self.shared.activity.subscribe();

        {
            let mut pending = self.shared.pending.lock();
            if let Some(outstanding) = pending.as_ref() {
                return Err(SatelliteError::UnexpectedState(format!(
                    "{} while {} is outstanding",
                    kind.name(),
                    outstanding.kind.name()
                )));
            }
            *pending = Some(PendingRequest { kind, reply });
        }

        if let Err(err) = self.shared.send(&message).await {
            self.shared.pending.lock().take();
            return Err(err);
        }

        let timeout = self.opts.timeout;
        let deadline = sleep(timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;
                result = &mut response => {
                    return result.unwrap_or(Err(SatelliteError::ConnectionClosed));
                }
                changed = activity.changed() => {
                    if changed.is_err() {
                        return Err(SatelliteError::ConnectionClosed);
                    }
                    deadline.as_mut().reset(Instant::now() + timeout);
                }
                () = &mut deadline => {
                    self.shared.pending.lock().take();
                    return Err(SatelliteError::Timeout { request: kind.name() });
                }
            }
        }
    }

    async fn teardown(&self) {
        let reader = self.reader.lock().take();
        if let Some(reader) = reader {
            reader.abort();
        }

        let writer = self.shared.writer.lock().await.take();
        if let Some(mut writer) = writer {
            let _ = writer.shutdown().await;
        }
    }
}

#[async_trait]
impl Client for SatelliteClient {
    async fn connect(&self) -> SatelliteResult<()> {
        {
            let mut session = self.shared.session.lock();
            let state = session.state();
            if !state.can_connect() {
                return Err(SatelliteError::UnexpectedState(format!(
                    "connect while {state:?}"
                )));
            }
            session.connection = ClientState::Connecting;
        }
        self.teardown().await;

        let retry = &self.opts.retry;
        let mut attempt = 0;
        let socket = loop {
            match self.socket_factory.connect(&self.opts).await {
                Ok(socket) => break socket,
                Err(err) => {
                    attempt += 1;
                    if attempt >= retry.max_attempts.max(1) {
                        warn!(
                            db = %self.shared.db_name,
                            "connecting to {}:{} failed after {attempt} attempts: {err}",
                            self.opts.host,
                            self.opts.port
                        );
                        self.shared.session.lock().reset(ClientState::Disconnected);
                        self.shared.notify(ConnectivityState::Error);
                        return Err(SatelliteError::transport_retryable(err.to_string()));
                    }
                    let delay = retry.delay_for_attempt(attempt);
                    debug!(db = %self.shared.db_name, "connect attempt {attempt} failed: {err}; retrying in {delay:?}");
                    sleep(delay).await;
                }
            }
        };

        let (reader, writer) = tokio::io::split(socket);
        *self.shared.writer.lock().await = Some(writer);
        self.shared.session.lock().reset(ClientState::Connected);
        *self.reader.lock() = Some(tokio::spawn(read_loop(self.shared.clone(), reader)));

        info!(db = %self.shared.db_name, "connected to {}:{}", self.opts.host, self.opts.port);
        self.shared.notify(ConnectivityState::Connected);
        Ok(())
    }

    async fn authenticate(&self, auth: &AuthState) -> SatelliteResult<AuthResponse> {
        self.ensure_connected()?;
        let request = SatMessage::AuthReq(SatAuthReq {
            id: auth.client_id.clone(),
            token: auth.token.clone().unwrap_or_default(),
            headers: vec![SatAuthHeaderPair {
                key: HeaderKey::ProtoVersion as i32,
                value: PROTOCOL_VERSION.into(),
            }],
        });

        match self.request(request, RequestKind::Auth).await {
            Ok(SatMessage::AuthResp(resp)) => {
                debug!(db = %self.shared.db_name, "authenticated as {}", auth.client_id);
                Ok(AuthResponse { server_id: resp.id })
            }
            Ok(other) => Err(SatelliteError::UnexpectedMessageType(
                other.msg_type().name().to_string(),
            )),
            Err(SatelliteError::Server { code }) => {
                Err(SatelliteError::Auth(format!("server rejected credentials: {code:?}")))
            }
            Err(err) => Err(err),
        }
    }

    async fn start_replication(&self, lsn: Option<Lsn>) -> SatelliteResult<()> {
        {
            let mut session = self.shared.session.lock();
            if !session.state().is_connected() {
                return Err(SatelliteError::NotConnected);
            }
            if session.inbound.status != ReplicationStatus::Stopped {
                return Err(SatelliteError::ReplicationAlreadyStarted);
            }
            session.inbound.status = ReplicationStatus::Starting;
        }

        let mut options = Vec::new();
        let lsn = match lsn {
            Some(lsn) if !lsn.is_empty() => lsn,
            _ => {
                options.push(ReplicationOption::LastAcknowledged as i32);
                Vec::new()
            }
        };
        let mut sync_batch_size = 0;
        if let Some(size) = self.opts.sync_batch_size {
            options.push(ReplicationOption::SyncMode as i32);
            sync_batch_size = i32::try_from(size).unwrap_or(i32::MAX);
        }

        let request = SatMessage::StartReplicationReq(SatInStartReplicationReq {
            lsn,
            options,
            sync_batch_size,
        });

        match self.request(request, RequestKind::StartReplication).await {
            Ok(_) => {
                info!(db = %self.shared.db_name, "inbound replication started");
                Ok(())
            }
            Err(err) => {
                let mut session = self.shared.session.lock();
                if session.inbound.status == ReplicationStatus::Starting {
                    session.inbound.status = ReplicationStatus::Stopped;
                }
                Err(err)
            }
        }
    }

    async fn stop_replication(&self) -> SatelliteResult<()> {
        {
            let mut session = self.shared.session.lock();
            if session.connection != ClientState::Connected
                || session.inbound.status != ReplicationStatus::Active
            {
                return Err(SatelliteError::ReplicationNotStarted);
            }
            session.inbound.status = ReplicationStatus::Stopping;
        }

        let request = SatMessage::StopReplicationReq(SatInStopReplicationReq {});
        match self.request(request, RequestKind::StopReplication).await {
            Ok(_) => {
                info!(db = %self.shared.db_name, "inbound replication stopped");
                Ok(())
            }
            Err(err) => {
                let mut session = self.shared.session.lock();
                if session.inbound.status == ReplicationStatus::Stopping {
                    session.inbound.status = ReplicationStatus::Active;
                }
                Err(err)
            }
        }
    }

    async fn close(&self) -> SatelliteResult<()> {
        self.teardown().await;
        self.shared.session.lock().reset(ClientState::Disconnected);
        self.shared.reject_pending(SatelliteError::ConnectionClosed);
        debug!(db = %self.shared.db_name, "client closed");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        !self.state().is_connected()
    }

    fn is_outbound_active(&self) -> bool {
        self.outbound_status() == ReplicationStatus::Active
    }

    async fn enqueue_transaction(&self, transaction: Transaction) -> SatelliteResult<()> {
        let messages = {
            let mut session = self.shared.session.lock();
            if session.outbound.status != ReplicationStatus::Active {
                return Err(SatelliteError::ReplicationNotStarted);
            }

            let mut messages = Vec::new();
            for change in &transaction.changes {
                if session.outbound.sent_relations.insert(change.relation.id) {
                    messages.push(SatMessage::Relation(relation_to_message(&change.relation)));
                }
            }
            messages.push(SatMessage::OpLog(transaction_to_oplog(&transaction)));
            session.outbound.enqueued_lsn = Some(transaction.lsn.clone());
            messages
        };

        for message in &messages {
            self.shared.send(message).await?;
        }
        debug!(
            db = %self.shared.db_name,
            "enqueued transaction with {} changes",
            transaction.changes.len()
        );
        Ok(())
    }

    async fn ack_inbound(&self, lsn: Lsn) -> SatelliteResult<()> {
        let send_ack = {
            let mut session = self.shared.session.lock();
            session.inbound.ack_lsn = Some(lsn.clone());
            self.shared.sync_mode && session.state().is_connected()
        };

        if send_ack {
            self.shared
                .send(&SatMessage::PingResp(SatPingResp { lsn: Some(lsn) }))
                .await?;
        }
        Ok(())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<ClientEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.shared.events.lock() = Some(tx);
        rx
    }
}

impl Drop for SatelliteClient {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.get_mut().take() {
            reader.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::EventNotifier;
    use satellite_protocol::messages::{SatOpBegin, SatOpCommit, SatOpInsert, SatTransOp};
    use satellite_protocol::{RelationColumn, TableType};

    fn shared() -> Shared {
        let (activity, _) = watch::channel(0);
        Shared {
            db_name: "test.db".into(),
            notifier: Arc::new(EventNotifier::new("test.db")),
            sync_mode: false,
            session: Mutex::new(Session::new()),
            pending: Mutex::new(None),
            writer: tokio::sync::Mutex::new(None),
            activity,
            events: Mutex::new(None),
        }
    }

    fn relation() -> Relation {
        Relation {
            id: 1,
            schema: "public".into(),
            table: "items".into(),
            table_type: TableType::Table,
            columns: vec![RelationColumn::new("value", "TEXT", true)],
        }
    }

    fn op(op: sat_trans_op::Op) -> SatTransOp {
        SatTransOp { op: Some(op) }
    }

    fn begin() -> SatTransOp {
        op(sat_trans_op::Op::Begin(SatOpBegin {
            commit_timestamp: 10,
            trans_id: String::new(),
            lsn: vec![7],
        }))
    }

    fn commit() -> SatTransOp {
        op(sat_trans_op::Op::Commit(SatOpCommit {
            commit_timestamp: 10,
            trans_id: String::new(),
            lsn: vec![7],
        }))
    }

    fn insert(value: &str) -> SatTransOp {
        op(sat_trans_op::Op::Insert(SatOpInsert {
            relation_id: 1,
            row_data: Some(SatOpRow {
                nulls_bitmask: vec![0],
                values: vec![value.as_bytes().to_vec()],
            }),
        }))
    }

    #[test]
    fn session_state_follows_inbound() {
        let mut session = Session::new();
        assert_eq!(session.state(), ClientState::Disconnected);

        session.reset(ClientState::Connected);
        session.inbound.status = ReplicationStatus::Starting;
        assert_eq!(session.state(), ClientState::ReplicationStarting);
        session.inbound.status = ReplicationStatus::Active;
        assert_eq!(session.state(), ClientState::Replicating);

        session.reset(ClientState::Errored);
        assert_eq!(session.state(), ClientState::Errored);
    }

    #[test]
    fn transaction_spans_messages() {
        let shared = shared();
        shared.session.lock().inbound.relations.insert(1, relation());

        let first = shared
            .handle_oplog(SatOpLog {
                ops: vec![begin(), insert("a")],
            })
            .unwrap();
        assert!(first.is_empty());

        let second = shared
            .handle_oplog(SatOpLog {
                ops: vec![insert("b"), commit()],
            })
            .unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].lsn, vec![7]);
        assert_eq!(second[0].changes.len(), 2);
        assert!(shared.session.lock().inbound.incomplete.is_none());
    }

    #[test]
    fn ops_outside_transaction_are_violations() {
        let shared = shared();
        shared.session.lock().inbound.relations.insert(1, relation());

        let err = shared
            .handle_oplog(SatOpLog {
                ops: vec![insert("a")],
            })
            .unwrap_err();
        assert!(matches!(err, SatelliteError::ProtocolViolation(_)));

        let err = shared
            .handle_oplog(SatOpLog {
                ops: vec![commit()],
            })
            .unwrap_err();
        assert!(matches!(err, SatelliteError::ProtocolViolation(_)));
    }

    #[test]
    fn unknown_relation_is_a_violation() {
        let shared = shared();
        let err = shared
            .handle_oplog(SatOpLog {
                ops: vec![begin(), insert("a")],
            })
            .unwrap_err();
        assert!(matches!(err, SatelliteError::ProtocolViolation(ref m) if m.contains("relation")));
    }

    #[test]
    fn response_without_request_is_unexpected() {
        let shared = shared();
        let message = SatMessage::AuthResp(Default::default());
        assert!(matches!(
            shared.resolve(RequestKind::Auth, message),
            Err(SatelliteError::UnexpectedMessageType(_))
        ));
    }
}
