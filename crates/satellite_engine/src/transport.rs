//! Replication client abstraction.
//!
//! The process drives replication through the [`Client`] trait, so it can be
//! tested against [`MockClient`] without a server.

use crate::error::{SatelliteError, SatelliteResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use satellite_protocol::{Lsn, Transaction};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

/// Identity presented when authenticating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthState {
    /// Application name.
    pub app: String,
    /// Environment name.
    pub env: String,
    /// Persistent client id.
    pub client_id: String,
    /// Access token.
    pub token: Option<String>,
}

/// Successful authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthResponse {
    /// Id the server identified itself with.
    pub server_id: String,
}

/// Server version information.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    /// Server version string.
    pub server_version: String,
    /// Server node name.
    pub node: String,
}

/// Lifecycle of the client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// No transport.
    Disconnected,
    /// Transport opening.
    Connecting,
    /// Transport open, inbound replication stopped.
    Connected,
    /// Waiting for the server to confirm inbound replication.
    ReplicationStarting,
    /// Inbound replication running.
    Replicating,
    /// Waiting for the server to confirm the stop.
    ReplicationStopping,
    /// The transport failed; only `close()` leaves this state.
    Errored,
}

impl ClientState {
    /// Returns true while a transport is open.
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            ClientState::Connected
                | ClientState::ReplicationStarting
                | ClientState::Replicating
                | ClientState::ReplicationStopping
        )
    }

    /// Returns true if `connect()` may be called.
    pub fn can_connect(&self) -> bool {
        matches!(self, ClientState::Disconnected | ClientState::Errored)
    }
}

/// Status of one replication direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplicationStatus {
    /// Not replicating.
    #[default]
    Stopped,
    /// Start requested.
    Starting,
    /// Replicating.
    Active,
    /// Stop requested.
    Stopping,
}

/// Something the client reports to its owner.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// A complete inbound transaction.
    Transaction(Transaction),
    /// The server acknowledged outbound data up to `lsn`.
    Ack {
        /// Acknowledged position.
        lsn: Lsn,
    },
    /// The server asked for outbound replication from `lsn`, or from the
    /// last acknowledged position when `None`.
    OutboundStarted {
        /// Requested position.
        lsn: Option<Lsn>,
    },
    /// A server error not tied to a request.
    Error(SatelliteError),
}

/// A replication client.
///
/// At most one request (`authenticate`, `start_replication`,
/// `stop_replication`) may be outstanding at a time.
#[async_trait]
pub trait Client: Send + Sync {
    /// Opens the transport.
    async fn connect(&self) -> SatelliteResult<()>;

    /// Authenticates the session.
    async fn authenticate(&self, auth: &AuthState) -> SatelliteResult<AuthResponse>;

    /// Starts inbound replication from `lsn`, or from the last position the
    /// server has acknowledged when `None`.
    async fn start_replication(&self, lsn: Option<Lsn>) -> SatelliteResult<()>;

    /// Stops inbound replication.
    async fn stop_replication(&self) -> SatelliteResult<()>;

    /// Tears the transport down. Safe in any state.
    async fn close(&self) -> SatelliteResult<()>;

    /// Returns true when no transport is open.
    fn is_closed(&self) -> bool;

    /// Returns true when the server accepts outbound transactions.
    fn is_outbound_active(&self) -> bool;

    /// Sends a local transaction to the server.
    async fn enqueue_transaction(&self, transaction: Transaction) -> SatelliteResult<()>;

    /// Records that inbound data up to `lsn` was applied.
    async fn ack_inbound(&self, lsn: Lsn) -> SatelliteResult<()>;

    /// Returns the event stream, replacing any earlier subscription.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<ClientEvent>;
}

/// A scripted client for testing.
///
/// Records what the process asks for and lets tests inject events.
#[derive(Debug, Default)]
pub struct MockClient {
    connected: AtomicBool,
    outbound_active: AtomicBool,
    fail_connect: AtomicBool,
    enqueued: Mutex<Vec<Transaction>>,
    start_requests: Mutex<Vec<Option<Lsn>>>,
    acked_inbound: Mutex<Vec<Lsn>>,
    events: Mutex<Option<mpsc::UnboundedSender<ClientEvent>>>,
}

impl MockClient {
    /// Creates a disconnected mock client.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `enqueue_transaction` accept transactions.
    pub fn set_outbound_active(&self, active: bool) {
        self.outbound_active.store(active, Ordering::SeqCst);
    }

    /// Makes `connect` fail.
    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Delivers an event to the subscriber. Returns false without one.
    pub fn emit(&self, event: ClientEvent) -> bool {
        self.events
            .lock()
            .as_ref()
            .is_some_and(|tx| tx.send(event).is_ok())
    }

    /// Transactions sent so far.
    pub fn enqueued(&self) -> Vec<Transaction> {
        self.enqueued.lock().clone()
    }

    /// Positions passed to `start_replication`.
    pub fn start_requests(&self) -> Vec<Option<Lsn>> {
        self.start_requests.lock().clone()
    }

    /// Positions passed to `ack_inbound`.
    pub fn acked_inbound(&self) -> Vec<Lsn> {
        self.acked_inbound.lock().clone()
    }
}

#[async_trait]
impl Client for MockClient {
    async fn connect(&self) -> SatelliteResult<()> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(SatelliteError::transport_retryable("connection refused"));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn authenticate(&self, auth: &AuthState) -> SatelliteResult<AuthResponse> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(SatelliteError::NotConnected);
        }
        Ok(AuthResponse {
            server_id: format!("mock-{}", auth.app),
        })
    }

    async fn start_replication(&self, lsn: Option<Lsn>) -> SatelliteResult<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(SatelliteError::NotConnected);
        }
        self.start_requests.lock().push(lsn);
        Ok(())
    }

    async fn stop_replication(&self) -> SatelliteResult<()> {
        Ok(())
    }

    async fn close(&self) -> SatelliteResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        self.outbound_active.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        !self.connected.load(Ordering::SeqCst)
    }

    fn is_outbound_active(&self) -> bool {
        self.outbound_active.load(Ordering::SeqCst)
    }

    async fn enqueue_transaction(&self, transaction: Transaction) -> SatelliteResult<()> {
        if !self.is_outbound_active() {
            return Err(SatelliteError::ReplicationNotStarted);
        }
        self.enqueued.lock().push(transaction);
        Ok(())
    }

    async fn ack_inbound(&self, lsn: Lsn) -> SatelliteResult<()> {
        self.acked_inbound.lock().push(lsn);
        Ok(())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<ClientEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.events.lock() = Some(tx);
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_state_checks() {
        assert!(ClientState::Replicating.is_connected());
        assert!(!ClientState::Errored.is_connected());
        assert!(ClientState::Errored.can_connect());
        assert!(!ClientState::Connecting.can_connect());
    }

    #[tokio::test]
    async fn mock_client_connection() {
        let client = MockClient::new();
        assert!(client.is_closed());

        client.connect().await.unwrap();
        assert!(!client.is_closed());

        client.close().await.unwrap();
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn mock_client_outbound_requires_activation() {
        let client = MockClient::new();
        let txn = Transaction {
            lsn: vec![1],
            commit_timestamp: 0,
            changes: vec![],
        };
        assert!(client.enqueue_transaction(txn.clone()).await.is_err());

        client.set_outbound_active(true);
        client.enqueue_transaction(txn).await.unwrap();
        assert_eq!(client.enqueued().len(), 1);
    }

    #[tokio::test]
    async fn mock_client_events() {
        let client = MockClient::new();
        assert!(!client.emit(ClientEvent::Ack { lsn: vec![1] }));

        let mut events = client.subscribe();
        assert!(client.emit(ClientEvent::Ack { lsn: vec![1] }));
        assert!(matches!(events.recv().await, Some(ClientEvent::Ack { lsn }) if lsn == vec![1]));
    }
}
