//! Change and connectivity notifications.

use satellite_protocol::QualifiedTablename;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 256;

/// Rows of one table touched by a change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    /// Table that changed.
    pub qualified_tablename: QualifiedTablename,
    /// Local row ids, when known.
    pub rowids: Option<Vec<i64>>,
}

/// Changes committed to one database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataChangeNotification {
    /// Database the changes were written to.
    pub db_name: String,
    /// Changed tables.
    pub changes: Vec<Change>,
}

/// Connectivity of a replication client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    /// The network is available; the process should (re)connect.
    Available,
    /// The client is connected.
    Connected,
    /// The client disconnected.
    Disconnected,
    /// The transport failed.
    Error,
}

/// A connectivity change of one database's client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectivityStateChange {
    /// Database whose client changed state.
    pub db_name: String,
    /// New state.
    pub state: ConnectivityState,
}

/// Sink and source of notifications between the application and the
/// replication process.
pub trait Notifier: Send + Sync {
    /// Something may have written to the database.
    fn potentially_changed(&self);

    /// Rows were committed to `db_name`.
    fn actually_changed(&self, db_name: &str, changes: Vec<Change>);

    /// The client of `db_name` changed connectivity.
    fn connectivity_state_change(&self, db_name: &str, state: ConnectivityState);

    /// Subscribes to potential data changes.
    fn subscribe_to_potential_data_changes(&self) -> broadcast::Receiver<()>;

    /// Subscribes to committed data changes.
    fn subscribe_to_data_changes(&self) -> broadcast::Receiver<DataChangeNotification>;

    /// Subscribes to connectivity changes.
    fn subscribe_to_connectivity_state_changes(
        &self,
    ) -> broadcast::Receiver<ConnectivityStateChange>;
}

/// In-process [`Notifier`] over broadcast channels.
///
/// Potential changes are scoped to the database this notifier was created
/// for; data and connectivity notifications carry their database name.
#[derive(Debug)]
pub struct EventNotifier {
    db_name: String,
    potential: broadcast::Sender<()>,
    data: broadcast::Sender<DataChangeNotification>,
    connectivity: broadcast::Sender<ConnectivityStateChange>,
}

impl EventNotifier {
    /// Creates a notifier for `db_name`.
    pub fn new(db_name: impl Into<String>) -> Self {
        let (potential, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (data, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (connectivity, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            db_name: db_name.into(),
            potential,
            data,
            connectivity,
        }
    }

    /// Database this notifier belongs to.
    pub fn db_name(&self) -> &str {
        &self.db_name
    }
}

impl Notifier for EventNotifier {
    fn potentially_changed(&self) {
        // no subscribers is fine
        let _ = self.potential.send(());
    }

    fn actually_changed(&self, db_name: &str, changes: Vec<Change>) {
        let _ = self.data.send(DataChangeNotification {
            db_name: db_name.to_string(),
            changes,
        });
    }

    fn connectivity_state_change(&self, db_name: &str, state: ConnectivityState) {
        let _ = self.connectivity.send(ConnectivityStateChange {
            db_name: db_name.to_string(),
            state,
        });
    }

    fn subscribe_to_potential_data_changes(&self) -> broadcast::Receiver<()> {
        self.potential.subscribe()
    }

    fn subscribe_to_data_changes(&self) -> broadcast::Receiver<DataChangeNotification> {
        self.data.subscribe()
    }

    fn subscribe_to_connectivity_state_changes(
        &self,
    ) -> broadcast::Receiver<ConnectivityStateChange> {
        self.connectivity.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn data_changes_reach_subscribers() {
        let notifier = EventNotifier::new("app.db");
        let mut rx = notifier.subscribe_to_data_changes();

        notifier.actually_changed(
            "app.db",
            vec![Change {
                qualified_tablename: QualifiedTablename::new("main", "items"),
                rowids: Some(vec![1, 2]),
            }],
        );

        let notification = rx.recv().await.unwrap();
        assert_eq!(notification.db_name, "app.db");
        assert_eq!(notification.changes[0].rowids, Some(vec![1, 2]));
    }

    #[tokio::test]
    async fn connectivity_changes_carry_db_name() {
        let notifier = EventNotifier::new("app.db");
        let mut rx = notifier.subscribe_to_connectivity_state_changes();

        notifier.connectivity_state_change("app.db", ConnectivityState::Available);
        assert_eq!(
            rx.recv().await.unwrap(),
            ConnectivityStateChange {
                db_name: "app.db".into(),
                state: ConnectivityState::Available,
            }
        );
    }

    #[test]
    fn sending_without_subscribers_is_silent() {
        let notifier = EventNotifier::new("app.db");
        notifier.potentially_changed();
        notifier.connectivity_state_change("app.db", ConnectivityState::Error);
    }
}
