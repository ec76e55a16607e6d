//! # Satellite Engine
//!
//! Replication client and process for Satellite local-first sync.
//!
//! This crate provides:
//! - The [`DatabaseAdapter`] seam and a rusqlite-backed [`SqliteAdapter`]
//! - Bundled migrations creating the oplog, meta and trigger settings tables
//! - The wire-protocol [`SatelliteClient`] with request timeouts
//! - The [`SatelliteProcess`] that snapshots, sends, acknowledges and applies
//! - Foreign key compensation for concurrent deletes
//! - A [`ProcessRegistry`] keeping one process per database
//!
//! ## Architecture
//!
//! Application code writes to the local database; triggers capture every
//! write into the oplog. The process periodically stamps pending oplog
//! entries (a snapshot), hands them to the client as transactions, and
//! prunes them once the server acknowledges. Remote transactions are merged
//! with not-yet-acknowledged local changes column by column and applied with
//! change capture switched off.
//!
//! ## Key Invariants
//!
//! - Snapshot, acknowledgement and apply never run concurrently
//! - Applied remote changes never re-enter the oplog
//! - A row survives a merge unless both sides deleted it
//! - At most one client request is outstanding at a time

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod adapter;
mod applier;
mod client;
mod config;
mod error;
mod meta;
mod migrator;
mod notifier;
mod oplog_table;
mod process;
mod registry;
mod schema;
mod socket;
mod sqlite;
mod throttle;
mod transport;

pub use adapter::{DatabaseAdapter, Executor, NotifyingAdapter, Statement};
pub use client::{SatelliteClient, PROTOCOL_VERSION};
pub use config::{
    AuthConfig, ClientOptions, RetryConfig, SatelliteOpts, DEFAULT_META_TABLE,
    DEFAULT_MIGRATIONS_TABLE, DEFAULT_OPLOG_TABLE, DEFAULT_TRIGGER_SETTINGS_TABLE,
};
pub use error::{AdapterError, AdapterResult, SatelliteError, SatelliteResult};
pub use meta::{MetaKey, MetaState};
pub use migrator::{system_migration, BundleMigrator, Migration, Migrator, SYSTEM_MIGRATION};
pub use notifier::{
    Change, ConnectivityState, ConnectivityStateChange, DataChangeNotification, EventNotifier,
    Notifier,
};
pub use oplog_table::{entry_from_row, OplogTable};
pub use process::{Positions, ProcessState, ProcessStats, SatelliteProcess};
pub use registry::ProcessRegistry;
pub use schema::{ForeignKey, LocalSchema, SERVER_SCHEMA};
pub use socket::{BoxedSocket, SocketFactory, SocketStream, TcpSocketFactory};
pub use sqlite::SqliteAdapter;
pub use throttle::Throttle;
pub use transport::{
    AuthResponse, AuthState, Client, ClientEvent, ClientState, MockClient, ReplicationStatus,
    ServerInfo,
};
