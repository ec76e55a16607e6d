//! # Satellite Protocol
//!
//! Wire protocol and oplog model for Satellite replication.
//!
//! This crate provides:
//! - `OplogEntry` and the per-column change model
//! - Last-write-wins column merge and add-wins operation merge
//! - The protobuf message catalog and `SatMessage` tagged union
//! - Length-prefixed framing with a streaming decoder
//! - Row encoding with null bitmasks
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod convert;
mod error;
mod frame;
pub mod merge;
pub mod messages;
pub mod oplog;
mod types;

pub use convert::{
    deserialize_row, relation_from_message, relation_to_message, serialize_row,
    transaction_to_oplog,
};
pub use error::{ProtocolError, ProtocolResult};
pub use frame::{decode_frame, encode_frame, FrameDecoder, DEFAULT_MAX_FRAME_SIZE, HEADER_SIZE};
pub use merge::{merge_changes_last_write_wins, merge_entries, merge_op_types_add_wins};
pub use messages::{SatMessage, SatMsgType};
pub use oplog::{
    entry_to_changes, from_transaction, last_known_rows, operations_to_table_changes,
    primary_key_to_str, to_transactions, ChangesOpType, OpType, OplogColumnChange,
    OplogColumnChanges, OplogEntry, OplogEntryChanges, OplogTableChanges,
};
pub use types::{
    lsn_to_rowid, quote_identifier, row, rowid_to_lsn, Change, ChangeType, Lsn,
    QualifiedTablename, Relation, RelationColumn, RelationsCache, Row, SqlValue, TableType,
    Transaction,
};
