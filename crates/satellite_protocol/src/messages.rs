//! Satellite message catalog.
//!
//! Protobuf payloads are plain `prost` messages. [`SatMessage`] is the closed
//! set of messages that may appear in a frame, keyed by a one-byte type tag.

#![allow(clippy::derive_partial_eq_without_eq)]

use crate::error::{ProtocolError, ProtocolResult};
use prost::Message;

/// Error returned by the server in place of a response.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SatErrorResp {
    /// Kind of failure.
    #[prost(enumeration = "sat_error_resp::ErrorCode", tag = "1")]
    pub error_type: i32,
}

/// Nested types of [`SatErrorResp`].
pub mod sat_error_resp {
    /// Server error categories.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum ErrorCode {
        /// Unclassified server failure.
        Internal = 0,
        /// Request needs an authenticated session.
        AuthRequired = 1,
        /// Credentials were rejected.
        AuthFailed = 2,
        /// Replication could not proceed.
        ReplicationFailed = 3,
    }
}

/// Extra authentication header.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SatAuthHeaderPair {
    /// Header key.
    #[prost(enumeration = "sat_auth_header_pair::HeaderKey", tag = "1")]
    pub key: i32,
    /// Header value.
    #[prost(string, tag = "2")]
    pub value: String,
}

/// Nested types of [`SatAuthHeaderPair`].
pub mod sat_auth_header_pair {
    /// Known authentication header keys.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum HeaderKey {
        /// Unset.
        Undefined = 0,
        /// Protocol version offered by the client.
        ProtoVersion = 1,
    }
}

/// Authentication request.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SatAuthReq {
    /// Client identifier.
    #[prost(string, tag = "1")]
    pub id: String,
    /// Access token.
    #[prost(string, tag = "2")]
    pub token: String,
    /// Additional headers.
    #[prost(message, repeated, tag = "3")]
    pub headers: Vec<SatAuthHeaderPair>,
}

/// Authentication response.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SatAuthResp {
    /// Server identifier.
    #[prost(string, tag = "1")]
    pub id: String,
}

/// Server information request.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SatGetServerInfoReq {}

/// Server information response.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SatGetServerInfoResp {
    /// Server version string.
    #[prost(string, tag = "1")]
    pub server_version: String,
    /// Node name.
    #[prost(string, tag = "2")]
    pub node: String,
}

/// Liveness probe.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SatPingReq {}

/// Ping answer, optionally carrying the latest acknowledged position.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SatPingResp {
    /// Latest applied LSN.
    #[prost(bytes = "vec", optional, tag = "1")]
    pub lsn: Option<Vec<u8>>,
}

/// Request to start streaming transactions to the sender.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SatInStartReplicationReq {
    /// Position to resume from.
    #[prost(bytes = "vec", tag = "1")]
    pub lsn: Vec<u8>,
    /// Replication flags.
    #[prost(enumeration = "sat_in_start_replication_req::ReplicationOption", repeated, tag = "2")]
    pub options: Vec<i32>,
    /// Transactions per batch in sync mode.
    #[prost(int32, tag = "3")]
    pub sync_batch_size: i32,
}

/// Nested types of [`SatInStartReplicationReq`].
pub mod sat_in_start_replication_req {
    /// Start-replication flags.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum ReplicationOption {
        /// No flag.
        None = 0,
        /// Resume after the last acknowledged position, ignoring `lsn`.
        LastAcknowledged = 1,
        /// Consumer acknowledges every batch with a ping response.
        SyncMode = 2,
    }
}

/// Start-replication acknowledgement.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SatInStartReplicationResp {}

/// Request to stop streaming.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SatInStopReplicationReq {}

/// Stop-replication acknowledgement.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SatInStopReplicationResp {}

/// Column of a [`SatRelation`].
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SatRelationColumn {
    /// Column name.
    #[prost(string, tag = "1")]
    pub name: String,
    /// Declared type.
    #[prost(string, tag = "2")]
    pub r#type: String,
    /// Primary-key membership.
    #[prost(bool, tag = "3")]
    pub primary_key: bool,
}

/// Table schema announcement.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SatRelation {
    /// Schema name.
    #[prost(string, tag = "1")]
    pub schema_name: String,
    /// Relation kind.
    #[prost(enumeration = "sat_relation::RelationType", tag = "2")]
    pub table_type: i32,
    /// Table name.
    #[prost(string, tag = "3")]
    pub table_name: String,
    /// Session-scoped relation id.
    #[prost(uint32, tag = "4")]
    pub relation_id: u32,
    /// Columns in declaration order.
    #[prost(message, repeated, tag = "5")]
    pub columns: Vec<SatRelationColumn>,
}

/// Nested types of [`SatRelation`].
pub mod sat_relation {
    /// Relation kinds.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum RelationType {
        /// Table.
        Table = 0,
        /// Index.
        Index = 1,
        /// View.
        View = 2,
        /// Trigger.
        Trigger = 3,
    }
}

/// Row payload: values as UTF-8 text plus a null bitmask.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SatOpRow {
    /// Bit `7 - i % 8` of byte `i / 8` marks column `i` as null.
    #[prost(bytes = "vec", tag = "1")]
    pub nulls_bitmask: Vec<u8>,
    /// One entry per relation column.
    #[prost(bytes = "vec", repeated, tag = "2")]
    pub values: Vec<Vec<u8>>,
}

/// Transaction start marker.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SatOpBegin {
    /// Commit time, ms since the epoch.
    #[prost(uint64, tag = "1")]
    pub commit_timestamp: u64,
    /// Transaction identifier.
    #[prost(string, tag = "2")]
    pub trans_id: String,
    /// Transaction position.
    #[prost(bytes = "vec", tag = "3")]
    pub lsn: Vec<u8>,
}

/// Transaction end marker.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SatOpCommit {
    /// Commit time, ms since the epoch.
    #[prost(uint64, tag = "1")]
    pub commit_timestamp: u64,
    /// Transaction identifier.
    #[prost(string, tag = "2")]
    pub trans_id: String,
    /// Transaction position.
    #[prost(bytes = "vec", tag = "3")]
    pub lsn: Vec<u8>,
}

/// Row insert.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SatOpInsert {
    /// Relation of the row.
    #[prost(uint32, tag = "1")]
    pub relation_id: u32,
    /// New row.
    #[prost(message, optional, tag = "2")]
    pub row_data: Option<SatOpRow>,
}

/// Row update.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SatOpUpdate {
    /// Relation of the row.
    #[prost(uint32, tag = "1")]
    pub relation_id: u32,
    /// New row.
    #[prost(message, optional, tag = "2")]
    pub row_data: Option<SatOpRow>,
    /// Previous row.
    #[prost(message, optional, tag = "3")]
    pub old_row_data: Option<SatOpRow>,
}

/// Row delete.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SatOpDelete {
    /// Relation of the row.
    #[prost(uint32, tag = "1")]
    pub relation_id: u32,
    /// Deleted row.
    #[prost(message, optional, tag = "2")]
    pub old_row_data: Option<SatOpRow>,
}

/// One operation of the streamed log.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SatTransOp {
    /// The operation.
    #[prost(oneof = "sat_trans_op::Op", tags = "1, 2, 3, 4, 5")]
    pub op: Option<sat_trans_op::Op>,
}

/// Nested types of [`SatTransOp`].
pub mod sat_trans_op {
    /// Operation variants.
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Op {
        /// Transaction start.
        #[prost(message, tag = "1")]
        Begin(super::SatOpBegin),
        /// Transaction end.
        #[prost(message, tag = "2")]
        Commit(super::SatOpCommit),
        /// Row update.
        #[prost(message, tag = "3")]
        Update(super::SatOpUpdate),
        /// Row insert.
        #[prost(message, tag = "4")]
        Insert(super::SatOpInsert),
        /// Row delete.
        #[prost(message, tag = "5")]
        Delete(super::SatOpDelete),
    }
}

/// A chunk of the streamed operation log.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SatOpLog {
    /// Operations in log order.
    #[prost(message, repeated, tag = "1")]
    pub ops: Vec<SatTransOp>,
}

/// Wire tag of each message in the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SatMsgType {
    /// [`SatErrorResp`].
    ErrorResp = 0,
    /// [`SatAuthReq`].
    AuthReq = 1,
    /// [`SatAuthResp`].
    AuthResp = 2,
    /// [`SatPingReq`].
    PingReq = 3,
    /// [`SatPingResp`].
    PingResp = 4,
    /// [`SatInStartReplicationReq`].
    StartReplicationReq = 5,
    /// [`SatInStartReplicationResp`].
    StartReplicationResp = 6,
    /// [`SatInStopReplicationReq`].
    StopReplicationReq = 7,
    /// [`SatInStopReplicationResp`].
    StopReplicationResp = 8,
    /// [`SatOpLog`].
    OpLog = 9,
    /// [`SatRelation`].
    Relation = 10,
    /// [`SatGetServerInfoReq`].
    GetServerInfoReq = 11,
    /// [`SatGetServerInfoResp`].
    GetServerInfoResp = 12,
}

impl SatMsgType {
    /// Converts to the wire tag.
    pub fn to_code(self) -> u8 {
        self as u8
    }

    /// Parses a wire tag.
    pub fn from_code(code: u8) -> ProtocolResult<Self> {
        Ok(match code {
            0 => Self::ErrorResp,
            1 => Self::AuthReq,
            2 => Self::AuthResp,
            3 => Self::PingReq,
            4 => Self::PingResp,
            5 => Self::StartReplicationReq,
            6 => Self::StartReplicationResp,
            7 => Self::StopReplicationReq,
            8 => Self::StopReplicationResp,
            9 => Self::OpLog,
            10 => Self::Relation,
            11 => Self::GetServerInfoReq,
            12 => Self::GetServerInfoResp,
            other => return Err(ProtocolError::UnexpectedMessageType(other)),
        })
    }

    /// Message name, for logs and errors.
    pub fn name(self) -> &'static str {
        match self {
            Self::ErrorResp => "SatErrorResp",
            Self::AuthReq => "SatAuthReq",
            Self::AuthResp => "SatAuthResp",
            Self::PingReq => "SatPingReq",
            Self::PingResp => "SatPingResp",
            Self::StartReplicationReq => "SatInStartReplicationReq",
            Self::StartReplicationResp => "SatInStartReplicationResp",
            Self::StopReplicationReq => "SatInStopReplicationReq",
            Self::StopReplicationResp => "SatInStopReplicationResp",
            Self::OpLog => "SatOpLog",
            Self::Relation => "SatRelation",
            Self::GetServerInfoReq => "SatGetServerInfoReq",
            Self::GetServerInfoResp => "SatGetServerInfoResp",
        }
    }
}

/// Any message that can travel in a frame.
#[derive(Debug, Clone, PartialEq)]
pub enum SatMessage {
    /// Server error.
    ErrorResp(SatErrorResp),
    /// Authentication request.
    AuthReq(SatAuthReq),
    /// Authentication response.
    AuthResp(SatAuthResp),
    /// Ping.
    PingReq(SatPingReq),
    /// Ping answer.
    PingResp(SatPingResp),
    /// Start replication.
    StartReplicationReq(SatInStartReplicationReq),
    /// Start acknowledgement.
    StartReplicationResp(SatInStartReplicationResp),
    /// Stop replication.
    StopReplicationReq(SatInStopReplicationReq),
    /// Stop acknowledgement.
    StopReplicationResp(SatInStopReplicationResp),
    /// Operation log chunk.
    OpLog(SatOpLog),
    /// Relation announcement.
    Relation(SatRelation),
    /// Server info request.
    GetServerInfoReq(SatGetServerInfoReq),
    /// Server info response.
    GetServerInfoResp(SatGetServerInfoResp),
}

impl SatMessage {
    /// Wire tag of this message.
    pub fn msg_type(&self) -> SatMsgType {
        match self {
            SatMessage::ErrorResp(_) => SatMsgType::ErrorResp,
            SatMessage::AuthReq(_) => SatMsgType::AuthReq,
            SatMessage::AuthResp(_) => SatMsgType::AuthResp,
            SatMessage::PingReq(_) => SatMsgType::PingReq,
            SatMessage::PingResp(_) => SatMsgType::PingResp,
            SatMessage::StartReplicationReq(_) => SatMsgType::StartReplicationReq,
            SatMessage::StartReplicationResp(_) => SatMsgType::StartReplicationResp,
            SatMessage::StopReplicationReq(_) => SatMsgType::StopReplicationReq,
            SatMessage::StopReplicationResp(_) => SatMsgType::StopReplicationResp,
            SatMessage::OpLog(_) => SatMsgType::OpLog,
            SatMessage::Relation(_) => SatMsgType::Relation,
            SatMessage::GetServerInfoReq(_) => SatMsgType::GetServerInfoReq,
            SatMessage::GetServerInfoResp(_) => SatMsgType::GetServerInfoResp,
        }
    }

    /// Encodes the protobuf payload (without framing).
    pub fn encode_payload(&self) -> Vec<u8> {
        match self {
            SatMessage::ErrorResp(m) => m.encode_to_vec(),
            SatMessage::AuthReq(m) => m.encode_to_vec(),
            SatMessage::AuthResp(m) => m.encode_to_vec(),
            SatMessage::PingReq(m) => m.encode_to_vec(),
            SatMessage::PingResp(m) => m.encode_to_vec(),
            SatMessage::StartReplicationReq(m) => m.encode_to_vec(),
            SatMessage::StartReplicationResp(m) => m.encode_to_vec(),
            SatMessage::StopReplicationReq(m) => m.encode_to_vec(),
            SatMessage::StopReplicationResp(m) => m.encode_to_vec(),
            SatMessage::OpLog(m) => m.encode_to_vec(),
            SatMessage::Relation(m) => m.encode_to_vec(),
            SatMessage::GetServerInfoReq(m) => m.encode_to_vec(),
            SatMessage::GetServerInfoResp(m) => m.encode_to_vec(),
        }
    }

    /// Decodes a payload of the given type.
    pub fn decode(msg_type: SatMsgType, payload: &[u8]) -> ProtocolResult<Self> {
        fn parse<M: Message + Default>(msg_type: SatMsgType, payload: &[u8]) -> ProtocolResult<M> {
            M::decode(payload).map_err(|e| ProtocolError::decode(msg_type.name(), e))
        }

        Ok(match msg_type {
            SatMsgType::ErrorResp => SatMessage::ErrorResp(parse(msg_type, payload)?),
            SatMsgType::AuthReq => SatMessage::AuthReq(parse(msg_type, payload)?),
            SatMsgType::AuthResp => SatMessage::AuthResp(parse(msg_type, payload)?),
            SatMsgType::PingReq => SatMessage::PingReq(parse(msg_type, payload)?),
            SatMsgType::PingResp => SatMessage::PingResp(parse(msg_type, payload)?),
            SatMsgType::StartReplicationReq => {
                SatMessage::StartReplicationReq(parse(msg_type, payload)?)
            }
            SatMsgType::StartReplicationResp => {
                SatMessage::StartReplicationResp(parse(msg_type, payload)?)
            }
            SatMsgType::StopReplicationReq => {
                SatMessage::StopReplicationReq(parse(msg_type, payload)?)
            }
            SatMsgType::StopReplicationResp => {
                SatMessage::StopReplicationResp(parse(msg_type, payload)?)
            }
            SatMsgType::OpLog => SatMessage::OpLog(parse(msg_type, payload)?),
            SatMsgType::Relation => SatMessage::Relation(parse(msg_type, payload)?),
            SatMsgType::GetServerInfoReq => SatMessage::GetServerInfoReq(parse(msg_type, payload)?),
            SatMsgType::GetServerInfoResp => {
                SatMessage::GetServerInfoResp(parse(msg_type, payload)?)
            }
        })
    }
}
