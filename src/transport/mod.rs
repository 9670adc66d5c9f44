//! The seam between the engine and the network.
//!
//! The physical connection, the session protocol and wire encoding all live
//! behind [`Transport`]. The engine only needs three capabilities:
//!
//! - `connect` opens the session and yields raw connection-state changes,
//! - `request` performs one request/response operation,
//! - `server_events` yields everything the server pushes, in arrival order.
//!
//! [`memory`] provides an in-process implementation backed by a shared
//! [`memory::MemoryServer`].

pub mod memory;

use crate::state::EntityKind;
use crate::subscriptions::Concerns;
use crate::types::{
    AreaCode, ChannelInfo, ChannelKey, LockDetail, LockEvent, LockSnapshot, Message,
    MessageType, MetadataItem, MetadataSnapshot, PresenceEvent, Scope, StorageEvent,
    StreamPriority, StreamQos, SubscribedUsers, TopicEvent, UserState,
};
use crossbeam_channel::Receiver;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

/// Everything the transport needs to open a session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    pub app_id: String,
    pub user_id: String,
    pub token: String,
    pub vendor_id: u32,
    pub area_code: AreaCode,
    pub presence_timeout: u32,
    pub log_file_path: Option<PathBuf>,
    pub parameters: serde_json::Map<String, serde_json::Value>,
}

/// Untyped connection-state notification as reported by the transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawStateChange {
    pub state: i32,
    pub reason: i32,
}

/// Failure classes a server (or the transport itself) can report.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerErrorKind {
    NotSubscribed,
    NotJoined,
    RevisionConflict { expected: i64, actual: i64 },
    NotFound,
    LockNotHeld,
    LockHeldByOther { owner: String },
    OwnerMismatch { expected: String, actual: String },
    /// No session: the request never reached the server.
    Disconnected,
    InvalidArgument,
    Other(i32),
}

#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind:?}: {message}")]
pub struct ServerError {
    pub kind: ServerErrorKind,
    pub message: String,
}

impl ServerError {
    pub fn new(kind: ServerErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Kind of metadata write.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataOp {
    Set,
    Update,
    Remove,
}

/// Full state of one entity scope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotPayload {
    Metadata(MetadataSnapshot),
    Locks(LockSnapshot),
    Presence(HashMap<String, UserState>),
    Topics(HashMap<String, Vec<String>>),
}

/// Snapshots returned by a subscribe or join, one per requested concern.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct InitialSnapshots {
    pub metadata: Option<MetadataSnapshot>,
    pub locks: Option<LockSnapshot>,
    pub presence: Option<HashMap<String, UserState>>,
    pub topics: Option<HashMap<String, Vec<String>>>,
}

/// Outbound operations.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "request", rename_all = "snake_case")]
pub enum Request {
    Logout,
    RenewToken {
        token: String,
    },
    SetParameters {
        parameters: serde_json::Map<String, serde_json::Value>,
    },

    // --- Message channels ---
    Publish {
        channel: String,
        payload: Vec<u8>,
        message_type: MessageType,
        custom_type: Option<String>,
    },
    Subscribe {
        channel: String,
        concerns: Concerns,
        /// Cached presence state, carried with the handshake.
        state: HashMap<String, String>,
    },
    Unsubscribe {
        channel: String,
    },

    // --- Stream channels ---
    JoinStream {
        channel: String,
        token: Option<String>,
        concerns: Concerns,
        state: HashMap<String, String>,
    },
    LeaveStream {
        channel: String,
    },
    RenewStreamToken {
        channel: String,
        token: String,
    },
    JoinTopic {
        channel: String,
        topic: String,
        qos: StreamQos,
        priority: StreamPriority,
        meta: Option<String>,
        sync_media: bool,
    },
    LeaveTopic {
        channel: String,
        topic: String,
    },
    PublishTopic {
        channel: String,
        topic: String,
        payload: Vec<u8>,
        message_type: MessageType,
        custom_type: Option<String>,
        qos: StreamQos,
        priority: StreamPriority,
        send_ts: u64,
    },
    SubscribeTopic {
        channel: String,
        topic: String,
        users: SubscribedUsers,
    },
    UnsubscribeTopic {
        channel: String,
        topic: String,
        /// Empty means every user.
        users: Vec<String>,
    },

    // --- Snapshots ---
    FetchSnapshot {
        scope: Scope,
        kind: EntityKind,
    },

    // --- Storage ---
    WriteMetadata {
        scope: Scope,
        op: MetadataOp,
        items: Vec<MetadataItem>,
        major_rev: Option<i64>,
        lock: Option<String>,
        record_ts: bool,
        record_author: bool,
    },
    GetMetadata {
        scope: Scope,
    },
    SubscribeUserMetadata {
        user_id: String,
    },
    UnsubscribeUserMetadata {
        user_id: String,
    },

    // --- Locks ---
    SetLock {
        channel: ChannelKey,
        name: String,
        ttl: u32,
    },
    GetLocks {
        channel: ChannelKey,
    },
    RemoveLock {
        channel: ChannelKey,
        name: String,
    },
    AcquireLock {
        channel: ChannelKey,
        name: String,
    },
    ReleaseLock {
        channel: ChannelKey,
        name: String,
    },
    RevokeLock {
        channel: ChannelKey,
        name: String,
        owner: String,
    },
    /// Forward events of one lock even without a lock subscription.
    WatchLock {
        channel: ChannelKey,
        name: String,
    },
    UnwatchLock {
        channel: ChannelKey,
        name: String,
    },

    // --- Presence ---
    WhoNow {
        channel: ChannelKey,
        include_user_id: bool,
        include_state: bool,
        page: Option<String>,
    },
    WhereNow {
        user_id: String,
    },
    SetState {
        channel: ChannelKey,
        state: HashMap<String, String>,
    },
    RemoveState {
        channel: ChannelKey,
        keys: Vec<String>,
    },
    GetState {
        channel: ChannelKey,
        user_id: String,
    },
}

/// Successful replies.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Ok,
    Subscribed { snapshots: InitialSnapshots },
    Snapshot { payload: SnapshotPayload },
    /// The applied metadata write, as it will be broadcast.
    MetadataWritten { event: StorageEvent },
    Metadata { snapshot: MetadataSnapshot },
    Locks { locks: HashMap<String, LockDetail> },
    /// The applied lock change, as it will be broadcast.
    LockChanged { event: LockEvent },
    Users {
        users: HashMap<String, UserState>,
        next_page: Option<String>,
    },
    Channels { channels: Vec<ChannelInfo> },
    State { state: HashMap<String, String> },
}

/// Everything the server pushes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Message {
        channel: String,
        message: Message,
    },
    TopicMessage {
        channel: String,
        topic: String,
        message: Message,
    },
    Storage {
        scope: Scope,
        event: StorageEvent,
    },
    Lock {
        channel: ChannelKey,
        event: LockEvent,
    },
    Presence {
        channel: ChannelKey,
        event: PresenceEvent,
    },
    Topic {
        channel: String,
        event: TopicEvent,
    },
    Notice {
        channel: String,
        notice: String,
    },
}

/// The external connection capability.
pub trait Transport: Send + Sync {
    /// Open a session. State changes arrive on the returned receiver.
    fn connect(&self, credentials: &Credentials) -> Result<Receiver<RawStateChange>, ServerError>;

    /// Perform one operation.
    fn request(&self, request: Request) -> Result<Response, ServerError>;

    /// The ordered feed of pushed events.
    fn server_events(&self) -> Receiver<ServerEvent>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_write_request_keeps_its_op() {
        let request = Request::WriteMetadata {
            scope: Scope::Channel(ChannelKey::message("room")),
            op: MetadataOp::Update,
            items: vec![MetadataItem::new("k", "v")],
            major_rev: Some(3),
            lock: None,
            record_ts: false,
            record_author: true,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["request"], "write_metadata");
        assert_eq!(json["op"], "update");
        let decoded: Request = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, request);
    }
}
