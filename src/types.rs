//! Core types shared by the engine, the transport seam and callers.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Kind of channel an entity scope lives on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    Message,
    Stream,
}

impl ChannelType {
    pub fn code(self) -> i32 {
        match self {
            ChannelType::Message => 0,
            ChannelType::Stream => 1,
        }
    }
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelType::Message => write!(f, "message"),
            ChannelType::Stream => write!(f, "stream"),
        }
    }
}

/// A (channel name, channel type) pair. At most one subscription exists per key.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelKey {
    pub name: String,
    pub channel_type: ChannelType,
}

impl ChannelKey {
    pub fn new(name: impl Into<String>, channel_type: ChannelType) -> Self {
        Self {
            name: name.into(),
            channel_type,
        }
    }

    pub fn message(name: impl Into<String>) -> Self {
        Self::new(name, ChannelType::Message)
    }

    pub fn stream(name: impl Into<String>) -> Self {
        Self::new(name, ChannelType::Stream)
    }
}

impl fmt::Debug for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelKey({}:{})", self.channel_type, self.name)
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.channel_type, self.name)
    }
}

/// The entity a snapshot belongs to: a channel or a single user.
///
/// User scopes only carry metadata; locks, presence and topics are always
/// channel scoped.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Channel(ChannelKey),
    User(String),
}

impl Scope {
    pub fn channel(&self) -> Option<&ChannelKey> {
        match self {
            Scope::Channel(key) => Some(key),
            Scope::User(_) => None,
        }
    }
}

impl From<ChannelKey> for Scope {
    fn from(key: ChannelKey) -> Self {
        Scope::Channel(key)
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Channel(key) => write!(f, "{}", key),
            Scope::User(user) => write!(f, "user:{}", user),
        }
    }
}

/// Milliseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default();
        Timestamp(millis)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

// --- Connection ---

/// Lifecycle of the single multiplexed connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl ConnectionState {
    pub fn code(self) -> i32 {
        match self {
            ConnectionState::Disconnected => 1,
            ConnectionState::Connecting => 2,
            ConnectionState::Connected => 3,
            ConnectionState::Reconnecting => 4,
            ConnectionState::Failed => 5,
        }
    }

    /// Whether requests may be handed to the transport in this state.
    pub fn accepts_requests(self) -> bool {
        !matches!(
            self,
            ConnectionState::Disconnected | ConnectionState::Failed
        )
    }
}

impl TryFrom<i32> for ConnectionState {
    type Error = i32;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(ConnectionState::Disconnected),
            2 => Ok(ConnectionState::Connecting),
            3 => Ok(ConnectionState::Connected),
            4 => Ok(ConnectionState::Reconnecting),
            5 => Ok(ConnectionState::Failed),
            other => Err(other),
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Reconnecting => "RECONNECTING",
            ConnectionState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Why the connection state changed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionChangeReason {
    Connecting,
    JoinSuccess,
    Interrupted,
    BannedByServer,
    JoinFailed,
    LeaveChannel,
    InvalidAppId,
    InvalidChannelName,
    InvalidToken,
    TokenExpired,
    RejectedByServer,
    SettingProxyServer,
    RenewToken,
    ClientIpAddrChanged,
    KeepaliveTimeout,
    RejoinSuccess,
    Lost,
    EchoLost,
    ClientIpAddrChangedByUser,
    SameUidLogin,
    TooManyBroadcaster,
    StreamChannelNotAvailable,
    LoginSuccess,
    Unknown(i32),
}

impl ConnectionChangeReason {
    pub fn from_code(code: i32) -> Self {
        use ConnectionChangeReason::*;
        match code {
            0 => Connecting,
            1 => JoinSuccess,
            2 => Interrupted,
            3 => BannedByServer,
            4 => JoinFailed,
            5 => LeaveChannel,
            6 => InvalidAppId,
            7 => InvalidChannelName,
            8 => InvalidToken,
            9 => TokenExpired,
            10 => RejectedByServer,
            11 => SettingProxyServer,
            12 => RenewToken,
            13 => ClientIpAddrChanged,
            14 => KeepaliveTimeout,
            15 => RejoinSuccess,
            16 => Lost,
            17 => EchoLost,
            18 => ClientIpAddrChangedByUser,
            19 => SameUidLogin,
            20 => TooManyBroadcaster,
            22 => StreamChannelNotAvailable,
            10001 => LoginSuccess,
            other => Unknown(other),
        }
    }

    pub fn code(self) -> i32 {
        use ConnectionChangeReason::*;
        match self {
            Connecting => 0,
            JoinSuccess => 1,
            Interrupted => 2,
            BannedByServer => 3,
            JoinFailed => 4,
            LeaveChannel => 5,
            InvalidAppId => 6,
            InvalidChannelName => 7,
            InvalidToken => 8,
            TokenExpired => 9,
            RejectedByServer => 10,
            SettingProxyServer => 11,
            RenewToken => 12,
            ClientIpAddrChanged => 13,
            KeepaliveTimeout => 14,
            RejoinSuccess => 15,
            Lost => 16,
            EchoLost => 17,
            ClientIpAddrChangedByUser => 18,
            SameUidLogin => 19,
            TooManyBroadcaster => 20,
            StreamChannelNotAvailable => 22,
            LoginSuccess => 10001,
            Unknown(code) => code,
        }
    }
}

/// Notification delivered on the stream returned by `login`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionEvent {
    pub state: ConnectionState,
    pub reason: ConnectionChangeReason,
}

/// Region selector bitmask.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AreaCode(pub u32);

impl AreaCode {
    pub const CN: AreaCode = AreaCode(0x0000_0001);
    pub const NA: AreaCode = AreaCode(0x0000_0002);
    pub const EU: AreaCode = AreaCode(0x0000_0004);
    pub const AS: AreaCode = AreaCode(0x0000_0008);
    pub const JP: AreaCode = AreaCode(0x0000_0010);
    pub const IN: AreaCode = AreaCode(0x0000_0020);
    pub const OC: AreaCode = AreaCode(0x0000_0040);
    pub const SA: AreaCode = AreaCode(0x0000_0080);
    pub const AF: AreaCode = AreaCode(0x0000_0100);
    pub const KR: AreaCode = AreaCode(0x0000_0200);
    pub const HKMC: AreaCode = AreaCode(0x0000_0400);
    pub const US: AreaCode = AreaCode(0x0000_0800);
    /// Everywhere except mainland China.
    pub const OVS: AreaCode = AreaCode(0xFFFF_FFFE);
    pub const GLOB: AreaCode = AreaCode(0xFFFF_FFFF);

    pub fn contains(self, other: AreaCode) -> bool {
        self.0 & other.0 == other.0
    }
}

impl Default for AreaCode {
    fn default() -> Self {
        AreaCode::GLOB
    }
}

impl std::ops::BitOr for AreaCode {
    type Output = AreaCode;

    fn bitor(self, rhs: AreaCode) -> AreaCode {
        AreaCode(self.0 | rhs.0)
    }
}

// --- Messages ---

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    #[default]
    Binary,
    String,
}

/// A message received on a message channel or a stream topic.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub user_id: String,
    pub message_type: MessageType,
    pub payload: Vec<u8>,
    pub custom_type: Option<String>,
}

/// Delivery ordering for topic messages.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamQos {
    #[default]
    Unordered,
    Ordered,
}

/// Server-side delivery priority for topic messages. `Highest` preempts `Low`.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum StreamPriority {
    Highest,
    High,
    #[default]
    Normal,
    Low,
}

// --- Storage ---

/// One metadata entry in a channel or user metadata map.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataItem {
    pub key: String,
    pub value: String,
    /// Last writer, filled by the server when `record_author` was requested.
    pub author: String,
    pub revision: i64,
    pub update_ts: i64,
}

impl MetadataItem {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            ..Default::default()
        }
    }
}

/// A metadata map and its major revision.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataSnapshot {
    pub major_revision: i64,
    pub items: HashMap<String, MetadataItem>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageEventKind {
    Snapshot,
    Set,
    Update,
    Remove,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageEvent {
    pub kind: StorageEventKind,
    pub major_revision: i64,
    /// Affected items; the whole map for `Snapshot`.
    pub items: HashMap<String, MetadataItem>,
}

// --- Locks ---

/// A lock definition and its current owner.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockDetail {
    pub name: String,
    /// Empty when nobody holds the lock.
    pub owner: String,
    /// Seconds the lock survives its owner going away.
    pub ttl: u32,
}

impl LockDetail {
    pub fn is_held(&self) -> bool {
        !self.owner.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockEventKind {
    /// Full lock set; emitted on subscribe and after reconnecting.
    Snapshot,
    Set,
    Removed,
    Acquired,
    Released,
    Expired,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockEvent {
    pub kind: LockEventKind,
    /// Lock revision of the channel after this change. Every lock change in
    /// a channel bumps it by one.
    pub revision: i64,
    pub details: Vec<LockDetail>,
}

/// All lock definitions of one channel at a lock revision.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockSnapshot {
    pub revision: i64,
    pub locks: HashMap<String, LockDetail>,
}

// --- Presence ---

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserState {
    pub user_id: String,
    pub state: HashMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub channel: String,
    pub channel_type: ChannelType,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PresenceEvent {
    /// Everyone present, with their states.
    Snapshot {
        states: HashMap<String, HashMap<String, String>>,
    },
    /// Batched changes, sent instead of individual events in crowded channels.
    Interval {
        joined: Vec<String>,
        left: Vec<String>,
        timeout: Vec<String>,
        states: HashMap<String, HashMap<String, String>>,
    },
    Join {
        user_id: String,
        state: HashMap<String, String>,
    },
    Leave {
        user_id: String,
    },
    Timeout {
        user_id: String,
    },
    StateChanged {
        user_id: String,
        state: HashMap<String, String>,
    },
    /// Presence is temporarily unavailable for the channel.
    OutOfService,
}

// --- Topics ---

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TopicEvent {
    Snapshot {
        channel: String,
        /// topic -> publishers currently joined to it.
        topics: HashMap<String, Vec<String>>,
    },
    Join {
        channel: String,
        topic: String,
        user_id: String,
    },
    Leave {
        channel: String,
        topic: String,
        user_id: String,
    },
}

/// Topic -> joined publisher ids, kept sorted for stable snapshots.
pub type TopicGraph = HashMap<String, BTreeSet<String>>;

/// Publishers a topic subscription listens to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscribedUsers {
    /// Every current and future publisher on the topic.
    All,
    Users(BTreeSet<String>),
}

impl SubscribedUsers {
    pub fn includes(&self, user_id: &str) -> bool {
        match self {
            SubscribedUsers::All => true,
            SubscribedUsers::Users(users) => users.contains(user_id),
        }
    }
}
