//! # RTM Sync
//!
//! Client-side subscription and synchronization engine for realtime
//! messaging. One logged-in session multiplexes message channels, stream
//! channels and their topics, and keeps local copies of the server-owned
//! state those channels carry.
//!
//! ## Core Concepts
//!
//! - **Storage**: Revisioned key/value metadata per channel or user
//! - **Locks**: Named, TTL-bound, exclusively owned locks per channel
//! - **Presence**: Who is in a channel, and their per-channel state
//! - **Topics**: Publisher membership inside stream channels
//! - **Resync**: Snapshots go stale on disconnect and are refetched on reconnect
//!
//! Every synchronized stream opens with a snapshot event, then carries only
//! deltas the snapshot does not already reflect.
//!
//! ## Example
//!
//! ```ignore
//! use rtm_sync::{
//!     ChannelType, MemoryServer, MessageOptions, PublishOptions, RtmClient, RtmConfig,
//! };
//! use std::sync::Arc;
//!
//! let server = MemoryServer::new();
//! let client = RtmClient::new(RtmConfig::new("app", "alice"), Arc::new(server.transport()))?;
//! client.login("token")?;
//!
//! let messages = client.subscribe("room", MessageOptions::default().with_metadata(true))?;
//! client.publish("room", "hello", PublishOptions::default())?;
//!
//! let (snapshot, events) = client
//!     .storage()
//!     .channel_metadata_events("room", ChannelType::Message)?;
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod gateway;
pub mod lock;
pub mod options;
pub mod presence;
pub mod state;
pub mod storage;
pub mod stream;
pub mod subscriptions;
pub mod transport;
pub mod types;

// Re-exports
pub use client::RtmClient;
pub use config::RtmConfig;
pub use connection::Transition;
pub use error::{Result, RtmError};
pub use gateway::{Delivery, DropReason, EventStream, OverflowPolicy};
pub use lock::{AcquireHandle, RtmLock};
pub use options::{
    JoinOptions, MessageOptions, PresenceOptions, PublishOptions, StorageOptions, TopicOptions,
    TopicPublishOptions,
};
pub use presence::{OnlineUsers, RtmPresence};
pub use state::{EntityKind, SyncEngine};
pub use storage::RtmStorage;
pub use stream::{StreamChannel, StreamJoin};
pub use subscriptions::{Concern, Concerns};
pub use transport::memory::{MemoryServer, MemoryTransport};
pub use transport::{ServerError, ServerErrorKind, Transport};
pub use types::*;
