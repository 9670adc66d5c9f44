//! Per-call option structs.
//!
//! Each struct documents its defaults and offers chained `with_*` setters:
//!
//! ```ignore
//! let opts = MessageOptions::default().with_metadata(true).with_lock(true);
//! let messages = client.subscribe("room", opts)?;
//! ```

use crate::error::{Result, RtmError};
use crate::types::{MessageType, StreamPriority, StreamQos};

/// Longest accepted custom message type, in bytes.
pub const MAX_CUSTOM_TYPE_LEN: usize = 32;

pub(crate) fn validate_custom_type(custom_type: Option<&str>) -> Result<()> {
    match custom_type {
        Some(t) if t.len() > MAX_CUSTOM_TYPE_LEN => Err(RtmError::InvalidArgument(format!(
            "custom type is {} bytes, limit is {}",
            t.len(),
            MAX_CUSTOM_TYPE_LEN
        ))),
        _ => Ok(()),
    }
}

/// Options for subscribing to a message channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageOptions {
    /// Receive published messages. Default: true
    pub message: bool,
    /// Subscribe to channel metadata. Default: false
    pub metadata: bool,
    /// Subscribe to presence. Default: true
    pub presence: bool,
    /// Subscribe to locks. Default: false
    pub lock: bool,
}

impl Default for MessageOptions {
    fn default() -> Self {
        Self {
            message: true,
            metadata: false,
            presence: true,
            lock: false,
        }
    }
}

impl MessageOptions {
    pub fn with_message(mut self, enabled: bool) -> Self {
        self.message = enabled;
        self
    }

    pub fn with_metadata(mut self, enabled: bool) -> Self {
        self.metadata = enabled;
        self
    }

    pub fn with_presence(mut self, enabled: bool) -> Self {
        self.presence = enabled;
        self
    }

    pub fn with_lock(mut self, enabled: bool) -> Self {
        self.lock = enabled;
        self
    }
}

/// Options for publishing to a message channel.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PublishOptions {
    /// Default: `MessageType::Binary`
    pub message_type: MessageType,
    /// Up to 32 bytes. Default: none
    pub custom_type: Option<String>,
}

impl PublishOptions {
    pub fn with_message_type(mut self, message_type: MessageType) -> Self {
        self.message_type = message_type;
        self
    }

    pub fn with_custom_type(mut self, custom_type: impl Into<String>) -> Self {
        self.custom_type = Some(custom_type.into());
        self
    }
}

/// Preconditions and recording flags for metadata writes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StorageOptions {
    /// Only apply if the map's major revision equals this. Default: no check
    pub major_rev: Option<i64>,
    /// Only apply if this lock (same channel) is held by the caller. Default: none
    pub lock: Option<String>,
    /// Stamp items with the update time. Default: false
    pub record_ts: bool,
    /// Stamp items with the writer's user id. Default: false
    pub record_author: bool,
}

impl StorageOptions {
    pub fn with_major_rev(mut self, rev: i64) -> Self {
        self.major_rev = Some(rev);
        self
    }

    pub fn with_lock(mut self, lock: impl Into<String>) -> Self {
        self.lock = Some(lock.into());
        self
    }

    pub fn with_record_ts(mut self, enabled: bool) -> Self {
        self.record_ts = enabled;
        self
    }

    pub fn with_record_author(mut self, enabled: bool) -> Self {
        self.record_author = enabled;
        self
    }
}

/// Options for paginated presence queries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PresenceOptions {
    /// Include user ids in the result. Default: true
    pub include_user_id: bool,
    /// Include each user's state. Default: false
    pub include_state: bool,
    /// Continuation token from a previous page. Default: first page
    pub page: Option<String>,
}

impl Default for PresenceOptions {
    fn default() -> Self {
        Self {
            include_user_id: true,
            include_state: false,
            page: None,
        }
    }
}

impl PresenceOptions {
    pub fn with_user_id(mut self, enabled: bool) -> Self {
        self.include_user_id = enabled;
        self
    }

    pub fn with_state(mut self, enabled: bool) -> Self {
        self.include_state = enabled;
        self
    }

    pub fn with_page(mut self, page: impl Into<String>) -> Self {
        self.page = Some(page.into());
        self
    }
}

/// Options for joining a stream channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JoinOptions {
    /// Channel-specific token. Default: the login token
    pub token: Option<String>,
    /// Subscribe to channel metadata. Default: false
    pub metadata: bool,
    /// Subscribe to presence. Default: true
    pub presence: bool,
    /// Subscribe to locks. Default: false
    pub lock: bool,
}

impl Default for JoinOptions {
    fn default() -> Self {
        Self {
            token: None,
            metadata: false,
            presence: true,
            lock: false,
        }
    }
}

impl JoinOptions {
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_metadata(mut self, enabled: bool) -> Self {
        self.metadata = enabled;
        self
    }

    pub fn with_presence(mut self, enabled: bool) -> Self {
        self.presence = enabled;
        self
    }

    pub fn with_lock(mut self, enabled: bool) -> Self {
        self.lock = enabled;
        self
    }
}

/// Publisher configuration for a joined topic.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TopicOptions {
    /// Default: `StreamQos::Unordered`
    pub qos: StreamQos,
    /// Default: `StreamPriority::Normal`
    pub priority: StreamPriority,
    /// Free-form topic meta. Default: none
    pub meta: Option<String>,
    /// Align messages with a parallel media stream via `send_ts`. Default: false
    pub sync_media: bool,
}

impl TopicOptions {
    pub fn with_qos(mut self, qos: StreamQos) -> Self {
        self.qos = qos;
        self
    }

    pub fn with_priority(mut self, priority: StreamPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_meta(mut self, meta: impl Into<String>) -> Self {
        self.meta = Some(meta.into());
        self
    }

    pub fn with_sync_media(mut self, enabled: bool) -> Self {
        self.sync_media = enabled;
        self
    }
}

/// Options for publishing to a joined topic.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TopicPublishOptions {
    /// Default: `MessageType::Binary`
    pub message_type: MessageType,
    /// Media timestamp; only honoured on topics joined with `sync_media`. Default: 0
    pub send_ts: u64,
    /// Up to 32 bytes. Default: none
    pub custom_type: Option<String>,
}

impl TopicPublishOptions {
    pub fn with_message_type(mut self, message_type: MessageType) -> Self {
        self.message_type = message_type;
        self
    }

    pub fn with_send_ts(mut self, ts: u64) -> Self {
        self.send_ts = ts;
        self
    }

    pub fn with_custom_type(mut self, custom_type: impl Into<String>) -> Self {
        self.custom_type = Some(custom_type.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_option_defaults() {
        let opts = MessageOptions::default();
        assert!(opts.message);
        assert!(opts.presence);
        assert!(!opts.metadata);
        assert!(!opts.lock);
        assert_eq!(PublishOptions::default().message_type, MessageType::Binary);
    }

    #[test]
    fn test_builders_chain() {
        let opts = StorageOptions::default()
            .with_major_rev(4)
            .with_lock("editor")
            .with_record_author(true);
        assert_eq!(opts.major_rev, Some(4));
        assert_eq!(opts.lock.as_deref(), Some("editor"));
        assert!(opts.record_author);
        assert!(!opts.record_ts);
    }

    #[test]
    fn test_custom_type_limit() {
        assert!(validate_custom_type(None).is_ok());
        assert!(validate_custom_type(Some(&"x".repeat(32))).is_ok());
        assert!(matches!(
            validate_custom_type(Some(&"x".repeat(33))),
            Err(RtmError::InvalidArgument(_))
        ));
    }
}
