//! Client configuration.

use crate::error::{Result, RtmError};
use crate::gateway::OverflowPolicy;
use crate::types::AreaCode;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Longest accepted app id.
const MAX_APP_ID_LEN: usize = 64;

/// Longest accepted user id, in bytes.
const MAX_USER_ID_LEN: usize = 64;

/// Client configuration.
///
/// Only `app_id` and `user_id` are required; everything else has a default.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RtmConfig {
    /// App identity.
    pub app_id: String,

    /// Identity of this user.
    pub user_id: String,

    /// Vendor id. Default: 0
    pub vendor_id: u32,

    /// Region the transport may connect to. Default: `AreaCode::GLOB`
    pub area_code: AreaCode,

    /// Seconds the server keeps presence after a disconnect. Default: 0
    pub presence_timeout: u32,

    /// Native log file, forwarded to the transport. Default: disabled
    pub log_file_path: Option<PathBuf>,

    /// Capacity of each consumer-facing event stream.
    /// Default: 1024
    pub event_buffer: usize,

    /// What happens when a consumer stops draining a stream.
    /// Default: drop the oldest event and report the overflow
    pub overflow_policy: OverflowPolicy,

    /// How long `login` waits for the first CONNECTED or FAILED state.
    /// Default: 10000
    pub login_timeout_ms: u64,
}

impl Default for RtmConfig {
    fn default() -> Self {
        Self {
            app_id: String::new(),
            user_id: String::new(),
            vendor_id: 0,
            area_code: AreaCode::default(),
            presence_timeout: 0,
            log_file_path: None,
            event_buffer: 1024,
            overflow_policy: OverflowPolicy::default(),
            login_timeout_ms: 10_000,
        }
    }
}

impl RtmConfig {
    pub fn new(app_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            user_id: user_id.into(),
            ..Default::default()
        }
    }

    /// Parse a JSON config document; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: RtmConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn login_timeout(&self) -> Duration {
        Duration::from_millis(self.login_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.app_id.is_empty() {
            return Err(RtmError::InvalidConfig("app_id is required".into()));
        }
        if self.app_id.len() > MAX_APP_ID_LEN {
            return Err(RtmError::InvalidConfig(format!(
                "app_id longer than {} characters",
                MAX_APP_ID_LEN
            )));
        }
        if self.user_id.is_empty() {
            return Err(RtmError::InvalidConfig("user_id is required".into()));
        }
        if self.user_id.len() > MAX_USER_ID_LEN || self.user_id.contains('\0') {
            return Err(RtmError::InvalidConfig(format!(
                "user_id must be at most {} bytes without NUL",
                MAX_USER_ID_LEN
            )));
        }
        if self.event_buffer == 0 {
            return Err(RtmError::InvalidConfig(
                "event_buffer must be at least 1".into(),
            ));
        }
        if self.login_timeout_ms == 0 {
            return Err(RtmError::InvalidConfig(
                "login_timeout_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}
