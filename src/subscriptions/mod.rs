//! Subscription bookkeeping.
//!
//! Tracks which channels (and users) this client is subscribed to, which
//! concerns each subscription covers, and owns the entity engines that
//! serve them:
//! - one subscription per (channel, channel type)
//! - one event stream per concern
//! - atomic teardown of every concern on unsubscribe

mod manager;
mod types;

pub use manager::SubscriptionRegistry;
pub use types::{Concern, Concerns};
