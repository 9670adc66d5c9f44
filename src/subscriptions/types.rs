//! Subscription types.

use crate::options::{JoinOptions, MessageOptions};
use serde::{Deserialize, Serialize};
use std::fmt;

/// An independently subscribable facet of a channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Concern {
    Message,
    Metadata,
    Presence,
    Lock,
}

/// The set of concerns a subscription covers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Concerns {
    pub message: bool,
    pub metadata: bool,
    pub presence: bool,
    pub lock: bool,
}

impl Concerns {
    pub fn contains(&self, concern: Concern) -> bool {
        match concern {
            Concern::Message => self.message,
            Concern::Metadata => self.metadata,
            Concern::Presence => self.presence,
            Concern::Lock => self.lock,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = Concern> + '_ {
        [
            Concern::Message,
            Concern::Metadata,
            Concern::Presence,
            Concern::Lock,
        ]
        .into_iter()
        .filter(move |c| self.contains(*c))
    }
}

impl From<&MessageOptions> for Concerns {
    fn from(opts: &MessageOptions) -> Self {
        Self {
            message: opts.message,
            metadata: opts.metadata,
            presence: opts.presence,
            lock: opts.lock,
        }
    }
}

/// Stream channels deliver messages per topic, never on the channel itself.
impl From<&JoinOptions> for Concerns {
    fn from(opts: &JoinOptions) -> Self {
        Self {
            message: false,
            metadata: opts.metadata,
            presence: opts.presence,
            lock: opts.lock,
        }
    }
}

impl fmt::Display for Concerns {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.iter().map(|c| format!("{:?}", c).to_lowercase()).collect();
        write!(f, "[{}]", names.join(","))
    }
}
