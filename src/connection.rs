//! Connection lifecycle tracking.
//!
//! The tracker only mirrors what the transport reports. It maps raw state
//! notifications into [`ConnectionState`], fans them out on the stream
//! returned by `login`, and tells the dispatcher which transitions need a
//! resynchronization pass.

use crate::gateway::{self, DropReason, EventSender, EventStream, OverflowPolicy};
use crate::transport::RawStateChange;
use crate::types::{ConnectionChangeReason, ConnectionEvent, ConnectionState};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// One accepted state change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Transition {
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub reason: ConnectionChangeReason,
}

impl Transition {
    /// Leaving CONNECTED by any route: every snapshot is now suspect.
    pub fn lost_continuity(&self) -> bool {
        self.from == ConnectionState::Connected && self.to != ConnectionState::Connected
    }

    /// Back to CONNECTED from anywhere else: stale snapshots must be
    /// refetched.
    pub fn needs_resync(&self) -> bool {
        self.from != ConnectionState::Connected && self.to == ConnectionState::Connected
    }
}

fn is_expected(from: ConnectionState, to: ConnectionState) -> bool {
    use ConnectionState::*;
    matches!(
        (from, to),
        (Disconnected, Connecting)
            | (Connecting, Connected)
            | (Connecting, Failed)
            | (Connecting, Disconnected)
            | (Connected, Connected)
            | (Connected, Reconnecting)
            | (Connected, Disconnected)
            | (Connected, Failed)
            | (Reconnecting, Connected)
            | (Reconnecting, Failed)
            | (Reconnecting, Disconnected)
    )
}

pub struct ConnectionStateTracker {
    current: RwLock<ConnectionEvent>,
    sink: Mutex<Option<EventSender<ConnectionEvent>>>,
    buffer_size: usize,
    policy: OverflowPolicy,
}

impl ConnectionStateTracker {
    pub fn new(buffer_size: usize, policy: OverflowPolicy) -> Self {
        Self {
            current: RwLock::new(ConnectionEvent {
                state: ConnectionState::Disconnected,
                reason: ConnectionChangeReason::Connecting,
            }),
            sink: Mutex::new(None),
            buffer_size,
            policy,
        }
    }

    /// Start a fresh session: reset to DISCONNECTED and open a new stream.
    pub fn open(&self) -> EventStream<ConnectionEvent> {
        let (sink, stream) = gateway::channel("connection", self.buffer_size, self.policy);
        if let Some(previous) = self.sink.lock().replace(sink) {
            previous.close(DropReason::LoggedOut);
        }
        *self.current.write() = ConnectionEvent {
            state: ConnectionState::Disconnected,
            reason: ConnectionChangeReason::Connecting,
        };
        stream
    }

    /// End the session: settle in DISCONNECTED, report it, close the stream.
    pub fn close(&self) {
        let settled = {
            let mut current = self.current.write();
            if current.state == ConnectionState::Disconnected {
                None
            } else {
                *current = ConnectionEvent {
                    state: ConnectionState::Disconnected,
                    reason: ConnectionChangeReason::LeaveChannel,
                };
                Some(*current)
            }
        };
        if let Some(sink) = self.sink.lock().take() {
            if let Some(event) = settled {
                sink.send(event);
            }
            sink.close(DropReason::LoggedOut);
        }
    }

    pub fn is_open(&self) -> bool {
        self.sink.lock().is_some()
    }

    pub fn state(&self) -> ConnectionState {
        self.current.read().state
    }

    pub fn current(&self) -> ConnectionEvent {
        *self.current.read()
    }

    /// Record a raw transport notification.
    ///
    /// Unknown state codes are ignored. FAILED is terminal until the next
    /// [`open`](Self::open).
    pub fn apply(&self, raw: RawStateChange) -> Option<Transition> {
        let state = match ConnectionState::try_from(raw.state) {
            Ok(state) => state,
            Err(code) => {
                warn!(code, reason = raw.reason, "Unknown connection state code ignored");
                return None;
            }
        };
        let reason = ConnectionChangeReason::from_code(raw.reason);
        let event = ConnectionEvent { state, reason };

        let from = {
            let mut current = self.current.write();
            let from = current.state;
            if from == ConnectionState::Failed {
                debug!(?state, ?reason, "Ignoring state change after FAILED");
                return None;
            }
            if *current == event {
                return None;
            }
            if !is_expected(from, state) {
                warn!(%from, to = %state, ?reason, "Unexpected connection transition");
            }
            *current = event;
            from
        };

        info!(%from, to = %state, ?reason, "Connection state changed");
        if let Some(sink) = self.sink.lock().as_ref() {
            sink.send(event);
        }
        Some(Transition {
            from,
            to: state,
            reason,
        })
    }
}
