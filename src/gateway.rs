//! Bounded consumer-facing event streams.
//!
//! Every concern of every subscription gets its own [`EventStream`]. The
//! producing side never blocks the shared dispatch path indefinitely: when a
//! stream is full the configured [`OverflowPolicy`] decides what is lost, and
//! the consumer learns about it through [`Delivery::Overflow`] (or, for
//! [`OverflowPolicy::Close`], through [`EventStream::drop_reason`]).
//!
//! Streams must still be drained. A stream nobody reads loses events.

use crossbeam_channel::{bounded, Receiver, RecvError, RecvTimeoutError, Sender, TryRecvError};
use crossbeam_channel::{SendTimeoutError, TrySendError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// What a full stream does with the next event.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest queued event to make room.
    #[default]
    DropOldest,
    /// Discard the incoming event.
    DropNewest,
    /// Wait up to the given time for room, then discard the incoming event.
    BlockFor(Duration),
    /// Drop the slow subscriber: the stream ends after what is queued.
    Close,
}

/// Why a stream stopped producing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Consumer fell behind under `OverflowPolicy::Close`.
    BufferOverflow,
    /// The owning subscription was removed.
    Unsubscribed,
    /// The stream channel was left.
    Left,
    /// The client logged out.
    LoggedOut,
}

/// One item read from an [`EventStream`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Delivery<T> {
    Event(T),
    /// Events were lost since the previous read.
    Overflow { dropped: u64 },
}

impl<T> Delivery<T> {
    pub fn into_event(self) -> Option<T> {
        match self {
            Delivery::Event(event) => Some(event),
            Delivery::Overflow { .. } => None,
        }
    }
}

#[derive(Debug, Default)]
struct StreamShared {
    dropped: AtomicU64,
    drop_reason: Mutex<Option<DropReason>>,
}

/// Outcome of handing one event to a stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SendOutcome {
    Delivered,
    Dropped,
    Closed,
}

struct SenderState<T> {
    tx: Sender<T>,
    /// Producer-side handle on the queue, used to evict under `DropOldest`.
    evict: Receiver<T>,
}

/// Producing half of a stream. Owned by exactly one producer.
pub(crate) struct EventSender<T> {
    label: String,
    policy: OverflowPolicy,
    state: Mutex<Option<SenderState<T>>>,
    shared: Arc<StreamShared>,
}

/// Create a bounded stream pair.
pub(crate) fn channel<T>(
    label: impl Into<String>,
    capacity: usize,
    policy: OverflowPolicy,
) -> (EventSender<T>, EventStream<T>) {
    let (tx, rx) = bounded(capacity.max(1));
    let shared = Arc::new(StreamShared::default());
    let sender = EventSender {
        label: label.into(),
        policy,
        state: Mutex::new(Some(SenderState {
            tx,
            evict: rx.clone(),
        })),
        shared: Arc::clone(&shared),
    };
    (sender, EventStream { rx, shared })
}

impl<T> EventSender<T> {
    /// Deliver one event according to the overflow policy.
    pub(crate) fn send(&self, event: T) -> SendOutcome {
        let mut guard = self.state.lock();
        let Some(state) = guard.as_ref() else {
            return SendOutcome::Closed;
        };

        let event = match state.tx.try_send(event) {
            Ok(()) => return SendOutcome::Delivered,
            Err(TrySendError::Disconnected(_)) => return SendOutcome::Closed,
            Err(TrySendError::Full(event)) => event,
        };

        match self.policy {
            OverflowPolicy::DropOldest => {
                let mut pending = event;
                loop {
                    if state.evict.try_recv().is_ok() {
                        self.record_drop();
                    }
                    match state.tx.try_send(pending) {
                        Ok(()) => return SendOutcome::Delivered,
                        Err(TrySendError::Full(back)) => pending = back,
                        Err(TrySendError::Disconnected(_)) => return SendOutcome::Closed,
                    }
                }
            }
            OverflowPolicy::DropNewest => {
                self.record_drop();
                SendOutcome::Dropped
            }
            OverflowPolicy::BlockFor(timeout) => match state.tx.send_timeout(event, timeout) {
                Ok(()) => SendOutcome::Delivered,
                Err(SendTimeoutError::Timeout(_)) => {
                    self.record_drop();
                    SendOutcome::Dropped
                }
                Err(SendTimeoutError::Disconnected(_)) => SendOutcome::Closed,
            },
            OverflowPolicy::Close => {
                warn!(stream = %self.label, "Consumer not draining, dropping subscriber");
                self.shared
                    .drop_reason
                    .lock()
                    .get_or_insert(DropReason::BufferOverflow);
                *guard = None;
                SendOutcome::Closed
            }
        }
    }

    fn record_drop(&self) {
        let total = self.shared.dropped.fetch_add(1, Ordering::AcqRel) + 1;
        if total == 1 {
            warn!(stream = %self.label, policy = ?self.policy, "Event stream overflowed");
        }
    }

    /// Close the stream. Closing twice is a no-op.
    pub(crate) fn close(&self, reason: DropReason) {
        let mut guard = self.state.lock();
        if guard.take().is_some() {
            self.shared.drop_reason.lock().get_or_insert(reason);
            debug!(stream = %self.label, ?reason, "Event stream closed");
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().is_none()
    }
}

/// Consuming half of a stream.
///
/// Clones share the same queue, so two clones compete for events.
pub struct EventStream<T> {
    rx: Receiver<T>,
    shared: Arc<StreamShared>,
}

impl<T> Clone for EventStream<T> {
    fn clone(&self) -> Self {
        Self {
            rx: self.rx.clone(),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> std::fmt::Debug for EventStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("queued", &self.rx.len())
            .field("drop_reason", &self.drop_reason())
            .finish()
    }
}

impl<T> EventStream<T> {
    fn take_overflow(&self) -> Option<Delivery<T>> {
        match self.shared.dropped.swap(0, Ordering::AcqRel) {
            0 => None,
            dropped => Some(Delivery::Overflow { dropped }),
        }
    }

    /// Receive the next item (blocking). Errors once closed and drained.
    pub fn recv(&self) -> Result<Delivery<T>, RecvError> {
        if let Some(overflow) = self.take_overflow() {
            return Ok(overflow);
        }
        self.rx.recv().map(Delivery::Event)
    }

    /// Try to receive an item (non-blocking).
    pub fn try_recv(&self) -> Result<Delivery<T>, TryRecvError> {
        if let Some(overflow) = self.take_overflow() {
            return Ok(overflow);
        }
        self.rx.try_recv().map(Delivery::Event)
    }

    /// Receive with timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Delivery<T>, RecvTimeoutError> {
        if let Some(overflow) = self.take_overflow() {
            return Ok(overflow);
        }
        self.rx.recv_timeout(timeout).map(Delivery::Event)
    }

    /// Blocking iterator that ends when the stream is closed and drained.
    pub fn iter(&self) -> impl Iterator<Item = Delivery<T>> + '_ {
        std::iter::from_fn(move || self.recv().ok())
    }

    /// Everything queued right now, without blocking.
    pub fn drain(&self) -> Vec<Delivery<T>> {
        std::iter::from_fn(|| self.try_recv().ok()).collect()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> Option<usize> {
        self.rx.capacity()
    }

    /// Set once the producer side has been closed.
    pub fn drop_reason(&self) -> Option<DropReason> {
        *self.shared.drop_reason.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn events(stream: &EventStream<u32>) -> Vec<Delivery<u32>> {
        stream.drain()
    }

    #[test]
    fn test_delivers_in_order() {
        let (tx, rx) = channel("t", 4, OverflowPolicy::DropOldest);
        for i in 0..3 {
            assert_eq!(tx.send(i), SendOutcome::Delivered);
        }
        assert_eq!(
            events(&rx),
            vec![Delivery::Event(0), Delivery::Event(1), Delivery::Event(2)]
        );
    }

    #[test]
    fn test_drop_oldest_reports_overflow() {
        let (tx, rx) = channel("t", 2, OverflowPolicy::DropOldest);
        for i in 0..5 {
            assert_eq!(tx.send(i), SendOutcome::Delivered);
        }
        assert_eq!(
            events(&rx),
            vec![
                Delivery::Overflow { dropped: 3 },
                Delivery::Event(3),
                Delivery::Event(4)
            ]
        );
        // Counter resets after being reported.
        tx.send(5);
        assert_eq!(events(&rx), vec![Delivery::Event(5)]);
    }

    #[test]
    fn test_drop_newest_keeps_head() {
        let (tx, rx) = channel("t", 2, OverflowPolicy::DropNewest);
        tx.send(0);
        tx.send(1);
        assert_eq!(tx.send(2), SendOutcome::Dropped);
        assert_eq!(
            events(&rx),
            vec![
                Delivery::Overflow { dropped: 1 },
                Delivery::Event(0),
                Delivery::Event(1)
            ]
        );
    }

    #[test]
    fn test_block_for_times_out() {
        let (tx, rx) = channel("t", 1, OverflowPolicy::BlockFor(Duration::from_millis(10)));
        tx.send(0);
        assert_eq!(tx.send(1), SendOutcome::Dropped);
        assert_eq!(
            events(&rx),
            vec![Delivery::Overflow { dropped: 1 }, Delivery::Event(0)]
        );
    }

    #[test]
    fn test_close_policy_drops_subscriber() {
        let (tx, rx) = channel("t", 1, OverflowPolicy::Close);
        tx.send(0);
        assert_eq!(tx.send(1), SendOutcome::Closed);
        assert!(tx.is_closed());
        assert_eq!(rx.drop_reason(), Some(DropReason::BufferOverflow));
        assert_eq!(rx.recv(), Ok(Delivery::Event(0)));
        assert!(rx.recv().is_err());
    }

    #[test]
    fn test_close_is_idempotent() {
        let (tx, rx) = channel::<u32>("t", 1, OverflowPolicy::DropOldest);
        tx.close(DropReason::Unsubscribed);
        tx.close(DropReason::LoggedOut);
        assert_eq!(rx.drop_reason(), Some(DropReason::Unsubscribed));
        assert_eq!(tx.send(1), SendOutcome::Closed);
        assert!(rx.recv().is_err());
    }
}
