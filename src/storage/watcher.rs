//! Watch subscriptions
//!
//! A subscription is split in two halves created together by [`Watcher::channel`]:
//!
//! ```text
//! backend task / in-memory store           caller
//!        WatchFeed::push()  ──bounded queue──▶  Watcher::next()
//!        WatchFeed::stopped() ◀──stop signal──  Watcher::stop()
//! ```
//!
//! The queue's only sender sits in a shared slot. [`Watcher::stop`] takes it out
//! of the slot, so nothing can be enqueued once `stop` returns, and then
//! `try_send`s on a capacity-1 signal channel so the producer can release its
//! backend subscription. Neither step waits on the producer.
//!
//! Each queue slot holds one change: the events sharing a single index, such as
//! the per-leaf removals of a recursive delete, travel together or not at all.
//!
//! A full queue is not back-pressured: the feed closes the subscription and
//! flags it as overflowed. The consumer drains what was buffered, sees the end of
//! the stream and can check [`Watcher::overflowed`] or [`Watcher::failed`] before
//! re-watching from [`Watcher::last_index`].

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::task::ready;
use std::task::Context;
use std::task::Poll;

use futures::Stream;
use parking_lot::Mutex;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::metrics::ACTIVE_WATCHERS;
use crate::metrics::WATCH_OVERFLOWS;
use crate::Node;

/// Kind of change carried by a [`WatchEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchAction {
    /// Key was created
    Set,
    /// Existing key was overwritten or its lease refreshed
    Update,
    /// Key was removed explicitly
    Delete,
    /// Key's lease elapsed
    Expire,
}

/// One change under a watched key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEvent {
    pub action: WatchAction,
    /// Key after the change; valueless for removals
    pub node: Node,
    /// Key before the change, when the backend reports it
    pub prev_node: Option<Node>,
}

impl WatchEvent {
    /// Version index of the change
    pub fn index(&self) -> u64 {
        self.node.modified_index()
    }

    pub fn key(&self) -> &str {
        self.node.key()
    }
}

/// Lifecycle of a subscription. There is no way back to `Open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    /// Events flow into the delivery queue
    Open,
    /// Stop requested, producer not yet gone
    Stopping,
    /// No further events; buffered ones may still be drained
    Closed,
}

const OPEN: u8 = 0;
const STOPPING: u8 = 1;
const CLOSED: u8 = 2;

static NEXT_WATCHER_ID: AtomicU64 = AtomicU64::new(1);

struct Shared {
    id: u64,
    key: String,
    sender: Mutex<Option<mpsc::Sender<Vec<WatchEvent>>>>,
    state: AtomicU8,
    overflowed: AtomicBool,
    failed: AtomicBool,
    /// Still counted in [`ACTIVE_WATCHERS`]
    counted: AtomicBool,
}

impl Shared {
    fn detach(&self) -> bool {
        self.sender.lock().take().is_some()
    }

    fn uncount(&self) {
        if self.counted.swap(false, Ordering::AcqRel) {
            ACTIVE_WATCHERS.dec();
        }
    }

    fn mark_closed(&self) {
        self.uncount();
        if self.state.swap(CLOSED, Ordering::AcqRel) != CLOSED {
            trace!(watcher_id = self.id, key = %self.key, "Watcher closed");
        }
    }
}

/// Consumer half of a watch subscription
///
/// Exactly one consumer reads it (`next` takes `&mut self`). Dropping the watcher
/// stops it.
pub struct Watcher {
    shared: Arc<Shared>,
    recv: mpsc::Receiver<Vec<WatchEvent>>,
    /// Rest of the change being handed out
    pending: VecDeque<WatchEvent>,
    stop: mpsc::Sender<()>,
    last_index: u64,
}

/// Producer half of a watch subscription
pub struct WatchFeed {
    shared: Arc<Shared>,
    stop: mpsc::Receiver<()>,
}

/// Why an event could not be queued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushError {
    /// Subscription stopped or consumer gone
    Closed,
    /// Queue was full; the subscription is now closed
    Overflow,
}

impl Watcher {
    /// Creates a subscription on `key` whose queue holds `capacity` changes
    pub fn channel(
        key: impl Into<String>,
        capacity: usize,
    ) -> (Watcher, WatchFeed) {
        let (sender, recv) = mpsc::channel(capacity.max(1));
        let (stop_tx, stop_rx) = mpsc::channel(1);

        let shared = Arc::new(Shared {
            id: NEXT_WATCHER_ID.fetch_add(1, Ordering::Relaxed),
            key: key.into(),
            sender: Mutex::new(Some(sender)),
            state: AtomicU8::new(OPEN),
            overflowed: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            counted: AtomicBool::new(true),
        });
        ACTIVE_WATCHERS.inc();
        trace!(watcher_id = shared.id, key = %shared.key, capacity, "Watcher opened");

        (
            Watcher {
                shared: shared.clone(),
                recv,
                pending: VecDeque::new(),
                stop: stop_tx,
                last_index: 0,
            },
            WatchFeed {
                shared,
                stop: stop_rx,
            },
        )
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn key(&self) -> &str {
        &self.shared.key
    }

    /// Next event, or `None` once the subscription is closed and drained
    pub async fn next(&mut self) -> Option<WatchEvent> {
        while self.pending.is_empty() {
            let change = self.recv.recv().await?;
            self.pending.extend(change);
        }
        self.hand_out()
    }

    /// Next buffered event without waiting
    pub fn try_next(&mut self) -> Option<WatchEvent> {
        while self.pending.is_empty() {
            let change = self.recv.try_recv().ok()?;
            self.pending.extend(change);
        }
        self.hand_out()
    }

    /// A change counts as seen once its last event is handed out.
    fn hand_out(&mut self) -> Option<WatchEvent> {
        let event = self.pending.pop_front()?;
        if self.pending.is_empty() {
            self.last_index = event.index();
        }
        Some(event)
    }

    /// Stops the subscription without blocking
    ///
    /// Nothing is enqueued after this returns. Calling it again, or after the
    /// subscription closed on its own, does nothing.
    pub fn stop(&self) {
        let _ = self.shared.state.compare_exchange(
            OPEN,
            STOPPING,
            Ordering::AcqRel,
            Ordering::Acquire,
        );

        if self.shared.detach() {
            debug!(watcher_id = self.shared.id, key = %self.shared.key, "Watcher stop requested");
        }
        self.shared.uncount();

        // Send-or-drop: a pending signal already does the job.
        let _ = self.stop.try_send(());
    }

    pub fn state(&self) -> WatcherState {
        match self.shared.state.load(Ordering::Acquire) {
            OPEN => WatcherState::Open,
            STOPPING => WatcherState::Stopping,
            _ => WatcherState::Closed,
        }
    }

    /// True when the subscription was closed because the queue overflowed
    pub fn overflowed(&self) -> bool {
        self.shared.overflowed.load(Ordering::Acquire)
    }

    /// True when the backend ended the subscription because it could not
    /// deliver a change
    pub fn failed(&self) -> bool {
        self.shared.failed.load(Ordering::Acquire)
    }

    /// Index of the last change handed out in full, 0 before the first one
    ///
    /// Pass it to a new `watch` call to resume without gaps.
    pub fn last_index(&self) -> u64 {
        self.last_index
    }

    #[cfg(test)]
    pub(crate) fn is_counted(&self) -> bool {
        self.shared.counted.load(Ordering::Acquire)
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Stream for Watcher {
    type Item = WatchEvent;

    fn poll_next(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        while this.pending.is_empty() {
            match ready!(this.recv.poll_recv(cx)) {
                Some(change) => this.pending.extend(change),
                None => return Poll::Ready(None),
            }
        }
        Poll::Ready(this.hand_out())
    }
}

impl std::fmt::Debug for Watcher {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("id", &self.shared.id)
            .field("key", &self.shared.key)
            .field("state", &self.state())
            .field("last_index", &self.last_index)
            .finish_non_exhaustive()
    }
}

impl WatchFeed {
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn key(&self) -> &str {
        &self.shared.key
    }

    /// Queues `event` without waiting
    pub fn push(
        &self,
        event: WatchEvent,
    ) -> Result<(), PushError> {
        self.push_change(vec![event])
    }

    /// Queues the events of one change, all sharing an index, as a single unit
    pub fn push_change(
        &self,
        change: Vec<WatchEvent>,
    ) -> Result<(), PushError> {
        let outcome = {
            let guard = self.shared.sender.lock();
            let Some(sender) = guard.as_ref() else {
                return Err(PushError::Closed);
            };
            if change.is_empty() {
                return Ok(());
            }
            sender.try_send(change)
        };

        match outcome {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(dropped)) => {
                self.shared.overflowed.store(true, Ordering::Release);
                WATCH_OVERFLOWS.inc();
                warn!(
                    watcher_id = self.shared.id,
                    key = %self.shared.key,
                    index = dropped.first().map(WatchEvent::index),
                    "Watch queue overflowed, closing subscription"
                );
                self.close();
                Err(PushError::Overflow)
            }
            Err(TrySendError::Closed(_)) => {
                self.close();
                Err(PushError::Closed)
            }
        }
    }

    /// Queues `events`, ordered by index, one change at a time
    pub fn push_all(
        &self,
        events: Vec<WatchEvent>,
    ) -> Result<(), PushError> {
        let mut change: Vec<WatchEvent> = Vec::new();
        for event in events {
            if change.last().is_some_and(|last| last.index() != event.index()) {
                self.push_change(std::mem::take(&mut change))?;
            }
            change.push(event);
        }
        self.push_change(change)
    }

    /// Resolves once the consumer asked to stop or went away
    pub async fn stopped(&mut self) {
        let _ = self.stop.recv().await;
    }

    /// True when no further event can be queued
    pub fn is_detached(&self) -> bool {
        self.shared.sender.lock().is_none()
    }

    /// Ends the subscription because a change could not be delivered
    ///
    /// Does nothing to the flags of a subscription that already ended.
    pub fn fail(
        &self,
        reason: &str,
    ) {
        let detached = {
            let mut sender = self.shared.sender.lock();
            if sender.is_some() {
                self.shared.failed.store(true, Ordering::Release);
            }
            sender.take().is_some()
        };
        if detached {
            warn!(
                watcher_id = self.shared.id,
                key = %self.shared.key,
                reason,
                "Watch failed, closing subscription"
            );
        }
        self.shared.mark_closed();
    }

    /// Ends the subscription from the producer side
    pub fn close(&self) {
        self.shared.detach();
        self.shared.mark_closed();
    }
}

impl Drop for WatchFeed {
    fn drop(&mut self) {
        self.close();
    }
}
