//! In-process [`Storage`] with the same observable semantics as the etcd adapter
//!
//! Every mutation takes the next value of a single index counter. Leases are
//! tracked with `tokio::time::Instant` deadlines, so a paused test clock drives
//! expiry deterministically.
//!
//! Like etcd, removal of an elapsed lease is not instantaneous. A background
//! task sweeps every second; until it runs, an elapsed key is still readable
//! with a TTL of 0 and can still be refreshed. Operations sweep leaves that are
//! overdue by more than one sweep period, which bounds the lag when no runtime
//! drives the background task.
//!
//! Watch delivery is synchronous: the mutating call pushes straight into every
//! matching watcher's feed while holding the keyspace lock, which keeps the
//! index order of each watcher intact. A recursive delete is pushed as one
//! change holding an event per removed leaf.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;
use std::time::SystemTime;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;
use tracing::trace;

use super::PushError;
use super::Storage;
use super::WatchAction;
use super::WatchEvent;
use super::WatchFeed;
use super::Watcher;
use crate::metrics::observe;
use crate::node::assemble;
use crate::node::KvEntry;
use crate::utils::key;
use crate::utils::ScopedTimer;
use crate::Error;
use crate::Node;
use crate::Result;
use crate::StorageConfig;

const EXPIRY_SWEEP_INTERVAL: Duration = Duration::from_millis(1000);

/// Wall clock that advances with tokio's clock
#[derive(Debug, Clone, Copy)]
struct Clock {
    base_wall: SystemTime,
    base_instant: Instant,
}

impl Clock {
    fn new() -> Self {
        Self {
            base_wall: SystemTime::now(),
            base_instant: Instant::now(),
        }
    }

    fn wall(
        &self,
        at: Instant,
    ) -> SystemTime {
        self.base_wall + at.saturating_duration_since(self.base_instant)
    }
}

#[derive(Debug, Clone)]
struct Leaf {
    value: String,
    created_index: u64,
    modified_index: u64,
    deadline: Option<Instant>,
}

struct Subscription {
    key: String,
    after: u64,
    feed: WatchFeed,
}

struct Keyspace {
    leaves: BTreeMap<String, Leaf>,
    /// Deadline -> keys whose lease elapses then
    expirations: BTreeMap<Instant, Vec<String>>,
    index: u64,
    history: VecDeque<WatchEvent>,
    history_size: usize,
    /// Highest index dropped from `history`
    evicted_index: u64,
    subscriptions: Vec<Subscription>,
    clock: Clock,
}

impl Keyspace {
    fn entry(
        &self,
        key: &str,
        leaf: &Leaf,
    ) -> KvEntry {
        KvEntry {
            key: key.to_string(),
            value: leaf.value.clone(),
            created_index: leaf.created_index,
            modified_index: leaf.modified_index,
            expiration: leaf.deadline.map(|d| self.clock.wall(d)),
        }
    }

    fn snapshot(
        &self,
        key: &str,
        leaf: &Leaf,
        now: Instant,
    ) -> Node {
        let entry = self.entry(key, leaf);
        Node::leaf(
            entry.key,
            entry.value,
            entry.created_index,
            entry.modified_index,
            entry.expiration,
            self.clock.wall(now),
        )
    }

    /// `key` itself followed by its descendants, in key order
    fn subtree_keys(
        &self,
        key: &str,
    ) -> Vec<String> {
        let mut keys = Vec::new();
        if !key::is_root(key) && self.leaves.contains_key(key) {
            keys.push(key.to_string());
        }
        let prefix = key::subtree_prefix(key);
        keys.extend(
            self.leaves
                .range(prefix.clone()..)
                .take_while(|(k, _)| k.starts_with(&prefix))
                .map(|(k, _)| k.clone()),
        );
        keys
    }

    fn has_descendants(
        &self,
        key: &str,
    ) -> bool {
        let prefix = key::subtree_prefix(key);
        self.leaves
            .range(prefix.clone()..)
            .next()
            .is_some_and(|(k, _)| k.starts_with(&prefix))
    }

    fn next_index(&mut self) -> u64 {
        self.index += 1;
        self.index
    }

    fn insert_leaf(
        &mut self,
        key: String,
        leaf: Leaf,
    ) {
        if let Some(deadline) = self.leaves.get(&key).and_then(|prev| prev.deadline) {
            self.forget_deadline(&key, deadline);
        }
        if let Some(deadline) = leaf.deadline {
            self.expirations.entry(deadline).or_default().push(key.clone());
        }
        self.leaves.insert(key, leaf);
    }

    fn remove_leaf(
        &mut self,
        key: &str,
    ) -> Option<Leaf> {
        let leaf = self.leaves.remove(key)?;
        if let Some(deadline) = leaf.deadline {
            self.forget_deadline(key, deadline);
        }
        Some(leaf)
    }

    fn forget_deadline(
        &mut self,
        key: &str,
        deadline: Instant,
    ) {
        if let Some(keys) = self.expirations.get_mut(&deadline) {
            keys.retain(|k| k != key);
            if keys.is_empty() {
                self.expirations.remove(&deadline);
            }
        }
    }

    /// Removes leaves whose lease elapsed at least `grace` ago
    fn sweep(
        &mut self,
        now: Instant,
        grace: Duration,
    ) {
        let Some(cutoff) = now.checked_sub(grace) else {
            return;
        };
        let due: Vec<Instant> = self.expirations.range(..=cutoff).map(|(d, _)| *d).collect();

        for deadline in due {
            let Some(keys) = self.expirations.remove(&deadline) else {
                continue;
            };
            for key in keys {
                let Some(leaf) = self.leaves.remove(&key) else {
                    continue;
                };
                let index = self.next_index();
                debug!(key = %key, index, "[:MemoryStorage:sweep] lease elapsed");
                let prev = self.snapshot(&key, &leaf, now);
                self.publish(vec![WatchEvent {
                    action: WatchAction::Expire,
                    node: Node::removed(key, leaf.created_index, index),
                    prev_node: Some(prev),
                }]);
            }
        }
    }

    /// Delivers one change, the events of which share an index, and records it
    fn publish(
        &mut self,
        change: Vec<WatchEvent>,
    ) {
        let Some(index) = change.first().map(WatchEvent::index) else {
            return;
        };
        self.subscriptions.retain(|sub| {
            if sub.feed.is_detached() {
                return false;
            }
            if index <= sub.after {
                return true;
            }
            let matching: Vec<WatchEvent> = change
                .iter()
                .filter(|e| key::is_within(&sub.key, e.key()))
                .cloned()
                .collect();
            match sub.feed.push_change(matching) {
                Ok(()) => true,
                Err(PushError::Closed) | Err(PushError::Overflow) => false,
            }
        });

        self.history.extend(change);
        while self.history.len() > self.history_size {
            if let Some(evicted) = self.history.pop_front() {
                self.evicted_index = self.evicted_index.max(evicted.index());
            }
        }
    }
}

/// Deterministic in-memory backend
///
/// Cloning is cheap; clones share the same key space.
#[derive(Clone)]
pub struct MemoryStorage {
    inner: Arc<Mutex<Keyspace>>,
    heartbeat_delay: Duration,
    watch_buffer_size: usize,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new(&StorageConfig::default())
    }
}

impl MemoryStorage {
    /// Builds an empty key space using the lease and watch settings of `config`
    ///
    /// When called inside a tokio runtime a background task sweeps elapsed
    /// leases every second so watchers see expirations without further calls.
    pub fn new(config: &StorageConfig) -> Self {
        let storage = Self {
            inner: Arc::new(Mutex::new(Keyspace {
                leaves: BTreeMap::new(),
                expirations: BTreeMap::new(),
                index: 0,
                history: VecDeque::new(),
                history_size: config.watch.history_size.max(1),
                evicted_index: 0,
                subscriptions: Vec::new(),
                clock: Clock::new(),
            })),
            heartbeat_delay: config.lease.heartbeat_delay(),
            watch_buffer_size: config.watch.buffer_size,
        };

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(sweep_loop(Arc::downgrade(&storage.inner)));
        }
        storage
    }

    /// Index of the latest mutation, 0 for an untouched key space
    pub fn current_index(&self) -> u64 {
        self.inner.lock().index
    }

    /// Number of watchers still registered
    pub fn watcher_count(&self) -> usize {
        let mut keyspace = self.inner.lock();
        keyspace.subscriptions.retain(|sub| !sub.feed.is_detached());
        keyspace.subscriptions.len()
    }

    fn do_get(
        &self,
        key: &str,
    ) -> Result<Node> {
        let key = key::normalize(key)?;
        let now = Instant::now();
        let mut keyspace = self.inner.lock();
        keyspace.sweep(now, EXPIRY_SWEEP_INTERVAL);

        let entries: Vec<KvEntry> = keyspace
            .subtree_keys(&key)
            .iter()
            .filter_map(|k| keyspace.leaves.get(k).map(|leaf| keyspace.entry(k, leaf)))
            .collect();

        assemble(&key, &entries, keyspace.clock.wall(now))?.ok_or_else(|| Error::not_found(key))
    }

    fn do_set(
        &self,
        key: &str,
        value: &str,
    ) -> Result<()> {
        let key = key::normalize(key)?;
        let now = Instant::now();
        let mut keyspace = self.inner.lock();
        keyspace.sweep(now, EXPIRY_SWEEP_INTERVAL);

        if key::is_root(&key) || keyspace.has_descendants(&key) {
            return Err(Error::NotAFile { key });
        }
        if let Some(ancestor) = key::ancestors(&key)
            .into_iter()
            .find(|a| keyspace.leaves.contains_key(a))
        {
            return Err(Error::NotADirectory { key: ancestor });
        }

        let index = keyspace.next_index();
        let prev = keyspace.leaves.get(&key).cloned();
        let leaf = Leaf {
            value: value.to_string(),
            created_index: prev.as_ref().map_or(index, |p| p.created_index),
            modified_index: index,
            deadline: Some(now + self.heartbeat_delay),
        };
        let node = keyspace.snapshot(&key, &leaf, now);
        let prev_node = prev.as_ref().map(|p| keyspace.snapshot(&key, p, now));
        keyspace.insert_leaf(key.clone(), leaf);

        debug!(key = %key, index, "[:MemoryStorage:set]");
        keyspace.publish(vec![WatchEvent {
            action: if prev_node.is_some() {
                WatchAction::Update
            } else {
                WatchAction::Set
            },
            node,
            prev_node,
        }]);
        Ok(())
    }

    fn do_update(
        &self,
        key: &str,
        value: &str,
    ) -> Result<()> {
        let key = key::normalize(key)?;
        let now = Instant::now();
        let mut keyspace = self.inner.lock();
        keyspace.sweep(now, EXPIRY_SWEEP_INTERVAL);

        if key::is_root(&key) || keyspace.has_descendants(&key) {
            return Err(Error::NotAFile { key });
        }
        let Some(prev) = keyspace.leaves.get(&key).cloned() else {
            return Err(Error::not_found(key));
        };

        let index = keyspace.next_index();
        let leaf = Leaf {
            value: value.to_string(),
            created_index: prev.created_index,
            modified_index: index,
            deadline: Some(now + self.heartbeat_delay),
        };
        let node = keyspace.snapshot(&key, &leaf, now);
        let prev_node = keyspace.snapshot(&key, &prev, now);
        keyspace.insert_leaf(key.clone(), leaf);

        debug!(key = %key, index, "[:MemoryStorage:update]");
        keyspace.publish(vec![WatchEvent {
            action: WatchAction::Update,
            node,
            prev_node: Some(prev_node),
        }]);
        Ok(())
    }

    fn do_delete(
        &self,
        key: &str,
    ) -> Result<()> {
        let key = key::normalize(key)?;
        let now = Instant::now();
        let mut keyspace = self.inner.lock();
        keyspace.sweep(now, EXPIRY_SWEEP_INTERVAL);

        let doomed = keyspace.subtree_keys(&key);
        if doomed.is_empty() {
            return Err(Error::not_found(key));
        }

        // One index for the whole subtree: it disappears in a single step.
        let index = keyspace.next_index();
        let mut events = Vec::with_capacity(doomed.len());
        for k in doomed {
            if let Some(leaf) = keyspace.remove_leaf(&k) {
                let prev = keyspace.snapshot(&k, &leaf, now);
                events.push(WatchEvent {
                    action: WatchAction::Delete,
                    node: Node::removed(k, leaf.created_index, index),
                    prev_node: Some(prev),
                });
            }
        }

        debug!(key = %key, index, removed = events.len(), "[:MemoryStorage:delete]");
        keyspace.publish(events);
        Ok(())
    }

    fn do_watch(
        &self,
        key: &str,
        index: u64,
    ) -> Result<Watcher> {
        let key = key::normalize(key)?;
        let now = Instant::now();
        let mut keyspace = self.inner.lock();
        keyspace.sweep(now, EXPIRY_SWEEP_INTERVAL);
        keyspace.subscriptions.retain(|sub| !sub.feed.is_detached());

        if index > 0 && index < keyspace.evicted_index {
            return Err(Error::SubscriptionFailure {
                key,
                reason: format!(
                    "index {index} already cleared, oldest retained is {}",
                    keyspace.evicted_index + 1
                ),
            });
        }

        let after = if index == 0 { keyspace.index } else { index };
        let (watcher, feed) = Watcher::channel(key.clone(), self.watch_buffer_size);

        let backlog: Vec<WatchEvent> = keyspace
            .history
            .iter()
            .filter(|e| e.index() > after && key::is_within(&key, e.key()))
            .cloned()
            .collect();
        // An overflowing backlog leaves the feed detached and the watcher closed.
        let _ = feed.push_all(backlog);

        trace!(key = %key, after, watcher_id = feed.id(), "[:MemoryStorage:watch] registered");
        if !feed.is_detached() {
            keyspace.subscriptions.push(Subscription { key, after, feed });
        }
        Ok(watcher)
    }
}

async fn sweep_loop(inner: Weak<Mutex<Keyspace>>) {
    let mut interval = tokio::time::interval(EXPIRY_SWEEP_INTERVAL);
    interval.tick().await; // Skip first immediate tick

    loop {
        interval.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.lock().sweep(Instant::now(), Duration::ZERO);
    }
}

#[tonic::async_trait]
impl Storage for MemoryStorage {
    async fn get(
        &self,
        key: &str,
    ) -> Result<Node> {
        let _timer = ScopedTimer::new("memory::get");
        observe("get", self.do_get(key))
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
    ) -> Result<()> {
        let _timer = ScopedTimer::new("memory::set");
        observe("set", self.do_set(key, value))
    }

    async fn update(
        &self,
        key: &str,
        value: &str,
    ) -> Result<()> {
        let _timer = ScopedTimer::new("memory::update");
        observe("update", self.do_update(key, value))
    }

    async fn delete(
        &self,
        key: &str,
    ) -> Result<()> {
        let _timer = ScopedTimer::new("memory::delete");
        observe("delete", self.do_delete(key))
    }

    async fn watch(
        &self,
        key: &str,
        index: u64,
    ) -> Result<Watcher> {
        let _timer = ScopedTimer::new("memory::watch");
        observe("watch", self.do_watch(key, index))
    }
}
