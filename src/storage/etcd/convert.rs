//! etcd response shapes to crate types
//!
//! `etcd_client` types cannot be built outside that crate, so conversions run
//! over [`RawKv`], a borrowed view of the fields that matter here.

use std::time::SystemTime;

use etcd_client::EventType;
use etcd_client::KeyValue;

use crate::node::KvEntry;
use crate::storage::WatchAction;
use crate::storage::WatchEvent;
use crate::utils::key;
use crate::ConversionError;
use crate::Node;

#[derive(Debug, Clone, Copy)]
pub(crate) struct RawKv<'a> {
    pub(crate) key: &'a [u8],
    pub(crate) value: &'a [u8],
    pub(crate) create_revision: i64,
    pub(crate) mod_revision: i64,
    pub(crate) lease: i64,
}

impl<'a> From<&'a KeyValue> for RawKv<'a> {
    fn from(kv: &'a KeyValue) -> Self {
        Self {
            key: kv.key(),
            value: kv.value(),
            create_revision: kv.create_revision(),
            mod_revision: kv.mod_revision(),
            lease: kv.lease(),
        }
    }
}

/// One event of a watch response, lease expiration already resolved
#[derive(Debug, Clone, Copy)]
pub(crate) struct RawChange<'a> {
    pub(crate) kind: RawEventKind,
    pub(crate) kv: RawKv<'a>,
    pub(crate) prev: Option<RawKv<'a>>,
    pub(crate) expiration: Option<SystemTime>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RawEventKind {
    Put,
    Delete,
}

impl From<EventType> for RawEventKind {
    fn from(event_type: EventType) -> Self {
        match event_type {
            EventType::Put => RawEventKind::Put,
            EventType::Delete => RawEventKind::Delete,
        }
    }
}

impl RawKv<'_> {
    pub(crate) fn key_str(&self) -> Result<&str, ConversionError> {
        std::str::from_utf8(self.key).map_err(|_| ConversionError::InvalidUtf8 {
            key: String::from_utf8_lossy(self.key).into_owned(),
            field: "key",
        })
    }

    pub(crate) fn value_str(&self) -> Result<&str, ConversionError> {
        std::str::from_utf8(self.value).map_err(|_| ConversionError::InvalidUtf8 {
            key: String::from_utf8_lossy(self.key).into_owned(),
            field: "value",
        })
    }

    pub(crate) fn entry(
        &self,
        expiration: Option<SystemTime>,
    ) -> Result<KvEntry, ConversionError> {
        let key = self.key_str()?;
        Ok(KvEntry {
            key: key.to_string(),
            value: self.value_str()?.to_string(),
            created_index: revision(key, self.create_revision)?,
            modified_index: revision(key, self.mod_revision)?,
            expiration,
        })
    }
}

/// Revisions are signed on the wire but never negative in practice
pub(crate) fn revision(
    key: &str,
    revision: i64,
) -> Result<u64, ConversionError> {
    u64::try_from(revision).map_err(|_| ConversionError::NegativeRevision {
        key: key.to_string(),
        revision,
    })
}

/// Turns one etcd event into a [`WatchEvent`]
///
/// A put that created the key is a `Set`, any other put an `Update`. etcd reports
/// lease expiry as a plain delete, so removals are always `Delete`.
pub(crate) fn watch_event(
    kind: RawEventKind,
    kv: RawKv<'_>,
    prev: Option<RawKv<'_>>,
    expiration: Option<SystemTime>,
    now: SystemTime,
) -> Result<WatchEvent, ConversionError> {
    let prev_node = match prev {
        Some(prev) => Some(prev.entry(None)?.into_leaf(now)),
        None => None,
    };

    match kind {
        RawEventKind::Put => {
            let entry = kv.entry(expiration)?;
            let action = if entry.created_index == entry.modified_index {
                WatchAction::Set
            } else {
                WatchAction::Update
            };
            Ok(WatchEvent {
                action,
                node: entry.into_leaf(now),
                prev_node,
            })
        }
        RawEventKind::Delete => {
            let key = kv.key_str()?;
            let created = prev
                .map(|p| revision(key, p.create_revision))
                .transpose()?
                .unwrap_or(0);
            Ok(WatchEvent {
                action: WatchAction::Delete,
                node: Node::removed(key, created, revision(key, kv.mod_revision)?),
                prev_node,
            })
        }
    }
}

/// Converts the changes of one watch response that fall under `watched`
///
/// Scope is judged on raw key bytes. One change inside the subtree that does not
/// convert fails the whole response.
pub(crate) fn scoped_events(
    watched: &str,
    changes: Vec<RawChange<'_>>,
    now: SystemTime,
) -> Result<Vec<WatchEvent>, ConversionError> {
    changes
        .into_iter()
        .filter(|change| key::is_within_bytes(watched, change.kv.key))
        .map(|change| watch_event(change.kind, change.kv, change.prev, change.expiration, now))
        .collect()
}
