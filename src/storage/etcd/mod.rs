//! [`Storage`] over an etcd v3 cluster
//!
//! etcd keeps a flat key space. The hierarchy is implied by `/` separated keys:
//! a directory exists while at least one key lives beneath `dir/`. Every write
//! attaches a freshly granted lease of `heartbeat_delay` seconds so the cluster
//! removes registrations that stop refreshing.
//!
//! Each watcher owns a background task pumping etcd watch responses into its
//! [`WatchFeed`]. The task ends, and cancels the etcd watch, as soon as the
//! consumer stops or drops the [`Watcher`].

mod convert;


use std::collections::HashMap;
use std::time::SystemTime;

use convert::scoped_events;
use convert::RawChange;
use convert::RawEventKind;
use convert::RawKv;
use etcd_client::Client;
use etcd_client::Compare;
use etcd_client::CompareOp;
use etcd_client::ConnectOptions;
use etcd_client::DeleteOptions;
use etcd_client::GetOptions;
use etcd_client::PutOptions;
use etcd_client::SortOrder;
use etcd_client::SortTarget;
use etcd_client::Txn;
use etcd_client::TxnOp;
use etcd_client::TxnOpResponse;
use etcd_client::WatchOptions;
use etcd_client::WatchResponse;
use etcd_client::WatchStream;
use etcd_client::Watcher as EtcdWatcher;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

use super::Storage;
use super::WatchFeed;
use super::Watcher;
use crate::metrics::observe;
use crate::node::assemble;
use crate::node::KvEntry;
use crate::utils::key;
use crate::utils::time::expiration_from_ttl;
use crate::utils::ScopedTimer;
use crate::ConversionError;
use crate::Error;
use crate::Node;
use crate::Result;
use crate::StorageConfig;

/// etcd-backed storage
///
/// Cloning shares the underlying connection.
#[derive(Clone)]
pub struct EtcdStorage {
    client: Client,
    endpoints: Vec<String>,
    lease_ttl: i64,
    watch_buffer_size: usize,
}

impl std::fmt::Debug for EtcdStorage {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("EtcdStorage")
            .field("endpoints", &self.endpoints)
            .field("lease_ttl", &self.lease_ttl)
            .finish_non_exhaustive()
    }
}

impl EtcdStorage {
    /// Connects to `config.backend.endpoints` and checks that the cluster answers
    ///
    /// # Errors
    /// [`Error::InitializationFailure`] naming the endpoints when none of them
    /// responds within the connect timeout.
    pub async fn connect(config: &StorageConfig) -> Result<Self> {
        let endpoints = config.backend.endpoints.clone();
        let init_failure = |e: etcd_client::Error| Error::InitializationFailure {
            endpoints: endpoints.clone(),
            source: Box::new(e),
        };

        let options = ConnectOptions::new()
            .with_connect_timeout(config.backend.connect_timeout())
            .with_timeout(config.backend.request_timeout());
        let mut client = Client::connect(&endpoints, Some(options))
            .await
            .map_err(init_failure)?;

        // Channels connect lazily; one round trip proves a member is reachable.
        let status = client.status().await.map_err(init_failure)?;
        info!(
            endpoints = %endpoints.join(","),
            version = %status.version(),
            "Connected to etcd"
        );

        Ok(Self {
            client,
            endpoints,
            lease_ttl: i64::try_from(config.lease.heartbeat_delay_in_secs).unwrap_or(i64::MAX),
            watch_buffer_size: config.watch.buffer_size,
        })
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    async fn grant_lease(
        &self,
        client: &mut Client,
    ) -> Result<i64> {
        let lease = client.lease_grant(self.lease_ttl, None).await?.id();
        trace!(lease, ttl = self.lease_ttl, "lease granted");
        Ok(lease)
    }

    async fn has_descendants(
        client: &mut Client,
        key: &str,
    ) -> Result<bool> {
        let prefix = key::subtree_prefix(key);
        let resp = client
            .get(prefix, Some(GetOptions::new().with_prefix().with_count_only()))
            .await?;
        Ok(resp.count() > 0)
    }

    async fn do_get(
        &self,
        key: &str,
    ) -> Result<Node> {
        let key = key::normalize(key)?;
        let mut client = self.client.clone();

        // Both reads in one transaction so they share a revision.
        let mut reads = Vec::with_capacity(2);
        if !key::is_root(&key) {
            reads.push(TxnOp::get(key.as_str(), None));
        }
        reads.push(TxnOp::get(
            key::subtree_prefix(&key),
            Some(
                GetOptions::new()
                    .with_prefix()
                    .with_sort(SortTarget::Key, SortOrder::Ascend),
            ),
        ));
        let resp = client.txn(Txn::new().and_then(reads)).await?;
        let responses: Vec<_> = resp
            .op_responses()
            .into_iter()
            .filter_map(|op| match op {
                TxnOpResponse::Get(get) => Some(get),
                _ => None,
            })
            .collect();
        let raws: Vec<RawKv<'_>> = responses
            .iter()
            .flat_map(|get| get.kvs().iter().map(RawKv::from))
            .collect();

        let now = SystemTime::now();
        let expirations = lease_expirations(&mut client, raws.iter().map(|r| r.lease), now).await?;
        let entries = raws
            .iter()
            .map(|raw| raw.entry(expirations.get(&raw.lease).copied().flatten()))
            .collect::<std::result::Result<Vec<KvEntry>, ConversionError>>()?;

        debug!(key = %key, entries = entries.len(), "[:EtcdStorage:get]");
        assemble(&key, &entries, now)?.ok_or_else(|| Error::not_found(key))
    }

    async fn do_set(
        &self,
        key: &str,
        value: &str,
    ) -> Result<()> {
        let key = key::normalize(key)?;
        if key::is_root(&key) {
            return Err(Error::NotAFile { key });
        }
        let mut client = self.client.clone();
        if Self::has_descendants(&mut client, &key).await? {
            return Err(Error::NotAFile { key });
        }

        let lease = self.grant_lease(&mut client).await?;
        let ancestors = key::ancestors(&key);
        let txn = Txn::new()
            .when(
                ancestors
                    .iter()
                    .map(|a| Compare::version(a.as_str(), CompareOp::Equal, 0))
                    .collect::<Vec<_>>(),
            )
            .and_then([TxnOp::put(
                key.as_str(),
                value,
                Some(PutOptions::new().with_lease(lease)),
            )])
            .or_else(
                ancestors
                    .iter()
                    .map(|a| TxnOp::get(a.as_str(), Some(GetOptions::new().with_keys_only())))
                    .collect::<Vec<_>>(),
            );

        let resp = match client.txn(txn).await {
            Ok(resp) => resp,
            Err(e) => {
                revoke_lease(&mut client, lease).await;
                return Err(e.into());
            }
        };
        if resp.succeeded() {
            debug!(key = %key, lease, "[:EtcdStorage:set]");
            return Ok(());
        }

        revoke_lease(&mut client, lease).await;
        let blocking = resp
            .op_responses()
            .into_iter()
            .zip(ancestors)
            .find_map(|(op, ancestor)| match op {
                TxnOpResponse::Get(get) if !get.kvs().is_empty() => Some(ancestor),
                _ => None,
            })
            .unwrap_or_else(|| key::parent(&key).to_string());
        Err(Error::NotADirectory { key: blocking })
    }

    async fn do_update(
        &self,
        key: &str,
        value: &str,
    ) -> Result<()> {
        let key = key::normalize(key)?;
        if key::is_root(&key) {
            return Err(Error::NotAFile { key });
        }
        let mut client = self.client.clone();
        if Self::has_descendants(&mut client, &key).await? {
            return Err(Error::NotAFile { key });
        }

        let lease = self.grant_lease(&mut client).await?;
        let txn = Txn::new()
            .when([Compare::create_revision(key.as_str(), CompareOp::Greater, 0)])
            .and_then([TxnOp::put(
                key.as_str(),
                value,
                Some(PutOptions::new().with_lease(lease)),
            )]);

        match client.txn(txn).await {
            Ok(resp) if resp.succeeded() => {
                debug!(key = %key, lease, "[:EtcdStorage:update]");
                Ok(())
            }
            Ok(_) => {
                revoke_lease(&mut client, lease).await;
                Err(Error::not_found(key))
            }
            Err(e) => {
                revoke_lease(&mut client, lease).await;
                Err(e.into())
            }
        }
    }

    async fn do_delete(
        &self,
        key: &str,
    ) -> Result<()> {
        let key = key::normalize(key)?;
        let mut client = self.client.clone();

        let mut ops = Vec::with_capacity(2);
        if !key::is_root(&key) {
            ops.push(TxnOp::delete(key.as_str(), None));
        }
        ops.push(TxnOp::delete(
            key::subtree_prefix(&key),
            Some(DeleteOptions::new().with_prefix()),
        ));

        let resp = client.txn(Txn::new().and_then(ops)).await?;
        let deleted: i64 = resp
            .op_responses()
            .into_iter()
            .map(|op| match op {
                TxnOpResponse::Delete(del) => del.deleted(),
                _ => 0,
            })
            .sum();

        if deleted == 0 {
            return Err(Error::not_found(key));
        }
        debug!(key = %key, deleted, "[:EtcdStorage:delete]");
        Ok(())
    }

    async fn do_watch(
        &self,
        key: &str,
        index: u64,
    ) -> Result<Watcher> {
        let key = key::normalize(key)?;
        let subscription_failure = |reason: String| Error::SubscriptionFailure {
            key: key.clone(),
            reason,
        };
        let mut client = self.client.clone();

        let mut options = WatchOptions::new()
            .with_range(key::prefix_end(key.as_bytes()))
            .with_prev_key();
        if index > 0 {
            let start = index
                .checked_add(1)
                .and_then(|rev| i64::try_from(rev).ok())
                .ok_or_else(|| subscription_failure(format!("index {index} out of range")))?;
            ensure_retained(&mut client, &key, start)
                .await
                .map_err(&subscription_failure)?;
            options = options.with_start_revision(start);
        }

        let (etcd_watcher, stream) = client
            .watch(key.as_str(), Some(options))
            .await
            .map_err(|e| subscription_failure(e.to_string()))?;

        let (watcher, feed) = Watcher::channel(key.clone(), self.watch_buffer_size);
        debug!(key = %key, index, watcher_id = feed.id(), "[:EtcdStorage:watch] started");
        tokio::spawn(pump_events(client, key, etcd_watcher, stream, feed));
        Ok(watcher)
    }
}

/// Remaining lease time per distinct lease id, resolved once each
async fn lease_expirations(
    client: &mut Client,
    leases: impl Iterator<Item = i64>,
    now: SystemTime,
) -> Result<HashMap<i64, Option<SystemTime>>> {
    let mut expirations = HashMap::new();
    for lease in leases.filter(|l| *l != 0) {
        if expirations.contains_key(&lease) {
            continue;
        }
        let ttl = client.lease_time_to_live(lease, None).await?.ttl();
        expirations.insert(lease, expiration_from_ttl(ttl, now));
    }
    Ok(expirations)
}

async fn revoke_lease(
    client: &mut Client,
    lease: i64,
) {
    if let Err(e) = client.lease_revoke(lease).await {
        warn!(lease, error = %e, "unused lease not revoked, it will expire on its own");
    }
}

/// Fails when revision `start` was already compacted away
async fn ensure_retained(
    client: &mut Client,
    key: &str,
    start: i64,
) -> std::result::Result<(), String> {
    let probe = GetOptions::new().with_revision(start).with_count_only();
    match client.get(key, Some(probe)).await {
        Ok(_) => Ok(()),
        Err(etcd_client::Error::GRpcStatus(status)) if status.message().contains("compacted") => {
            Err(format!("revision {start} already compacted"))
        }
        // A future revision is fine: the watch simply waits for it.
        Err(etcd_client::Error::GRpcStatus(status)) if status.message().contains("future") => Ok(()),
        Err(e) => Err(e.to_string()),
    }
}

async fn pump_events(
    mut client: Client,
    key: String,
    mut etcd_watcher: EtcdWatcher,
    mut stream: WatchStream,
    mut feed: WatchFeed,
) {
    loop {
        tokio::select! {
            biased;
            _ = feed.stopped() => {
                debug!(key = %key, watcher_id = feed.id(), "watcher stopped by consumer");
                break;
            }
            message = stream.message() => {
                match message {
                    Ok(Some(resp)) => {
                        if resp.compact_revision() > 0 {
                            feed.fail(&format!(
                                "fell behind compaction at revision {}",
                                resp.compact_revision()
                            ));
                            break;
                        }
                        if resp.canceled() {
                            feed.fail("canceled by etcd");
                            break;
                        }
                        if !forward(&mut client, &key, &resp, &feed).await {
                            break;
                        }
                    }
                    Ok(None) => {
                        debug!(key = %key, "watch stream ended");
                        break;
                    }
                    Err(e) => {
                        feed.fail(&format!("watch stream failed: {e}"));
                        break;
                    }
                }
            }
        }
    }

    if let Err(e) = etcd_watcher.cancel().await {
        trace!(key = %key, error = %e, "etcd watch already gone");
    }
    feed.close();
}

/// Pushes the events of `resp` that fall under `key`; false once the feed is closed
///
/// A response that does not convert fails the feed rather than leaving a gap.
async fn forward(
    client: &mut Client,
    key: &str,
    resp: &WatchResponse,
    feed: &WatchFeed,
) -> bool {
    let now = SystemTime::now();
    let mut expirations: HashMap<i64, Option<SystemTime>> = HashMap::new();
    let mut changes = Vec::with_capacity(resp.events().len());

    for event in resp.events() {
        let Some(kv) = event.kv() else {
            continue;
        };
        let raw = RawKv::from(kv);
        let kind = RawEventKind::from(event.event_type());
        let mut expiration = None;
        // The watched range also covers siblings such as `key-suffix`.
        if kind == RawEventKind::Put && raw.lease != 0 && key::is_within_bytes(key, raw.key) {
            if let Some(known) = expirations.get(&raw.lease) {
                expiration = *known;
            } else {
                expiration = match client.lease_time_to_live(raw.lease, None).await {
                    Ok(resp) => expiration_from_ttl(resp.ttl(), now),
                    Err(e) => {
                        trace!(lease = raw.lease, error = %e, "lease lookup failed");
                        None
                    }
                };
                expirations.insert(raw.lease, expiration);
            }
        }

        changes.push(RawChange {
            kind,
            kv: raw,
            prev: event.prev_kv().map(RawKv::from),
            expiration,
        });
    }

    match scoped_events(key, changes, now) {
        Ok(events) => feed.push_all(events).is_ok(),
        Err(e) => {
            feed.fail(&e.to_string());
            false
        }
    }
}

#[tonic::async_trait]
impl Storage for EtcdStorage {
    async fn get(
        &self,
        key: &str,
    ) -> Result<Node> {
        let _timer = ScopedTimer::new("etcd::get");
        observe("get", self.do_get(key).await)
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
    ) -> Result<()> {
        let _timer = ScopedTimer::new("etcd::set");
        observe("set", self.do_set(key, value).await)
    }

    async fn update(
        &self,
        key: &str,
        value: &str,
    ) -> Result<()> {
        let _timer = ScopedTimer::new("etcd::update");
        observe("update", self.do_update(key, value).await)
    }

    async fn delete(
        &self,
        key: &str,
    ) -> Result<()> {
        let _timer = ScopedTimer::new("etcd::delete");
        observe("delete", self.do_delete(key).await)
    }

    async fn watch(
        &self,
        key: &str,
        index: u64,
    ) -> Result<Watcher> {
        let _timer = ScopedTimer::new("etcd::watch");
        observe("watch", self.do_watch(key, index).await)
    }
}
