//! Storage contract and its backends
//!
//! - [`Storage`] is the capability interface the registry consumes.
//! - [`EtcdStorage`] implements it against an etcd v3 cluster.
//! - [`MemoryStorage`] implements it in process, for tests and embedding.
//! - [`LeaseKeeper`] keeps a registration alive through periodic `update` calls.

mod etcd;
mod lease_keeper;
mod memory;
mod watcher;

pub use etcd::*;
pub use lease_keeper::*;
pub use memory::*;
pub use watcher::*;

#[cfg(test)]
mod memory_test;

#[cfg(test)]
use mockall::automock;
use tonic::async_trait;

use crate::Node;
use crate::Result;

/// Read, write, delete and subscribe over a hierarchical, versioned key space
///
/// Keys are slash-delimited paths and are normalised before use. Writes attach
/// the configured lease; the backend alone decides when a key expires.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Storage: Send + Sync + 'static {
    /// Full subtree rooted at `key` from a fresh read
    ///
    /// # Errors
    /// - [`crate::Error::NotFound`] when nothing exists at or beneath `key`
    /// - [`crate::Error::BackendUnavailable`] on transport failures
    async fn get(
        &self,
        key: &str,
    ) -> Result<Node>;

    /// Creates or overwrites the leaf at `key` with a fresh lease
    ///
    /// # Errors
    /// - [`crate::Error::NotAFile`] when `key` is a directory
    /// - [`crate::Error::NotADirectory`] when an ancestor of `key` is a leaf
    /// - [`crate::Error::BackendUnavailable`] on transport failures
    async fn set(
        &self,
        key: &str,
        value: &str,
    ) -> Result<()>;

    /// Refreshes the lease of an existing leaf, never recreating it
    ///
    /// # Errors
    /// - [`crate::Error::NotFound`] when the key was removed or already expired
    /// - [`crate::Error::NotAFile`] when `key` is a directory
    /// - [`crate::Error::BackendUnavailable`] on transport failures
    async fn update(
        &self,
        key: &str,
        value: &str,
    ) -> Result<()>;

    /// Removes `key` and its whole subtree
    ///
    /// # Errors
    /// - [`crate::Error::NotFound`] when nothing was removed
    /// - [`crate::Error::BackendUnavailable`] on transport failures
    async fn delete(
        &self,
        key: &str,
    ) -> Result<()>;

    /// Streams changes of `key` and everything beneath it
    ///
    /// `index == 0` starts from now. Otherwise `index` is the last index the
    /// caller observed and delivery starts with the first change after it.
    ///
    /// # Errors
    /// - [`crate::Error::SubscriptionFailure`] when the subscription cannot be
    ///   established, including an `index` the backend no longer retains
    async fn watch(
        &self,
        key: &str,
        index: u64,
    ) -> Result<Watcher>;
}
