//! Hierarchical key-value storage for service registries
//!
//! [`Storage`] is the capability the registry talks to: read a subtree, write a
//! leased leaf, refresh it, delete a subtree and watch for changes. Two backends
//! implement it:
//!
//! - [`EtcdStorage`] maps the hierarchy onto an etcd v3 cluster.
//! - [`MemoryStorage`] keeps everything in process with the same semantics.
//!
//! ```ignore
//! let config = StorageConfig::new()?.validate()?;
//! let storage = Arc::new(EtcdStorage::connect(&config).await?);
//! let keeper = LeaseKeeper::register(storage.clone(), "/services/web/a", "10.0.0.1:80", &config.lease).await?;
//!
//! let mut watcher = storage.watch("/services/web", 0).await?;
//! while let Some(event) = watcher.next().await {
//!     println!("{:?} {}", event.action, event.key());
//! }
//! ```

mod config;
mod errors;
mod node;
mod storage;

pub mod constants;
pub mod metrics;
pub mod utils;

pub use config::*;
pub use errors::*;
pub use node::*;
pub use storage::*;
