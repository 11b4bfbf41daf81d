//! Point-in-time snapshots of the hierarchical key space
//!
//! A [`Node`] is produced by a read or carried by a watch event. It owns its whole
//! subtree and keeps no reference to the backend that produced it.

mod node;
mod tree;

pub use node::*;
pub use tree::*;
