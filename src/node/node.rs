use std::time::SystemTime;

use serde::Deserialize;
use serde::Serialize;

use crate::utils::time::remaining_ttl;

/// Immutable snapshot of one key and, for directories, everything beneath it
///
/// Only directories have children and only leaves carry a value. Children are
/// kept in the order the backend returned them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    key: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<String>,

    #[serde(default)]
    dir: bool,

    /// Absolute time the lease elapses
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expiration: Option<SystemTime>,

    /// Remaining seconds at snapshot time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ttl: Option<i64>,

    modified_index: u64,
    created_index: u64,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    nodes: Vec<Node>,
}

impl Node {
    /// Leaf snapshot taken at `now`
    pub(crate) fn leaf(
        key: impl Into<String>,
        value: impl Into<String>,
        created_index: u64,
        modified_index: u64,
        expiration: Option<SystemTime>,
        now: SystemTime,
    ) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
            dir: false,
            expiration,
            ttl: expiration.map(|at| remaining_ttl(at, now)),
            modified_index,
            created_index,
            nodes: Vec::new(),
        }
    }

    /// Directory over `children`
    ///
    /// The backend keeps no directory records, so the indices are derived from
    /// the subtree: earliest creation, latest modification.
    pub(crate) fn directory(
        key: impl Into<String>,
        children: Vec<Node>,
    ) -> Self {
        let created_index = children.iter().map(|n| n.created_index).min().unwrap_or(0);
        let modified_index = children.iter().map(|n| n.modified_index).max().unwrap_or(0);
        Self {
            key: key.into(),
            value: None,
            dir: true,
            expiration: None,
            ttl: None,
            modified_index,
            created_index,
            nodes: children,
        }
    }

    /// Valueless snapshot of a removed key, stamped with the removal index
    pub(crate) fn removed(
        key: impl Into<String>,
        created_index: u64,
        modified_index: u64,
    ) -> Self {
        Self {
            key: key.into(),
            value: None,
            dir: false,
            expiration: None,
            ttl: None,
            modified_index,
            created_index,
            nodes: Vec::new(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }

    pub fn is_dir(&self) -> bool {
        self.dir
    }

    pub fn expiration(&self) -> Option<SystemTime> {
        self.expiration
    }

    pub fn ttl(&self) -> Option<i64> {
        self.ttl
    }

    pub fn modified_index(&self) -> u64 {
        self.modified_index
    }

    pub fn created_index(&self) -> u64 {
        self.created_index
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn into_nodes(self) -> Vec<Node> {
        self.nodes
    }

    /// Looks up `key` inside this subtree
    pub fn find(
        &self,
        key: &str,
    ) -> Option<&Node> {
        if self.key == key {
            return Some(self);
        }
        self.nodes
            .iter()
            .find(|child| crate::utils::key::is_within(&child.key, key))
            .and_then(|child| child.find(key))
    }

    /// Leaves of this subtree, depth first, in child order
    pub fn leaves(&self) -> Vec<&Node> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves<'a>(
        &'a self,
        out: &mut Vec<&'a Node>,
    ) {
        if !self.dir {
            out.push(self);
            return;
        }
        for child in &self.nodes {
            child.collect_leaves(out);
        }
    }
}
