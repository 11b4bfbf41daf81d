//! Flat entry list to [`Node`] tree assembly
//!
//! Backends answer a subtree read with a key-sorted list of leaves. The assembler
//! rebuilds the directory levels implied by the `/` separated keys, recursing into
//! every level with no depth limit.

use std::collections::HashMap;
use std::time::SystemTime;

use tracing::debug;

use crate::utils::key;
use crate::ConversionError;
use crate::Node;

/// One leaf as reported by a backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    pub key: String,
    pub value: String,
    pub created_index: u64,
    pub modified_index: u64,
    pub expiration: Option<SystemTime>,
}

impl KvEntry {
    pub(crate) fn into_leaf(
        self,
        now: SystemTime,
    ) -> Node {
        Node::leaf(
            self.key,
            self.value,
            self.created_index,
            self.modified_index,
            self.expiration,
            now,
        )
    }

    fn to_leaf(
        &self,
        now: SystemTime,
    ) -> Node {
        Node::leaf(
            self.key.clone(),
            self.value.clone(),
            self.created_index,
            self.modified_index,
            self.expiration,
            now,
        )
    }
}

/// Builds the subtree rooted at `root` from `entries`
///
/// `entries` must be sorted by key, as returned by the backend. Returns `None`
/// when nothing exists at or beneath `root`. Any entry outside the subtree fails
/// the whole conversion.
pub fn assemble(
    root: &str,
    entries: &[KvEntry],
    now: SystemTime,
) -> Result<Option<Node>, ConversionError> {
    for entry in entries {
        if !key::is_within(root, &entry.key) {
            return Err(ConversionError::OutsideRoot {
                root: root.to_string(),
                key: entry.key.clone(),
            });
        }
    }

    let descendants: Vec<&KvEntry> = entries.iter().filter(|e| e.key != root).collect();
    if descendants.is_empty() {
        return Ok(entries.iter().find(|e| e.key == root).map(|e| e.to_leaf(now)));
    }

    if entries.iter().any(|e| e.key == root) {
        debug!(key = %root, "leaf shadowed by descendants, reading as directory");
    }
    Ok(Some(build_directory(root, &descendants, now)))
}

fn build_directory(
    dir_key: &str,
    descendants: &[&KvEntry],
    now: SystemTime,
) -> Node {
    let prefix = key::subtree_prefix(dir_key);

    // Group by first segment below `dir_key`, keeping first-appearance order.
    let mut groups: Vec<(String, Vec<&KvEntry>)> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();
    for entry in descendants {
        let rest = &entry.key[prefix.len()..];
        let segment = rest.split('/').next().unwrap_or(rest);
        let child_key = format!("{prefix}{segment}");
        match positions.get(&child_key) {
            Some(&pos) => groups[pos].1.push(entry),
            None => {
                positions.insert(child_key.clone(), groups.len());
                groups.push((child_key, vec![*entry]));
            }
        }
    }

    let children = groups
        .into_iter()
        .map(|(child_key, members)| {
            let below: Vec<&KvEntry> =
                members.iter().copied().filter(|e| e.key != child_key).collect();
            if below.is_empty() {
                // Only the child itself: a leaf.
                members[0].to_leaf(now)
            } else {
                build_directory(&child_key, &below, now)
            }
        })
        .collect();

    Node::directory(dir_key, children)
}
