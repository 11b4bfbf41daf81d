//! Slash-delimited key paths
//!
//! Keys are normalised to an absolute form: a leading `/`, no trailing `/` and
//! no empty segments. The root of the namespace is `/`.

use crate::constants::KEY_SEPARATOR;
use crate::constants::ROOT_KEY;
use crate::Error;
use crate::Result;

/// Returns the canonical form of `key`
///
/// `""`, `"/"` and `"//"` all name the root. `.` and `..` segments are rejected,
/// as are keys containing NUL bytes.
pub fn normalize(key: &str) -> Result<String> {
    if key.contains('\0') {
        return Err(Error::InvalidKey {
            key: key.to_string(),
            reason: "contains NUL byte",
        });
    }

    let mut normalized = String::with_capacity(key.len() + 1);
    for segment in key.split(KEY_SEPARATOR).filter(|s| !s.is_empty()) {
        if segment == "." || segment == ".." {
            return Err(Error::InvalidKey {
                key: key.to_string(),
                reason: "relative segment",
            });
        }
        normalized.push(KEY_SEPARATOR);
        normalized.push_str(segment);
    }

    if normalized.is_empty() {
        normalized.push_str(ROOT_KEY);
    }
    Ok(normalized)
}

pub fn is_root(key: &str) -> bool {
    key == ROOT_KEY
}

/// Prefix shared by every descendant of `key`
pub fn subtree_prefix(key: &str) -> String {
    if is_root(key) {
        ROOT_KEY.to_string()
    } else {
        format!("{key}{KEY_SEPARATOR}")
    }
}

/// True when `candidate` is `root` itself or lives beneath it
pub fn is_within(
    root: &str,
    candidate: &str,
) -> bool {
    is_within_bytes(root, candidate.as_bytes())
}

/// [`is_within`] over a raw key that may not be valid UTF-8
pub fn is_within_bytes(
    root: &str,
    candidate: &[u8],
) -> bool {
    let separator = KEY_SEPARATOR as u8;
    if is_root(root) {
        return candidate.first() == Some(&separator);
    }
    candidate == root.as_bytes()
        || (candidate.starts_with(root.as_bytes())
            && candidate.get(root.len()) == Some(&separator))
}

/// Proper ancestors of `key`, outermost first, excluding the root
///
/// `/a/b/c` yields `["/a", "/a/b"]`.
pub fn ancestors(key: &str) -> Vec<String> {
    let mut result = Vec::new();
    for (idx, ch) in key.char_indices().skip(1) {
        if ch == KEY_SEPARATOR {
            result.push(key[..idx].to_string());
        }
    }
    result
}

/// Parent of `key`; the root is its own parent
pub fn parent(key: &str) -> &str {
    match key.rfind(KEY_SEPARATOR) {
        Some(0) | None => ROOT_KEY,
        Some(idx) => &key[..idx],
    }
}

/// Smallest key greater than every key starting with `prefix`
///
/// A prefix made only of `0xff` bytes has no upper bound; `[0]` is returned,
/// which etcd reads as the end of the key space.
pub fn prefix_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return end;
        }
    }
    vec![0]
}
