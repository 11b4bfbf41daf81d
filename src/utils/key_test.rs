use super::key::*;
use crate::Error;

#[test]
fn test_normalize_adds_leading_separator() {
    assert_eq!(normalize("registry/svc-a").unwrap(), "/registry/svc-a");
}

#[test]
fn test_normalize_collapses_empty_segments() {
    assert_eq!(normalize("//registry///svc-a/").unwrap(), "/registry/svc-a");
}

#[test]
fn test_normalize_root_forms() {
    assert_eq!(normalize("").unwrap(), "/");
    assert_eq!(normalize("/").unwrap(), "/");
    assert_eq!(normalize("///").unwrap(), "/");
}

#[test]
fn test_normalize_rejects_relative_segments() {
    let err = normalize("/registry/../secrets").unwrap_err();
    assert!(matches!(err, Error::InvalidKey { .. }));
    assert!(normalize("/./a").is_err());
}

#[test]
fn test_normalize_rejects_nul() {
    assert!(matches!(
        normalize("/a\0b"),
        Err(Error::InvalidKey { reason: "contains NUL byte", .. })
    ));
}

#[test]
fn test_subtree_prefix() {
    assert_eq!(subtree_prefix("/"), "/");
    assert_eq!(subtree_prefix("/registry"), "/registry/");
}

#[test]
fn test_is_within() {
    assert!(is_within("/registry", "/registry"));
    assert!(is_within("/registry", "/registry/svc-a"));
    assert!(is_within("/registry", "/registry/svc-a/instance-1"));
    assert!(!is_within("/registry", "/registry2"));
    assert!(!is_within("/registry", "/regis"));
    assert!(is_within("/", "/anything/at/all"));
}

#[test]
fn test_is_within_bytes_keeps_undecodable_keys_in_scope() {
    assert!(is_within_bytes("/registry", b"/registry/\xff\xfe"));
    assert!(!is_within_bytes("/registry", b"/registry\xff"));
    assert!(is_within_bytes("/", b"/\xff"));
    assert!(!is_within_bytes("/", b"\xff"));
}

#[test]
fn test_ancestors() {
    assert_eq!(ancestors("/a/b/c"), vec!["/a".to_string(), "/a/b".to_string()]);
    assert!(ancestors("/a").is_empty());
    assert!(ancestors("/").is_empty());
}

#[test]
fn test_parent() {
    assert_eq!(parent("/a/b/c"), "/a/b");
    assert_eq!(parent("/a"), "/");
    assert_eq!(parent("/"), "/");
}

#[test]
fn test_prefix_end() {
    assert_eq!(prefix_end(b"/registry"), b"/registrz".to_vec());
    assert_eq!(prefix_end(&[b'a', 0xff]), vec![b'b']);
    assert_eq!(prefix_end(&[0xff, 0xff]), vec![0]);
}
