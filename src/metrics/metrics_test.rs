use super::*;

fn create_test_registry() -> Registry {
    let registry = Registry::new_custom(Some("registry_store".to_string()), None).unwrap();
    register_custom_metrics(&registry);
    registry
}

#[test]
fn test_custom_registry() {
    let registry = create_test_registry();

    STORAGE_OP_ERRORS
        .with_label_values(&["get", "not_found"])
        .inc();
    let metrics = &registry.gather();
    assert!(!metrics.is_empty());

    let metric_names: Vec<_> = metrics.iter().map(|m| m.get_name()).collect();
    assert!(
        metric_names.contains(&"registry_store_storage_op_errors"),
        "Missing registry_store_storage_op_errors"
    );
}

#[test]
fn test_record_error_uses_kind_label() {
    let err = Error::not_found("/registry/svc-a");
    let before = STORAGE_OP_ERRORS
        .with_label_values(&["update", "not_found"])
        .get();

    record_error("update", &err);

    let after = STORAGE_OP_ERRORS
        .with_label_values(&["update", "not_found"])
        .get();
    assert_eq!(after, before + 1);
}

#[test]
fn test_error_kind_groups_conflicts() {
    assert_eq!(error_kind(&Error::NotAFile { key: "/a".into() }), "conflict");
    assert_eq!(
        error_kind(&Error::NotADirectory { key: "/a/b".into() }),
        "conflict"
    );
}

#[test]
fn test_encode_metrics_is_text_format() {
    WATCH_OVERFLOWS.inc();
    let body = encode_metrics();
    assert!(body.contains("watch_overflows"));
}
