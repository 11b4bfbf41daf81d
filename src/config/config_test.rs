use serial_test::serial;
use temp_env::with_vars;

use super::*;

fn cleanup_all_registry_env_vars() {
    for (key, _) in std::env::vars() {
        if key.starts_with("REGISTRY__") || key == "CONFIG_PATH" {
            std::env::remove_var(&key);
        }
    }
}

#[test]
#[serial]
fn default_config_should_initialize_with_hardcoded_values() {
    let config = StorageConfig::default();

    assert_eq!(config.backend.endpoints, vec!["http://127.0.0.1:2379"]);
    assert_eq!(config.backend.request_timeout_in_ms, 5000);
    assert_eq!(config.lease.heartbeat_delay_in_secs, 20);
    assert_eq!(config.lease.heartbeat_interval_in_secs, 10);
    assert_eq!(config.watch.buffer_size, 1000);
    assert!(config.validate().is_ok());
}

#[test]
#[serial]
fn new_should_merge_environment_overrides() {
    cleanup_all_registry_env_vars();
    with_vars(
        vec![
            ("REGISTRY__WATCH__BUFFER_SIZE", Some("64")),
            ("REGISTRY__LEASE__HEARTBEAT_DELAY_IN_SECS", Some("30")),
        ],
        || {
            let config = StorageConfig::new().unwrap();

            assert_eq!(config.watch.buffer_size, 64);
            assert_eq!(config.lease.heartbeat_delay_in_secs, 30);
        },
    );
}

#[test]
#[serial]
fn new_should_parse_endpoint_list_from_environment() {
    cleanup_all_registry_env_vars();
    with_vars(
        vec![(
            "REGISTRY__BACKEND__ENDPOINTS",
            Some("http://10.0.0.5:2379,http://10.0.0.6:2379"),
        )],
        || {
            let config = StorageConfig::new().unwrap();

            assert_eq!(
                config.backend.endpoints,
                vec!["http://10.0.0.5:2379", "http://10.0.0.6:2379"]
            );
        },
    );
}

#[test]
#[serial]
fn with_override_config_should_merge_file_settings() {
    cleanup_all_registry_env_vars();
    let temp_dir = tempfile::tempdir().unwrap();
    let config_path = temp_dir.path().join("override.toml");

    std::fs::write(
        &config_path,
        r#"
        [backend]
        endpoints = ["http://etcd-0:2379", "http://etcd-1:2379"]

        [lease]
        heartbeat_delay_in_secs = 60
        heartbeat_interval_in_secs = 15
        "#,
    )
    .unwrap();

    let empty_vars: Vec<(&str, Option<&str>)> = vec![];
    with_vars(empty_vars, || {
        let base_config = StorageConfig::new().expect("success");
        let config = base_config
            .with_override_config(config_path.to_str().unwrap())
            .unwrap();

        assert_eq!(config.backend.endpoints.len(), 2);
        assert_eq!(config.lease.heartbeat_delay_in_secs, 60);
        assert_eq!(config.lease.heartbeat_interval_in_secs, 15);
        // Untouched sections keep their defaults
        assert_eq!(config.watch.buffer_size, 1000);
    });
}

#[test]
#[serial]
fn environment_variables_should_have_highest_priority() {
    cleanup_all_registry_env_vars();
    let temp_dir = tempfile::tempdir().unwrap();
    let config_path = temp_dir.path().join("registry.toml");
    std::fs::write(
        &config_path,
        r#"
        [watch]
        buffer_size = 10
        history_size = 20
        "#,
    )
    .unwrap();

    with_vars(
        vec![
            ("CONFIG_PATH", Some(config_path.to_str().unwrap())),
            ("REGISTRY__WATCH__BUFFER_SIZE", Some("99")),
        ],
        || {
            let config = StorageConfig::new().unwrap();

            assert_eq!(config.watch.buffer_size, 99);
            assert_eq!(config.watch.history_size, 20);
        },
    );
}

#[test]
#[serial]
fn missing_config_path_file_should_fail() {
    cleanup_all_registry_env_vars();
    with_vars(
        vec![("CONFIG_PATH", Some("/definitely/not/here/registry.toml"))],
        || {
            assert!(StorageConfig::new().is_err());
        },
    );
}

#[test]
fn validation_should_fail_with_empty_endpoints() {
    let mut config = StorageConfig::default();
    config.backend.endpoints.clear();

    assert!(config.validate().is_err());
}

#[test]
fn validation_should_fail_with_blank_endpoint() {
    let mut config = StorageConfig::default();
    config.backend.endpoints.push("  ".to_string());

    assert!(config.validate().is_err());
}

#[test]
fn validation_should_fail_with_zero_watch_buffer() {
    let mut config = StorageConfig::default();
    config.watch.buffer_size = 0;

    assert!(matches!(config.validate(), Err(crate::Error::Config(_))));
}
