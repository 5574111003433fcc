use std::collections::HashMap;
use std::fs;

use serial_test::serial;
use tempfile::TempDir;

use super::settings::Settings;
use super::{HostConfig, NSQ_ADDR_KEY, NSQ_LOOKUPD_ADDR_KEY, load_config_from};

const NSQ_VARS: [&str; 6] = [
    "NSQ_ADDR",
    "NSQ_LOOKUPD_ADDR",
    "NSQ_AUTO_CREATE_TOPIC",
    "NSQ_LOG_LEVEL",
    "NSQ_MAX_IN_FLIGHT",
    "NSQ_CONCURRENCY",
];

#[test]
fn test_default_settings() {
    let settings = Settings::default();
    assert_eq!(settings.addr, "127.0.0.1:4150");
    assert_eq!(settings.lookupd_addr, "127.0.0.1:4161");
    assert!(!settings.auto_create_topic);
    assert_eq!(settings.log_level, "info");
    assert_eq!(settings.max_in_flight, 1);
    assert_eq!(settings.concurrency, 1);
}

#[test]
#[serial]
fn test_missing_file_and_env_falls_back_to_defaults() {
    temp_env::with_vars_unset(NSQ_VARS, || {
        let tmp = TempDir::new().expect("create tempdir");
        let stem = tmp.path().join("missing");
        let settings = load_config_from(stem.to_str().unwrap()).expect("load_config failed");
        assert_eq!(settings, Settings::default());
    });
}

#[test]
#[serial]
fn test_env_overrides_defaults() {
    temp_env::with_vars_unset(NSQ_VARS, || {
        temp_env::with_vars(
            [
                ("NSQ_ADDR", Some("10.0.0.5:4150")),
                ("NSQ_LOOKUPD_ADDR", Some("10.0.0.6:4161")),
                ("NSQ_AUTO_CREATE_TOPIC", Some("true")),
                ("NSQ_MAX_IN_FLIGHT", Some("8")),
            ],
            || {
                let tmp = TempDir::new().expect("create tempdir");
                let stem = tmp.path().join("missing");
                let settings =
                    load_config_from(stem.to_str().unwrap()).expect("load_config failed");
                assert_eq!(settings.addr, "10.0.0.5:4150");
                assert_eq!(settings.lookupd_addr, "10.0.0.6:4161");
                assert!(settings.auto_create_topic);
                assert_eq!(settings.max_in_flight, 8);
                assert_eq!(settings.concurrency, 1);
            },
        );
    });
}

#[test]
#[serial]
fn test_file_overrides_defaults() {
    temp_env::with_vars_unset(NSQ_VARS, || {
        let tmp = TempDir::new().expect("create tempdir");
        let toml = r#"
            addr = "nsqd.internal:4150"
            lookupd_addr = "lookupd.internal:4161"
            log_level = "debug"
            concurrency = 4
        "#;
        fs::write(tmp.path().join("nsq.toml"), toml).expect("write config file");

        let stem = tmp.path().join("nsq");
        let settings = load_config_from(stem.to_str().unwrap()).expect("load_config failed");
        assert_eq!(settings.addr, "nsqd.internal:4150");
        assert_eq!(settings.lookupd_addr, "lookupd.internal:4161");
        assert_eq!(settings.log_level, "debug");
        assert_eq!(settings.concurrency, 4);
        assert_eq!(settings.max_in_flight, 1);
    });
}

#[test]
fn test_zero_counts_fall_back_to_defaults() {
    let partial = super::PartialSettings {
        max_in_flight: Some(0),
        concurrency: Some(0),
        ..Default::default()
    };
    let settings = partial.merge(Settings::default());
    assert_eq!(settings.max_in_flight, 1);
    assert_eq!(settings.concurrency, 1);
}

#[test]
fn test_settings_host_config_lookup() {
    let settings = Settings {
        addr: "nsqd:4150".to_string(),
        ..Settings::default()
    };
    assert_eq!(settings.get(NSQ_ADDR_KEY).as_deref(), Some("nsqd:4150"));
    assert_eq!(
        settings.get(NSQ_LOOKUPD_ADDR_KEY).as_deref(),
        Some("127.0.0.1:4161")
    );
    assert_eq!(settings.get("SOMETHING_ELSE"), None);
}

#[test]
fn test_map_host_config_falls_back_on_missing_or_empty() {
    let mut values = HashMap::new();
    values.insert(NSQ_ADDR_KEY.to_string(), String::new());
    values.insert(NSQ_LOOKUPD_ADDR_KEY.to_string(), "lookupd:4161".to_string());

    assert_eq!(values.get_or(NSQ_ADDR_KEY, "127.0.0.1:4150"), "127.0.0.1:4150");
    assert_eq!(values.get_or(NSQ_LOOKUPD_ADDR_KEY, "x"), "lookupd:4161");
    assert_eq!(values.get_or("UNSET", "fallback"), "fallback");
}
