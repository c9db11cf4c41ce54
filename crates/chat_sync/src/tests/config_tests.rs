use std::{collections::HashMap, fs, time::Duration};

use super::*;

fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |key| map.get(key).cloned()
}

#[test]
fn defaults_match_backend_limits() {
    let settings = SyncSettings::default();
    assert_eq!(settings.max_concurrent_requests, 3);
    assert_eq!(settings.max_retry_attempts, 5);
    assert_eq!(settings.retry_base_delay, Duration::from_millis(1000));
    assert_eq!(settings.cache_ttl, Duration::from_secs(300));
    assert_eq!(settings.message_fallback_limit, 100);
}

#[test]
fn file_values_override_defaults() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("chat_sync.toml");
    fs::write(
        &path,
        "max_concurrent_requests = 5\ncache_ttl_secs = 60\ngame_channel_prefix = \"match-\"\n",
    )
    .expect("write settings");

    let mut settings = SyncSettings::default();
    apply_file(&mut settings, &path).expect("apply file");

    assert_eq!(settings.max_concurrent_requests, 5);
    assert_eq!(settings.cache_ttl, Duration::from_secs(60));
    assert_eq!(settings.game_channel_prefix, "match-");
    assert_eq!(settings.max_retry_attempts, 5);
}

#[test]
fn unreadable_file_is_an_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let missing = dir.path().join("missing.toml");
    let err = load_settings_from(&missing).expect_err("must fail");
    assert!(err.to_string().contains("failed to read settings file"));
}

#[test]
fn malformed_toml_is_an_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("chat_sync.toml");
    fs::write(&path, "max_concurrent_requests = \"many\"").expect("write settings");

    let mut settings = SyncSettings::default();
    let err = apply_file(&mut settings, &path).expect_err("must fail");
    assert!(err.to_string().contains("failed to parse settings file"));
}

#[test]
fn env_overrides_take_precedence() {
    let mut settings = SyncSettings::default();
    apply_env_overrides(
        &mut settings,
        env_from(&[
            ("CHAT_SYNC__MAX_RETRY_ATTEMPTS", "2"),
            ("CHAT_SYNC__RETRY_BASE_DELAY_MS", "10"),
            ("CHAT_SYNC__DISCOVERY_PHASE_DELAY_MS", "0"),
        ]),
    );

    assert_eq!(settings.max_retry_attempts, 2);
    assert_eq!(settings.retry_base_delay, Duration::from_millis(10));
    assert_eq!(settings.discovery_phase_delay, Duration::ZERO);
}

#[test]
fn malformed_env_values_are_ignored() {
    let mut settings = SyncSettings::default();
    apply_env_overrides(
        &mut settings,
        env_from(&[("CHAT_SYNC__MAX_CONCURRENT_REQUESTS", "three")]),
    );
    assert_eq!(settings.max_concurrent_requests, 3);
}
