use super::*;

fn env(vars: &[(&str, &str)]) -> config::Environment {
    let map = vars
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect::<config::Map<String, String>>();
    config::Environment::with_prefix("APP")
        .separator("__")
        .try_parsing(true)
        .source(Some(map))
}

#[test]
fn defaults_apply_without_sources() {
    let settings = build_settings("does-not-exist", env(&[])).expect("settings");
    assert_eq!(settings.bind_addr, "127.0.0.1:8443");
    assert_eq!(settings.call_ring_timeout_seconds, 30);
    assert_eq!(settings.initiate_dedup_window_seconds, 10);
    assert_eq!(settings.ring_timeout(), Duration::from_secs(30));
}

#[test]
fn environment_overrides_defaults() {
    let settings = build_settings(
        "does-not-exist",
        env(&[
            ("APP__BIND_ADDR", "0.0.0.0:9000"),
            ("APP__CALL_RING_TIMEOUT_SECONDS", "45"),
            ("APP__LIVEKIT_API_SECRET", "prod-secret"),
            ("APP__DATABASE_URL", "./var/calls.db"),
        ]),
    )
    .expect("settings");
    assert_eq!(settings.bind_addr, "0.0.0.0:9000");
    assert_eq!(settings.call_ring_timeout_seconds, 45);
    assert_eq!(settings.livekit().api_secret, "prod-secret");
    assert_eq!(settings.database_url, "sqlite://./var/calls.db");
}

#[test]
fn zero_ring_timeout_is_rejected() {
    let err = build_settings(
        "does-not-exist",
        env(&[("APP__CALL_RING_TIMEOUT_SECONDS", "0")]),
    )
    .expect_err("zero timeout");
    assert!(err.to_string().contains("call_ring_timeout_seconds"));
}

#[test]
fn call_policy_uses_dedup_window() {
    let settings = Settings {
        initiate_dedup_window_seconds: 3,
        ..Settings::default()
    };
    assert_eq!(
        settings.call_policy().initiate_dedup_window,
        chrono::Duration::seconds(3)
    );
}

#[test]
fn normalizes_plain_file_path_to_sqlite_url() {
    assert_eq!(
        normalize_database_url("./data/test.db"),
        "sqlite://./data/test.db"
    );
}

#[test]
fn keeps_memory_and_full_urls() {
    assert_eq!(normalize_database_url("sqlite::memory:"), "sqlite::memory:");
    assert_eq!(
        normalize_database_url("sqlite://./data/a.db?mode=rwc"),
        "sqlite://./data/a.db?mode=rwc"
    );
    assert_eq!(
        normalize_database_url("  "),
        Settings::default().database_url
    );
}

#[test]
fn converts_windows_separators() {
    assert_eq!(
        normalize_database_url("sqlite:data\\calls.db"),
        "sqlite://data/calls.db"
    );
}
