use ct_domain::config::{Config, ConfigSeverity};

#[test]
fn default_config_is_valid() {
    let config = Config::default();
    let errors: Vec<_> = config
        .validate()
        .into_iter()
        .filter(|e| e.severity == ConfigSeverity::Error)
        .collect();
    assert!(errors.is_empty(), "unexpected errors: {errors:?}");
}

#[test]
fn default_backoff_matches_reconnect_contract() {
    let config = Config::default();
    assert_eq!(config.connection.base_delay_ms, 5_000);
    assert_eq!(config.connection.max_delay_ms, 60_000);
    assert_eq!(config.catchup.prefill_channels, 10);
}

#[test]
fn default_server_binds_localhost() {
    let config = Config::default();
    assert_eq!(config.server.host, "127.0.0.1");
}

#[test]
fn partial_toml_fills_remaining_defaults() {
    let toml_str = r#"
[connection]
base_delay_ms = 1000

[catchup]
backfill_depth = 30
"#;
    let config: Config = toml::from_str(toml_str).unwrap();
    assert_eq!(config.connection.base_delay_ms, 1_000);
    assert_eq!(config.connection.max_delay_ms, 60_000);
    assert_eq!(config.catchup.backfill_depth, 30);
    assert_eq!(config.identity.ttl_ms, 24 * 60 * 60 * 1_000);
}

#[test]
fn max_below_base_is_an_error() {
    let toml_str = r#"
[connection]
base_delay_ms = 10000
max_delay_ms = 5000
"#;
    let config: Config = toml::from_str(toml_str).unwrap();
    let issues = config.validate();
    assert!(issues
        .iter()
        .any(|e| e.field == "connection.max_delay_ms" && e.severity == ConfigSeverity::Error));
}

#[test]
fn unbounded_identity_cache_is_a_warning() {
    let toml_str = r#"
[identity]
max_entries = 0
"#;
    let config: Config = toml::from_str(toml_str).unwrap();
    let issue = config
        .validate()
        .into_iter()
        .find(|e| e.field == "identity.max_entries")
        .unwrap();
    assert_eq!(issue.severity, ConfigSeverity::Warning);
}
