use mewld::config::Config;

const MINIMAL: &str = r#"
names:
  - "selene"
  - "artemis"
redis: "localhost:6379"
redis_channel: "test_channel"
module: "mew"
"#;

#[test]
fn test_minimal_config_gets_defaults() {
    let config = Config::from_yaml(MINIMAL).unwrap();

    assert_eq!(config.ping_timeout, 120);
    assert_eq!(config.ping_interval, 60);
    assert_eq!(config.cluster_start_next_delay, 5);
    assert_eq!(config.per_cluster, 10);
    assert_eq!(config.minimum_safe_sessions_remaining, 5);
    assert_eq!(config.fixed_shard_count, 0);
    assert_eq!(config.rolling_restart_timeout, 300);
    assert!(config.experimental_features.is_empty());
    assert!(!config.reshard_all);
    assert!(config.interp.is_none());
    assert_eq!(config.gateway_url, "https://discord.com/api/gateway/bot");
}

#[test]
fn test_full_config_round_trips_values() {
    let config = Config::from_yaml(
        r#"
token: "abc123"
dir: "mewbot"
names: ["a", "b", "c"]
redis: "redis://127.0.0.1:6379/0"
redis_channel: "chan"
module: "mew"
interp: "/usr/bin/python3.11"
ping_timeout: 30
ping_interval: 15
per_cluster: 4
fixed_shard_count: 16
experimental_features: ["reshard"]
oauth:
  client_id: "cid"
  client_secret: "secret"
  redirect_url: "https://example.com/cb"
"#,
    )
    .unwrap();

    assert_eq!(config.token.as_deref(), Some("abc123"));
    assert_eq!(config.per_cluster, 4);
    assert_eq!(config.fixed_shard_count, 16);
    assert_eq!(config.interp.as_deref(), Some("/usr/bin/python3.11"));
    assert!(config.experimental_features.iter().any(|f| f == "reshard"));
    assert_eq!(config.oauth.unwrap().client_id, "cid");
}

#[test]
fn test_empty_names_are_rejected() {
    let err = Config::from_yaml(
        r#"
names: []
redis: "localhost:6379"
redis_channel: "chan"
module: "mew"
"#,
    )
    .unwrap_err();
    assert!(err.to_string().contains("names"));
}

#[test]
fn test_zero_per_cluster_is_rejected() {
    let err = Config::from_yaml(
        r#"
names: ["a"]
redis: "localhost:6379"
redis_channel: "chan"
module: "mew"
per_cluster: 0
"#,
    )
    .unwrap_err();
    assert!(err.to_string().contains("per_cluster"));
}

#[test]
fn test_blank_module_is_rejected() {
    let err = Config::from_yaml(
        r#"
names: ["a"]
redis: "localhost:6379"
redis_channel: "chan"
module: "  "
"#,
    )
    .unwrap_err();
    assert!(err.to_string().contains("module"));
}

// All three token cases live in one test: env vars are process-global and
// the test harness runs functions in parallel.
#[test]
fn test_token_resolution_prefers_the_env_var() {
    let mut config = Config::from_yaml(MINIMAL).unwrap();

    // No token anywhere is a hard error.
    assert!(config.resolve_token().is_err());

    config.token = Some("from-config".to_string());
    assert_eq!(config.resolve_token().unwrap(), "from-config");

    unsafe { std::env::set_var("MTOKEN", "from-env") };
    let resolved = config.resolve_token();
    unsafe { std::env::remove_var("MTOKEN") };
    assert_eq!(resolved.unwrap(), "from-env");
}

#[test]
fn test_override_dir_wins_directory_resolution() {
    let mut config = Config::from_yaml(MINIMAL).unwrap();
    config.override_dir = Some("/srv/bot".to_string());
    config.use_current_directory = true;

    let dir = config.resolve_directory().unwrap();
    assert_eq!(dir, std::path::PathBuf::from("/srv/bot"));
}

#[test]
fn test_current_directory_resolution() {
    let mut config = Config::from_yaml(MINIMAL).unwrap();
    config.use_current_directory = true;

    let dir = config.resolve_directory().unwrap();
    assert_eq!(dir, std::env::current_dir().unwrap());
}

#[test]
fn test_home_relative_directory_resolution() {
    let mut config = Config::from_yaml(MINIMAL).unwrap();
    config.dir = "mewbot".to_string();

    let home = std::env::var("HOME").unwrap();
    let dir = config.resolve_directory().unwrap();
    assert_eq!(dir, std::path::PathBuf::from(home).join("mewbot"));
}
