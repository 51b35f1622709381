//! Config file loading and lookup

use rt_core::config::TunnelConfig;
use rt_core::{Mapping, TunnelError};

#[test]
fn test_json_file_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");

    let config = TunnelConfig::new()
        .with_server("https://relay.example.com", "/socket.io")
        .with_secret_key("s3cret")
        .with_mapping(Mapping::new("10.0.0.5", 22).with_local_port(2222))
        .with_blacklisted_address("192.168.1.20");
    config.save(&path).unwrap();

    let raw = std::fs::read_to_string(&path).unwrap();
    assert!(raw.contains("\"secretKey\""));
    assert!(raw.contains("\"iceAddrBlacklist\""));
    assert!(raw.contains("\"remotePort\": 22"));

    assert_eq!(TunnelConfig::load(&path).unwrap(), config);
}

#[test]
fn test_toml_file_is_parsed_as_toml() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rtunnel.toml");
    std::fs::write(
        &path,
        r#"
secretKey = "k"
tunnelLimit = 10

[server]
url = "http://localhost:3000"

[[mapping]]
remoteIp = "10.0.0.5"
remotePort = 22
"#,
    )
    .unwrap();

    let config = TunnelConfig::load(&path).unwrap();
    assert_eq!(config.server.path, "/socket.io");
    assert_eq!(config.tunnel_limit, 10);
    assert_eq!(config.mapping, vec![Mapping::new("10.0.0.5", 22)]);
    assert!(config.validate().is_ok());
}

#[test]
fn test_malformed_file_is_a_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(&path, "{ not json").unwrap();

    assert!(matches!(
        TunnelConfig::load(&path),
        Err(TunnelError::ConfigError(_))
    ));
}

#[test]
fn test_locate_prefers_dev_config() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("config.json"), "{}").unwrap();
    assert_eq!(
        TunnelConfig::locate_in(Some(dir.path())).unwrap(),
        dir.path().join("config.json")
    );

    std::fs::write(dir.path().join("config.dev.json"), "{}").unwrap();
    assert_eq!(
        TunnelConfig::locate_in(Some(dir.path())).unwrap(),
        dir.path().join("config.dev.json")
    );
}

#[test]
fn test_validate_rejects_unusable_tunables() {
    let base = TunnelConfig::new()
        .with_server("http://localhost:3000", "/socket.io")
        .with_mapping(Mapping::new("10.0.0.5", 22));
    assert!(base.validate().is_ok());

    let mut zero_interval = base.clone();
    zero_interval.heartbeat_interval_ms = 0;
    assert!(matches!(
        zero_interval.validate(),
        Err(TunnelError::ConfigError(message)) if message.contains("heartbeatIntervalMs")
    ));

    let mut zero_threshold = base.clone();
    zero_threshold.heartbeat_error_threshold = 0;
    assert!(matches!(
        zero_threshold.validate(),
        Err(TunnelError::ConfigError(message)) if message.contains("heartbeatErrorThreshold")
    ));

    let zero_limit = base.with_tunnel_limit(0);
    assert!(matches!(
        zero_limit.validate(),
        Err(TunnelError::ConfigError(message)) if message.contains("tunnelLimit")
    ));
}
