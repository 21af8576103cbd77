use std::time::Duration;

use exec_daemon::config::ClientConfig;
use exec_daemon::{AppError, DaemonConfig};

fn sample_toml() -> &'static str {
    r#"
[server]
bind_address = "127.0.0.1"
port = 12345
max_frame_bytes = 1048576
worker_threads = 2

[client]
host = "daemon.local"
port = 12345
connect_timeout_seconds = 3
retry_interval_ms = 50
"#
}

#[test]
fn parses_valid_config() {
    let config = DaemonConfig::from_toml_str(sample_toml()).expect("config parses");

    assert_eq!(config.server.bind_address.as_deref(), Some("127.0.0.1"));
    assert_eq!(config.server.port, 12345);
    assert_eq!(config.server.max_frame_bytes, 1_048_576);
    assert_eq!(config.server.worker_threads, 2);
    assert_eq!(config.client.host, "daemon.local");
    assert_eq!(config.client.port, Some(12345));
    assert_eq!(config.client.connect_timeout(), Duration::from_secs(3));
    assert_eq!(config.client.retry_interval(), Duration::from_millis(50));
}

#[test]
fn empty_config_uses_defaults() {
    let config = DaemonConfig::from_toml_str("").expect("empty config parses");

    assert_eq!(config, DaemonConfig::default());
    assert_eq!(config.server.bind_address, None);
    assert_eq!(config.server.port, 0);
    assert_eq!(config.server.max_frame_bytes, 64 * 1024 * 1024);
    assert_eq!(config.server.worker_threads, 4);
    assert_eq!(config.client.host, "127.0.0.1");
    assert_eq!(config.client.port, None);
    assert_eq!(config.client.connect_timeout(), Duration::from_secs(10));
    assert_eq!(config.client.retry_interval(), Duration::from_millis(200));
}

#[test]
fn zero_worker_threads_is_rejected() {
    let result = DaemonConfig::from_toml_str("[server]\nworker_threads = 0\n");
    assert!(matches!(result, Err(AppError::Config(msg)) if msg.contains("worker_threads")));
}

#[test]
fn zero_frame_limit_is_rejected() {
    let result = DaemonConfig::from_toml_str("[server]\nmax_frame_bytes = 0\n");
    assert!(matches!(result, Err(AppError::Config(msg)) if msg.contains("max_frame_bytes")));
}

#[test]
fn blank_client_host_is_rejected() {
    let result = DaemonConfig::from_toml_str("[client]\nhost = \"  \"\n");
    assert!(matches!(result, Err(AppError::Config(_))));
}

#[test]
fn zero_retry_interval_is_rejected() {
    let result = DaemonConfig::from_toml_str("[client]\nretry_interval_ms = 0\n");
    assert!(matches!(result, Err(AppError::Config(msg)) if msg.contains("retry_interval_ms")));
}

#[test]
fn out_of_range_port_fails_to_parse() {
    let result = DaemonConfig::from_toml_str("[server]\nport = 70000\n");
    assert!(matches!(result, Err(AppError::Config(msg)) if msg.starts_with("invalid config")));
}

#[test]
fn client_port_is_required_to_connect() {
    let err = ClientConfig::default().require_port().expect_err("no port");
    assert!(matches!(err, AppError::Config(_)));

    let config = ClientConfig::for_address("localhost", 9000);
    assert_eq!(config.require_port().expect("port set"), 9000);
    assert_eq!(config.host, "localhost");
}

#[test]
fn loads_from_path() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("exec-daemon.toml");
    std::fs::write(&path, sample_toml()).expect("write config");

    let config = DaemonConfig::load_from_path(&path).expect("config loads");
    assert_eq!(config.server.port, 12345);
}

#[test]
fn missing_file_is_a_config_error() {
    let temp = tempfile::tempdir().expect("tempdir");
    let result = DaemonConfig::load_from_path(temp.path().join("absent.toml"));
    assert!(matches!(result, Err(AppError::Config(msg)) if msg.contains("failed to read config")));
}
