//! Config loading, TOML layering, and env var override tests.
//!
//! Some tests are `#[ignore]` (they chdir or set env vars and conflict in parallel).
//! Run them with: `cargo test --test config_tests -- --ignored --test-threads=1`

use std::env;
use std::fs;
use std::path::PathBuf;

use tempfile::TempDir;
use triplegate::units::{MemorySize, TimeLimit};
use triplegate::Config;

#[test]
fn test_config_default_server() {
    let config = Config::default();
    assert_eq!(config.server.host, "127.0.0.1");
    assert_eq!(config.server.port, 7001);
    assert!(config.server.access_token.is_none());
}

#[test]
fn test_config_default_index_is_empty() {
    let config = Config::default();
    assert!(config.index.path.is_none());
    assert!(config.index.name.is_empty());
}

#[test]
fn test_config_default_logging() {
    let config = Config::default();
    assert_eq!(config.logging.level, "info");
    assert!(config.logging.file.is_none());
}

#[test]
fn test_from_file_full() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("server.toml");
    fs::write(
        &path,
        r#"
[server]
host = "0.0.0.0"
port = 9000
num_threads = 4
access_token = "secret"

[index]
path = "/data/kb.nt"
name = "KB"

[cache]
max_num_entries = 50
max_size = "2 GB"
max_size_single_entry = "100 MB"

[memory]
max_memory = "8 GB"
make_room_slack_factor = 3

[query]
default_timeout = "90s"
enable_pattern_trick = false
max_send_rows = 500

[logging]
level = "debug"
format = "json"

[http]
cors_allow_all = false
cors_origins = ["https://example.org"]
ws_ping_interval_ms = 0
"#,
    )
    .unwrap();

    let config = Config::from_file(path.to_str().unwrap()).unwrap();
    assert_eq!(config.server.host, "0.0.0.0");
    assert_eq!(config.server.port, 9000);
    assert_eq!(config.effective_num_threads(), 4);
    assert_eq!(config.server.access_token.as_deref(), Some("secret"));
    assert_eq!(config.index.path, Some(PathBuf::from("/data/kb.nt")));
    assert_eq!(config.cache.max_num_entries, 50);
    assert_eq!(config.cache.max_size, MemorySize::gigabytes(2));
    assert_eq!(config.cache.max_size_single_entry, MemorySize::megabytes(100));
    assert_eq!(config.memory.max_memory, MemorySize::gigabytes(8));
    assert_eq!(config.memory.make_room_slack_factor, 3);
    assert_eq!(config.query.default_timeout, TimeLimit::from_secs(90));
    assert!(!config.query.enable_pattern_trick);
    assert_eq!(config.query.max_send_rows, 500);
    assert_eq!(config.logging.format, "json");
    assert!(!config.http.cors_allow_all);
    assert_eq!(config.http.cors_origins, vec!["https://example.org".to_string()]);
    assert_eq!(config.http.ws_ping_interval_ms, 0);
}

#[test]
fn test_invalid_unit_is_rejected() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("bad.toml");
    fs::write(&path, "[cache]\nmax_size = \"lots\"\n").unwrap();
    assert!(Config::from_file(path.to_str().unwrap()).is_err());
}

#[test]
#[ignore = "Requires --test-threads=1 due to directory change"]
fn test_local_file_overrides_base_file() {
    let temp = TempDir::new().unwrap();
    fs::write(
        temp.path().join("config.toml"),
        "[server]\nport = 8000\n\n[index]\nname = \"base\"\n",
    )
    .unwrap();
    fs::write(temp.path().join("config.local.toml"), "[server]\nport = 8001\n").unwrap();

    let original_dir = env::current_dir().unwrap();
    env::set_current_dir(temp.path()).unwrap();
    let config = Config::load();
    env::set_current_dir(original_dir).unwrap();

    let config = config.unwrap();
    assert_eq!(config.server.port, 8001);
    assert_eq!(config.index.name, "base");
}

#[test]
#[ignore = "Requires --test-threads=1 due to env var mutation"]
fn test_env_overrides_file() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("config.toml");
    fs::write(&path, "[query]\ndefault_timeout = \"10s\"\n").unwrap();

    env::set_var("TRIPLEGATE_QUERY__DEFAULT_TIMEOUT", "45s");
    env::set_var("TRIPLEGATE_SERVER__PORT", "7100");
    let config = Config::from_file(path.to_str().unwrap());
    env::remove_var("TRIPLEGATE_QUERY__DEFAULT_TIMEOUT");
    env::remove_var("TRIPLEGATE_SERVER__PORT");

    let config = config.unwrap();
    assert_eq!(config.query.default_timeout, TimeLimit::from_secs(45));
    assert_eq!(config.server.port, 7100);
}
