use std::io::Write;

use dialflow_core::config::{EngineConfig, StoreBackend};
use dialflow_core::error::DialflowError;
use dialflow_core::traits::FlowStore;
use dialflow_core::types::{FlowId, TenantId};

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[traversal]
max_auto_steps = 16
min_confidence = 0.6
retry_prompt = "Could you say that another way?"

[path_policy]
lock_threshold = 3.0
decay = 0.25
switch_penalty = 2.0

[lanes]
buffer = 8
idle_timeout_ms = 1000
graph_cache = 16

[store]
backend = "sqlite"
path = "/tmp/dialflow-test.db"

[log]
filter = "dialflow=debug"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = EngineConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.traversal.max_auto_steps, 16);
    assert_eq!(config.traversal.min_confidence, 0.6);
    assert_eq!(config.traversal.retry_prompt, "Could you say that another way?");
    assert_eq!(config.path_policy.lock_threshold, 3.0);
    assert_eq!(config.path_policy.decay, 0.25);
    assert_eq!(config.path_policy.switch_penalty, 2.0);
    assert_eq!(config.lanes.buffer, 8);
    assert_eq!(config.lanes.idle_timeout_ms, 1000);
    assert_eq!(config.lanes.graph_cache, 16);
    assert_eq!(config.store.backend, StoreBackend::Sqlite);
    assert_eq!(config.store.path, "/tmp/dialflow-test.db");
    assert_eq!(config.log.filter, "dialflow=debug");
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("DIALFLOW_TEST_DB_PATH", "/var/lib/dialflow/flows.db");

    let toml_content = r#"
[store]
backend = "sqlite"
path = "${DIALFLOW_TEST_DB_PATH}"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = EngineConfig::load(tmp.path()).expect("load config");
    assert_eq!(config.store.path, "/var/lib/dialflow/flows.db");

    std::env::remove_var("DIALFLOW_TEST_DB_PATH");
}

#[test]
fn test_minimal_config_uses_defaults() {
    let toml_content = r#"
[lanes]
buffer = 4
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = EngineConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.lanes.buffer, 4);
    assert_eq!(config.traversal.max_auto_steps, 64);
    assert_eq!(config.path_policy.lock_threshold, 2.0);
    assert_eq!(config.store.backend, StoreBackend::Memory);
    assert_eq!(config.log.filter, "dialflow=info,warn");
}

#[test]
fn test_missing_file_is_config_not_found() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let err = EngineConfig::load(&dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, DialflowError::ConfigNotFound(_)));
}

#[test]
fn test_invalid_values_are_rejected() {
    let toml_content = r#"
[path_policy]
lock_threshold = 0.0
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let err = EngineConfig::load(tmp.path()).unwrap_err();
    assert!(matches!(err, DialflowError::Config(_)));
}

#[test]
fn test_configured_sqlite_store_opens() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let db = dir.path().join("data").join("dialflow.db");
    let toml_content = format!(
        "[store]\nbackend = \"sqlite\"\npath = \"{}\"\n",
        db.display()
    );

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");
    let config = EngineConfig::load(tmp.path()).expect("load config");

    let stores = dialflow_store::open(&config.store).expect("open store");
    let tenant = TenantId::new("acme");
    stores
        .flows
        .publish(&tenant, &dialflow_test_utils::qualification_flow(), None)
        .expect("publish");
    assert!(db.exists());
    assert!(stores
        .flows
        .latest(&tenant, &FlowId::new("qualification"))
        .expect("latest")
        .is_some());
}
