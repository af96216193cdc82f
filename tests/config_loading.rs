use std::io::Write;

use maestro_core::config::MaestroConfig;
use maestro_core::error::MaestroError;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[graph]
max_node_executions = 4
max_concurrency = 2
node_timeout_ms = 1500
execution_timeout_ms = 60000

[swarm]
max_handoffs = 6
max_iterations = 9
execution_timeout_ms = 120000
node_timeout_ms = 5000
repetitive_handoff_window = 4
repetitive_handoff_min_unique = 2

[log]
filter = "maestro=debug"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = MaestroConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.graph.max_node_executions, Some(4));
    assert_eq!(config.graph.max_concurrency, 2);
    assert_eq!(config.graph.node_timeout_ms, Some(1500));
    assert_eq!(config.graph.execution_timeout_ms, Some(60000));

    assert_eq!(config.swarm.max_handoffs, 6);
    assert_eq!(config.swarm.max_iterations, 9);
    assert_eq!(config.swarm.execution_timeout_ms, 120000);
    assert_eq!(config.swarm.node_timeout_ms, Some(5000));
    assert_eq!(config.swarm.repetitive_handoff_window, 4);
    assert_eq!(config.swarm.repetitive_handoff_min_unique, 2);

    assert_eq!(config.log.filter, "maestro=debug");
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("MAESTRO_TEST_MAX_HANDOFFS", "7");

    let toml_content = r#"
[swarm]
max_handoffs = ${MAESTRO_TEST_MAX_HANDOFFS}
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = MaestroConfig::load(tmp.path()).expect("load config");
    assert_eq!(config.swarm.max_handoffs, 7);

    std::env::remove_var("MAESTRO_TEST_MAX_HANDOFFS");
}

#[test]
fn test_empty_config_uses_defaults() {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"").expect("write toml");

    let config = MaestroConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.graph.max_node_executions, None);
    assert_eq!(config.graph.max_concurrency, 8);
    assert!(config.graph.execution_timeout().is_none());
    assert_eq!(config.swarm.max_handoffs, 20);
    assert_eq!(config.swarm.max_iterations, 20);
    assert_eq!(config.swarm.execution_timeout_ms, 900_000);
    assert_eq!(config.swarm.repetitive_handoff_window, 0);
    assert_eq!(config.log.filter, "maestro=info,warn");
}

#[test]
fn test_zero_limits_rejected() {
    for content in [
        "[swarm]\nmax_handoffs = 0\n",
        "[swarm]\nmax_iterations = 0\n",
        "[swarm]\nrepetitive_handoff_window = 3\n",
        "[graph]\nmax_node_executions = 0\n",
        "[graph]\nmax_concurrency = 0\n",
    ] {
        assert!(
            MaestroConfig::from_toml(content).is_err(),
            "accepted: {}",
            content
        );
    }
}

#[test]
fn test_missing_file_is_config_not_found() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let err = MaestroConfig::load(&dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, MaestroError::ConfigNotFound(_)));
}
