use super::*;
use std::fs;
use tempfile::TempDir;

#[test]
fn test_default_config_creation() {
    let config = KvConfig::default();

    // Test node defaults
    assert!(config.node.id.is_none());
    assert_eq!(
        config.node.listen_addr,
        "127.0.0.1:8080".parse::<SocketAddr>().unwrap()
    );
    assert_eq!(config.node.data_dir, PathBuf::from("/tmp/kv"));
    assert!(config.node.leader.is_none());

    // Test storage defaults
    assert_eq!(config.storage.lock_timeout, Duration::from_millis(5));
    assert_eq!(config.storage.lock_retry_interval, Duration::from_millis(1));

    // Test raft defaults
    assert_eq!(config.raft.heartbeat_interval, Duration::from_millis(250));
    assert_eq!(config.raft.election_timeout_min, Duration::from_millis(299));
    assert_eq!(config.raft.election_timeout_max, Duration::from_millis(500));

    // Test cluster defaults
    assert_eq!(config.cluster.join_warmup, Duration::from_secs(10));
    assert_eq!(config.cluster.apply_timeout, Duration::from_secs(60));
    assert_eq!(config.cluster.snapshot_chance, 10);
}

#[test]
fn test_config_validation_valid() {
    let config = KvConfig::default();
    assert!(config.validate().is_ok());
}

#[test]
fn test_config_validation_invalid_node_id() {
    let mut config = KvConfig::default();
    config.node.id = Some(0);

    let result = config.validate();
    assert!(result.is_err());
    assert!(result
        .unwrap_err()
        .to_string()
        .contains("Node ID cannot be 0"));
}

#[test]
fn test_config_validation_invalid_timeouts() {
    let mut config = KvConfig::default();
    config.raft.election_timeout_min = Duration::from_millis(300);
    config.raft.election_timeout_max = Duration::from_millis(150);

    let result = config.validate();
    assert!(result.is_err());
    assert!(result
        .unwrap_err()
        .to_string()
        .contains("Election timeout min must be less than max"));
}

#[test]
fn test_config_validation_zero_snapshot_chance() {
    let mut config = KvConfig::default();
    config.cluster.snapshot_chance = 0;

    let result = config.validate();
    assert!(result.is_err());
    assert!(result
        .unwrap_err()
        .to_string()
        .contains("Snapshot chance"));
}

#[test]
fn test_config_validation_bad_advertise_addr() {
    let mut config = KvConfig::default();
    config.node.advertise_addr = Some("localhost".to_string());

    assert!(config.validate().is_err());

    config.node.advertise_addr = Some("localhost:8081".to_string());
    assert!(config.validate().is_ok());
}

#[test]
fn test_config_validation_invalid_log_level() {
    let mut config = KvConfig::default();
    config.logging.level = "invalid_level".to_string();

    let result = config.validate();
    assert!(result.is_err());
    assert!(result.unwrap_err().to_string().contains("Invalid log level"));
}

#[test]
fn test_toml_serialization_deserialization() {
    let mut config = KvConfig::default();
    config.node.id = Some(7);
    config.node.leader = Some("http://10.0.0.1:8080".to_string());

    let toml_content = toml::to_string_pretty(&config).expect("Failed to serialize to TOML");
    assert!(!toml_content.is_empty());

    let deserialized: KvConfig =
        toml::from_str(&toml_content).expect("Failed to deserialize from TOML");

    assert_eq!(deserialized.node.id, Some(7));
    assert_eq!(deserialized.node.leader, config.node.leader);
    assert_eq!(deserialized.node.data_dir, config.node.data_dir);
    assert_eq!(deserialized.cluster.join_warmup, config.cluster.join_warmup);
    assert_eq!(deserialized.logging.format, LogFormat::Pretty);
}

#[test]
fn test_toml_parsing() {
    let toml_content = r#"
[node]
id = 3
listen_addr = "0.0.0.0:9000"
advertise_addr = "node3.internal:9000"
data_dir = "/var/lib/ferrokv"
leader = "node1.internal:9000"

[storage]
lock_timeout = 10
lock_retry_interval = 1

[raft]
heartbeat_interval = 100
election_timeout_min = 300
election_timeout_max = 600
snapshot_after_entries = 500
logs_to_keep = 200

[cluster]
join_warmup = 2000
join_timeout = 30000
apply_timeout = 45000
forward_timeout = 50000
snapshot_chance = 4

[logging]
level = "debug"
format = "json"
structured = true
enable_colors = false
"#;

    let config: KvConfig = toml::from_str(toml_content).expect("Failed to parse TOML");

    assert_eq!(config.node.id, Some(3));
    assert_eq!(config.node.advertise(), "node3.internal:9000");
    assert_eq!(config.node.leader.as_deref(), Some("node1.internal:9000"));
    assert_eq!(config.storage.lock_timeout, Duration::from_millis(10));
    assert_eq!(config.raft.snapshot_after_entries, 500);
    assert_eq!(config.cluster.join_warmup, Duration::from_secs(2));
    assert_eq!(config.cluster.snapshot_chance, 4);
    assert_eq!(config.logging.format, LogFormat::Json);
    assert!(config.validate().is_ok());
}

#[test]
fn test_config_file_operations() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let config_path = temp_dir.path().join("test_config.toml");

    let mut config = KvConfig::default();
    config.node.id = Some(42);
    config.logging.level = "debug".to_string();

    config
        .to_file(&config_path)
        .expect("Failed to write config file");
    assert!(config_path.exists());

    let loaded = KvConfig::from_file(&config_path).expect("Failed to load config file");
    assert_eq!(loaded.node.id, Some(42));
    assert_eq!(loaded.logging.level, "debug");
}

#[test]
fn test_invalid_config_file_is_rejected() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let config_path = temp_dir.path().join("broken.toml");
    fs::write(&config_path, "[node\nid = ").expect("Failed to write file");

    let result = KvConfig::from_file(&config_path);
    assert!(matches!(result, Err(ConfigError::Parse(_))));
}

#[test]
fn test_advertise_defaults_to_listen_addr() {
    let config = NodeConfig::default();
    assert_eq!(config.advertise(), "127.0.0.1:8080");
    assert_eq!(config.data_file(), PathBuf::from("/tmp/kv/data.json"));
    assert_eq!(config.raft_dir(), PathBuf::from("/tmp/kv/raft"));
}

#[test]
fn test_resolve_id_is_stable_across_restarts() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let config = NodeConfig {
        data_dir: temp_dir.path().join("node"),
        ..NodeConfig::default()
    };

    let first = config.resolve_id().expect("Failed to resolve id");
    let second = config.resolve_id().expect("Failed to resolve id again");
    assert_eq!(first, second);
    assert_ne!(first, 0);

    let configured = NodeConfig {
        id: Some(5),
        ..config
    };
    assert_eq!(configured.resolve_id().unwrap(), 5);
}

#[test]
fn test_cluster_member_wire_format() {
    let member = ClusterMember::new(12, "127.0.0.1:8081");
    let json = serde_json::to_string(&member).unwrap();
    assert_eq!(json, r#"{"ID":"12","Address":"127.0.0.1:8081"}"#);

    let parsed: ClusterMember =
        serde_json::from_str(r#"{"ID": "12", "Address": "127.0.0.1:8081"}"#).unwrap();
    assert_eq!(parsed, member);
    assert_eq!(parsed.node_id().unwrap(), 12);

    let bad = ClusterMember {
        id: "urn:uuid:not-a-number".to_string(),
        address: "127.0.0.1:8081".to_string(),
    };
    assert!(bad.node_id().is_err());
}

#[test]
fn test_create_raft_config() {
    let raft = RaftConfig::default();
    let config = create_raft_config(&raft);
    assert_eq!(config.heartbeat_interval, 250);
    assert_eq!(config.election_timeout_min, 299);
    assert_eq!(config.election_timeout_max, 500);
    assert_eq!(config.max_in_snapshot_log_to_keep, 1000);
}
