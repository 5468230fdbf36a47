//! Integration tests for configuration management
//!
//! These tests verify that configuration files are created, loaded,
//! and modified correctly across different scenarios. Tests that point
//! `LUMESYNC_CONFIG_DIR` somewhere run serially.

use serial_test::serial;
use tempfile::TempDir;
use tokio::fs;

use lumesync::config::{Config, PeerConfig, CONFIG_DIR_ENV, CONFIG_FILE_NAME, DEFAULT_LISTEN_PORT};

#[tokio::test]
#[serial]
async fn test_config_creation_and_loading() {
    let temp_dir = TempDir::new().unwrap();
    std::env::set_var(CONFIG_DIR_ENV, temp_dir.path());

    let config = Config::init("desktop").await.unwrap();
    let loaded = Config::load().await.unwrap();
    assert_eq!(config.listen_port, loaded.listen_port);
    assert_eq!(loaded.node_name, "desktop");
    assert_eq!(loaded.config_path(), temp_dir.path().join(CONFIG_FILE_NAME));

    std::env::remove_var(CONFIG_DIR_ENV);
}

#[tokio::test]
#[serial]
async fn test_load_without_init_fails() {
    let temp_dir = TempDir::new().unwrap();
    std::env::set_var(CONFIG_DIR_ENV, temp_dir.path());

    let result = Config::load().await;
    std::env::remove_var(CONFIG_DIR_ENV);

    let message = result.unwrap_err().to_string();
    assert!(message.contains("not initialized"));
}

#[tokio::test]
async fn test_config_share_management() {
    let temp_dir = TempDir::new().unwrap();
    let mut config = Config::init_in(temp_dir.path(), "desktop").await.unwrap();

    let docs = temp_dir.path().join("docs");
    let photos = temp_dir.path().join("photos");
    fs::create_dir_all(&docs).await.unwrap();
    fs::create_dir_all(&photos).await.unwrap();

    assert!(config.shares.is_empty());
    config.add_share("docs", docs.clone(), vec![]).unwrap();
    config.add_share("photos", photos.clone(), vec!["ab12".to_string()]).unwrap();
    assert!(config.add_share("elsewhere", temp_dir.path().join("missing"), vec![]).is_err());

    config.save().await.unwrap();
    let reloaded = Config::load_from(config.config_path()).await.unwrap();
    assert_eq!(reloaded.shares.len(), 2);
    assert_eq!(reloaded.share("docs").unwrap().path, docs);

    let specs = reloaded.share_specs();
    assert!(specs.iter().any(|s| s.name == "photos" && s.authorized.contains("ab12")));
}

#[tokio::test]
async fn test_config_default_values() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::init_in(temp_dir.path(), "desktop").await.unwrap();

    assert_eq!(config.listen_port, DEFAULT_LISTEN_PORT);
    assert_eq!(config.queue_capacity, 10);
    assert!(config.announce_url.is_none());
    assert!(config.cert_path.starts_with(temp_dir.path()));
    assert!(config.key_path.starts_with(temp_dir.path()));
}

#[tokio::test]
async fn test_config_serialization() {
    let temp_dir = TempDir::new().unwrap();
    let mut config = Config::init_in(temp_dir.path(), "desktop").await.unwrap();

    let docs = temp_dir.path().join("docs");
    fs::create_dir_all(&docs).await.unwrap();
    config.add_share("docs", docs, vec![]).unwrap();
    config
        .add_peer(PeerConfig {
            name: "laptop".to_string(),
            fingerprint: "ab12".to_string(),
            address: Some("192.168.1.20".to_string()),
            port: Some(41337),
        })
        .unwrap();
    config.save().await.unwrap();

    let content = fs::read_to_string(temp_dir.path().join(CONFIG_FILE_NAME)).await.unwrap();
    assert!(content.contains("listen_port"));
    assert!(content.contains("[[shares]]"));
    assert!(content.contains("[[peers]]"));

    let _parsed: toml::Value = toml::from_str(&content).unwrap();
}

#[tokio::test]
async fn test_duplicate_peer_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let mut config = Config::init_in(temp_dir.path(), "desktop").await.unwrap();

    let peer = PeerConfig {
        name: "laptop".to_string(),
        fingerprint: "ab12".to_string(),
        address: None,
        port: None,
    };
    config.add_peer(peer.clone()).unwrap();
    assert!(config.add_peer(peer).is_err());
    assert_eq!(config.known_peers().get("laptop").map(String::as_str), Some("ab12"));
}
