//! Integration tests for the lumesync CLI commands
//!
//! Commands are parsed and executed in-process against a temporary
//! configuration directory.

use clap::Parser;
use std::path::Path;
use tempfile::TempDir;

use lumesync::cli::{execute, Cli};
use lumesync::config::{Config, CONFIG_FILE_NAME};
use lumesync::crypto::Credentials;

async fn run(config_dir: &Path, args: &[&str]) -> anyhow::Result<()> {
    let mut argv = vec!["lumesync", "--config-dir", config_dir.to_str().unwrap()];
    argv.extend_from_slice(args);
    execute(Cli::try_parse_from(argv)?).await
}

async fn load(config_dir: &Path) -> Config {
    Config::load_from(&config_dir.join(CONFIG_FILE_NAME)).await.unwrap()
}

#[tokio::test]
async fn test_cli_init_command() {
    let temp_dir = TempDir::new().unwrap();

    run(temp_dir.path(), &["init", "desktop"]).await.unwrap();

    let config = load(temp_dir.path()).await;
    assert_eq!(config.node_name, "desktop");
    assert!(config.cert_path.exists());
    assert!(config.key_path.exists());

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&config.key_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}

#[tokio::test]
async fn test_cli_id_matches_certificate() {
    let temp_dir = TempDir::new().unwrap();
    run(temp_dir.path(), &["init", "desktop"]).await.unwrap();
    run(temp_dir.path(), &["id"]).await.unwrap();

    let config = load(temp_dir.path()).await;
    let identity = Credentials::load(&config.cert_path, &config.key_path)
        .unwrap()
        .identity()
        .unwrap();
    assert_eq!(identity.fingerprint.len(), 40);
    assert!(identity.fingerprint.chars().all(|c| c.is_ascii_hexdigit()));
}

#[tokio::test]
async fn test_cli_add_share_and_peer() {
    let temp_dir = TempDir::new().unwrap();
    let sync_dir = temp_dir.path().join("docs");
    std::fs::create_dir_all(&sync_dir).unwrap();

    run(temp_dir.path(), &["init", "desktop"]).await.unwrap();
    run(temp_dir.path(), &["add-share", "docs", sync_dir.to_str().unwrap()])
        .await
        .unwrap();
    run(
        temp_dir.path(),
        &["add-peer", "laptop", "ABCDEF", "--address", "10.0.0.5", "--port", "4000", "--share", "docs"],
    )
    .await
    .unwrap();
    run(temp_dir.path(), &["status"]).await.unwrap();

    let config = load(temp_dir.path()).await;
    let share = config.share("docs").unwrap();
    assert_eq!(share.authorized, vec!["abcdef".to_string()]);
    assert_eq!(config.peers[0].address.as_deref(), Some("10.0.0.5"));
    assert_eq!(config.peers[0].port, Some(4000));
}

#[tokio::test]
async fn test_cli_add_share_rejects_missing_directory() {
    let temp_dir = TempDir::new().unwrap();
    run(temp_dir.path(), &["init", "desktop"]).await.unwrap();

    let missing = temp_dir.path().join("missing");
    assert!(run(temp_dir.path(), &["add-share", "docs", missing.to_str().unwrap()])
        .await
        .is_err());
}

#[tokio::test]
async fn test_cli_commands_before_init_fail() {
    let temp_dir = TempDir::new().unwrap();
    assert!(run(temp_dir.path(), &["id"]).await.is_err());
    assert!(run(temp_dir.path(), &["status"]).await.is_err());
    assert!(run(temp_dir.path(), &["run"]).await.is_err());
}

#[test]
fn test_cli_rejects_unknown_command() {
    assert!(Cli::try_parse_from(["lumesync", "frobnicate"]).is_err());
}
