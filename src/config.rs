//! # Configuration Management
//!
//! This module handles lumesync's configuration file, including:
//! - Node settings (name, listen address, credentials, queue sizes)
//! - Shares and the fingerprints authorized for each of them
//! - Known peers, optionally with a static address to dial at startup
//! - The announce endpoint used to locate peers by name
//!
//! The configuration is stored as TOML in a platform-appropriate directory
//! (e.g., `~/.config/lumesync/` on Linux). Setting `LUMESYNC_CONFIG_DIR`
//! overrides that location.

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::session::DEFAULT_QUEUE_CAPACITY;
use crate::share::ShareSpec;

pub const CONFIG_DIR_ENV: &str = "LUMESYNC_CONFIG_DIR";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const DEFAULT_LISTEN_PORT: u16 = 41337;

/// Main configuration structure for a lumesync node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub node_name: String,
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    pub metadata_path: PathBuf,
    #[serde(default)]
    pub announce_url: Option<String>,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default)]
    pub shares: Vec<ShareConfig>,
    #[serde(default)]
    pub peers: Vec<PeerConfig>,

    #[serde(skip)]
    pub config_file_path: PathBuf,
}

/// A directory synchronized under a share name.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShareConfig {
    pub name: String,
    pub path: PathBuf,
    #[serde(default)]
    pub authorized: Vec<String>,
}

/// A peer known by name and certificate fingerprint.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerConfig {
    pub name: String,
    pub fingerprint: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
}

fn default_listen_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    DEFAULT_LISTEN_PORT
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

fn default_poll_interval() -> u64 {
    60
}

impl Config {
    /// Write a fresh configuration into the default config directory.
    pub async fn init(node_name: &str) -> Result<Self> {
        Self::init_in(&Self::config_dir()?, node_name).await
    }

    pub async fn init_in(config_dir: &Path, node_name: &str) -> Result<Self> {
        tokio::fs::create_dir_all(config_dir)
            .await
            .with_context(|| format!("Failed to create {}", config_dir.display()))?;

        let config = Self {
            node_name: node_name.to_string(),
            listen_address: default_listen_address(),
            listen_port: DEFAULT_LISTEN_PORT,
            cert_path: config_dir.join("node.crt"),
            key_path: config_dir.join("node.key"),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            metadata_path: config_dir.join("metadata.json"),
            announce_url: None,
            poll_interval_secs: default_poll_interval(),
            shares: Vec::new(),
            peers: Vec::new(),
            config_file_path: config_dir.join(CONFIG_FILE_NAME),
        };

        config.save().await?;
        Ok(config)
    }

    pub async fn load() -> Result<Self> {
        let config_file = Self::config_dir()?.join(CONFIG_FILE_NAME);
        if !config_file.exists() {
            bail!("lumesync is not initialized. Run 'lumesync init' first.");
        }
        Self::load_from(&config_file).await
    }

    pub async fn load_from(config_file: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(config_file)
            .await
            .with_context(|| format!("Failed to read {}", config_file.display()))?;
        let mut config: Config =
            toml::from_str(&content).with_context(|| format!("Invalid configuration in {}", config_file.display()))?;
        config.config_file_path = config_file.to_path_buf();
        config.validate()?;
        Ok(config)
    }

    pub async fn save(&self) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        tokio::fs::write(&self.config_file_path, content)
            .await
            .with_context(|| format!("Failed to write {}", self.config_file_path.display()))?;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for share in &self.shares {
            if !names.insert(share.name.as_str()) {
                bail!("Share {} is configured twice", share.name);
            }
        }
        if self.queue_capacity == 0 {
            bail!("queue_capacity must be at least 1");
        }
        Ok(())
    }

    /// Add a share. Share names are unique.
    pub fn add_share(&mut self, name: &str, path: PathBuf, authorized: Vec<String>) -> Result<()> {
        if self.share(name).is_some() {
            bail!("A share named {} already exists", name);
        }
        if !path.is_dir() {
            bail!("{} is not a directory", path.display());
        }

        self.shares.push(ShareConfig {
            name: name.to_string(),
            path,
            authorized,
        });
        Ok(())
    }

    /// Add a peer. Peer names are unique.
    pub fn add_peer(&mut self, peer: PeerConfig) -> Result<()> {
        if self.peers.iter().any(|p| p.name == peer.name) {
            bail!("A peer named {} already exists", peer.name);
        }
        self.peers.push(peer);
        Ok(())
    }

    /// Allow `fingerprint` to join the share called `share_name`.
    pub fn authorize(&mut self, share_name: &str, fingerprint: &str) -> Result<()> {
        let share = self
            .shares
            .iter_mut()
            .find(|s| s.name == share_name)
            .ok_or_else(|| anyhow!("No share named {}", share_name))?;
        if !share.authorized.iter().any(|f| f == fingerprint) {
            share.authorized.push(fingerprint.to_string());
        }
        Ok(())
    }

    pub fn share(&self, name: &str) -> Option<&ShareConfig> {
        self.shares.iter().find(|s| s.name == name)
    }

    pub fn share_specs(&self) -> Vec<ShareSpec> {
        self.shares
            .iter()
            .map(|share| ShareSpec {
                name: share.name.clone(),
                root: share.path.clone(),
                authorized: share.authorized.iter().cloned().collect(),
            })
            .collect()
    }

    /// Every fingerprint allowed to connect: share authorizations plus
    /// configured peers.
    pub fn authorized_fingerprints(&self) -> HashSet<String> {
        self.shares
            .iter()
            .flat_map(|s| s.authorized.iter().cloned())
            .chain(self.peers.iter().map(|p| p.fingerprint.clone()))
            .collect()
    }

    /// Configured peer names mapped to their fingerprints.
    pub fn known_peers(&self) -> HashMap<String, String> {
        self.peers
            .iter()
            .map(|p| (p.name.clone(), p.fingerprint.clone()))
            .collect()
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.listen_address, self.listen_port)
            .parse()
            .with_context(|| format!("Invalid listen address {}:{}", self.listen_address, self.listen_port))
    }

    pub fn config_path(&self) -> &Path {
        &self.config_file_path
    }

    pub fn config_dir() -> Result<PathBuf> {
        if let Ok(dir) = std::env::var(CONFIG_DIR_ENV) {
            return Ok(PathBuf::from(dir));
        }
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow!("Could not determine config directory"))?
            .join("lumesync");
        Ok(config_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn create_test_config() -> (Config, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::init_in(temp_dir.path(), "test-node").await.unwrap();
        (config, temp_dir)
    }

    #[tokio::test]
    async fn test_config_save_and_load() {
        let (mut config, temp_dir) = create_test_config().await;
        config.announce_url = Some("https://announce.example.org".to_string());
        config
            .add_peer(PeerConfig {
                name: "laptop".to_string(),
                fingerprint: "ab".repeat(20),
                address: Some("10.0.0.2".to_string()),
                port: Some(41337),
            })
            .unwrap();
        config.save().await.unwrap();

        let loaded = Config::load_from(&temp_dir.path().join(CONFIG_FILE_NAME)).await.unwrap();
        assert_eq!(loaded.node_name, "test-node");
        assert_eq!(loaded.listen_port, DEFAULT_LISTEN_PORT);
        assert_eq!(loaded.queue_capacity, DEFAULT_QUEUE_CAPACITY);
        assert_eq!(loaded.announce_url.as_deref(), Some("https://announce.example.org"));
        assert_eq!(loaded.peers, config.peers);
        assert_eq!(loaded.config_path(), temp_dir.path().join(CONFIG_FILE_NAME));
    }

    #[tokio::test]
    async fn test_minimal_file_gets_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(
            &path,
            "node_name = \"n\"\ncert_path = \"n.crt\"\nkey_path = \"n.key\"\nmetadata_path = \"m.json\"\n",
        )
        .unwrap();

        let config = Config::load_from(&path).await.unwrap();
        assert_eq!(config.listen_address, "0.0.0.0");
        assert_eq!(config.queue_capacity, 10);
        assert_eq!(config.poll_interval_secs, 60);
        assert!(config.shares.is_empty());
    }

    #[tokio::test]
    async fn test_add_share_requires_unique_name() {
        let (mut config, temp_dir) = create_test_config().await;
        let docs = temp_dir.path().join("docs");
        std::fs::create_dir(&docs).unwrap();

        config.add_share("docs", docs.clone(), vec![]).unwrap();
        assert!(config.add_share("docs", docs, vec![]).is_err());
        assert!(config
            .add_share("missing", temp_dir.path().join("nope"), vec![])
            .is_err());
        assert_eq!(config.shares.len(), 1);
    }

    #[tokio::test]
    async fn test_authorized_fingerprints_union() {
        let (mut config, temp_dir) = create_test_config().await;
        config
            .add_share("docs", temp_dir.path().to_path_buf(), vec!["aa".to_string()])
            .unwrap();
        config.authorize("docs", "bb").unwrap();
        config.authorize("docs", "bb").unwrap();
        assert!(config.authorize("photos", "cc").is_err());
        config
            .add_peer(PeerConfig {
                name: "phone".to_string(),
                fingerprint: "cc".to_string(),
                address: None,
                port: None,
            })
            .unwrap();

        let expected: HashSet<String> = ["aa", "bb", "cc"].iter().map(|s| s.to_string()).collect();
        assert_eq!(config.authorized_fingerprints(), expected);
        assert_eq!(config.share("docs").unwrap().authorized.len(), 2);
        assert_eq!(config.known_peers().get("phone").map(String::as_str), Some("cc"));
    }

    #[tokio::test]
    async fn test_duplicate_share_in_file_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(
            &path,
            r#"
node_name = "n"
cert_path = "n.crt"
key_path = "n.key"
metadata_path = "m.json"

[[shares]]
name = "docs"
path = "/tmp/a"

[[shares]]
name = "docs"
path = "/tmp/b"
"#,
        )
        .unwrap();

        assert!(Config::load_from(&path).await.is_err());
    }

    #[test]
    fn test_listen_addr() {
        let config = Config {
            node_name: "n".to_string(),
            listen_address: "127.0.0.1".to_string(),
            listen_port: 5000,
            cert_path: PathBuf::from("n.crt"),
            key_path: PathBuf::from("n.key"),
            queue_capacity: 10,
            metadata_path: PathBuf::from("m.json"),
            announce_url: None,
            poll_interval_secs: 60,
            shares: Vec::new(),
            peers: Vec::new(),
            config_file_path: PathBuf::from("/test/config.toml"),
        };
        assert_eq!(config.listen_addr().unwrap(), "127.0.0.1:5000".parse().unwrap());
    }
}
