//! # Command Line Interface
//!
//! This module provides the command-line interface for lumesync, including
//! argument parsing, command definitions, and command implementations.
//!
//! ## Commands
//!
//! - `init` - Create a configuration and generate the node certificate
//! - `id` - Display this node's certificate fingerprint
//! - `add-share` - Register a local directory under a share name
//! - `add-peer` - Record a peer fingerprint and authorize it for shares
//! - `status` - Display configured shares and peers
//! - `run` - Run the node until interrupted

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use colored::*;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::config::{Config, PeerConfig, CONFIG_FILE_NAME};
use crate::crypto::Credentials;
use crate::node::Node;

/// Command-line interface structure for lumesync.
#[derive(Parser)]
#[command(name = "lumesync")]
#[command(about = "Peer-to-peer directory synchronization over mutually authenticated TLS")]
#[command(version)]
pub struct Cli {
    /// Configuration directory to use instead of the default
    #[arg(long, global = true, value_name = "DIR")]
    pub config_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a configuration and generate the node certificate
    Init {
        /// Name embedded in the certificate and used in logs
        name: String,
    },

    /// Display this node's certificate fingerprint
    Id,

    /// Register a local directory under a share name
    AddShare {
        /// Share name, identical on every node that syncs it
        name: String,
        /// Local directory holding the share contents
        path: PathBuf,
        /// Fingerprints allowed to join the share
        #[arg(short, long = "authorize")]
        authorized: Vec<String>,
    },

    /// Record a peer and authorize it for shares
    AddPeer {
        /// Name the peer is announced under
        name: String,
        /// Hex SHA-1 fingerprint of the peer certificate
        fingerprint: String,
        /// Static address to dial at startup
        #[arg(short, long)]
        address: Option<String>,
        #[arg(short, long)]
        port: Option<u16>,
        /// Shares the peer may join
        #[arg(short, long = "share")]
        shares: Vec<String>,
    },

    /// Display configured shares and peers
    Status,

    /// Run the node until interrupted
    Run,
}

/// Run the parsed command.
pub async fn execute(cli: Cli) -> Result<()> {
    let dir = cli.config_dir;
    match cli.command {
        Commands::Init { name } => init(dir.as_deref(), &name).await,
        Commands::Id => show_id(dir.as_deref()).await,
        Commands::AddShare {
            name,
            path,
            authorized,
        } => add_share(dir.as_deref(), &name, path, authorized).await,
        Commands::AddPeer {
            name,
            fingerprint,
            address,
            port,
            shares,
        } => {
            let peer = PeerConfig {
                name,
                fingerprint: fingerprint.to_lowercase(),
                address,
                port,
            };
            add_peer(dir.as_deref(), peer, &shares).await
        }
        Commands::Status => show_status(dir.as_deref()).await,
        Commands::Run => run(dir.as_deref()).await,
    }
}

async fn load_config(config_dir: Option<&Path>) -> Result<Config> {
    match config_dir {
        Some(dir) => {
            let file = dir.join(CONFIG_FILE_NAME);
            if !file.exists() {
                bail!("No configuration in {}. Run 'lumesync init' first.", dir.display());
            }
            Config::load_from(&file).await
        }
        None => Config::load().await,
    }
}

/// Write a new configuration and a fresh self-signed certificate.
pub async fn init(config_dir: Option<&Path>, node_name: &str) -> Result<()> {
    let dir = match config_dir {
        Some(dir) => dir.to_path_buf(),
        None => Config::config_dir()?,
    };
    if dir.join(CONFIG_FILE_NAME).exists() {
        bail!("Already initialized at {}", dir.display());
    }

    info!("Initializing lumesync in {}", dir.display());
    let config = Config::init_in(&dir, node_name).await?;

    let generated = Credentials::generate(node_name)?;
    generated.save(&config.cert_path, &config.key_path)?;
    let identity = generated.credentials.identity()?;

    println!("{} lumesync initialized", "✅".green());
    println!("   Config: {}", config.config_path().display());
    println!("   Fingerprint: {}", identity.fingerprint.bold());
    Ok(())
}

pub async fn show_id(config_dir: Option<&Path>) -> Result<()> {
    let config = load_config(config_dir).await?;
    let credentials = Credentials::load(&config.cert_path, &config.key_path)?;
    println!("{}", credentials.identity()?.fingerprint);
    Ok(())
}

pub async fn add_share(
    config_dir: Option<&Path>,
    name: &str,
    path: PathBuf,
    authorized: Vec<String>,
) -> Result<()> {
    let mut config = load_config(config_dir).await?;
    let path = path.canonicalize().unwrap_or(path);
    let authorized = authorized.into_iter().map(|f| f.to_lowercase()).collect();

    config.add_share(name, path.clone(), authorized)?;
    config.save().await?;

    println!("{} Added share {} at {}", "✅".green(), name.bold(), path.display());
    Ok(())
}

pub async fn add_peer(config_dir: Option<&Path>, peer: PeerConfig, shares: &[String]) -> Result<()> {
    let mut config = load_config(config_dir).await?;

    for share in shares {
        config.authorize(share, &peer.fingerprint)?;
    }
    let name = peer.name.clone();
    config.add_peer(peer)?;
    config.save().await?;

    println!("{} Added peer {}", "✅".green(), name.bold());
    if !shares.is_empty() {
        println!("   Authorized for: {}", shares.join(", "));
    }
    Ok(())
}

pub async fn show_status(config_dir: Option<&Path>) -> Result<()> {
    let config = load_config(config_dir).await?;

    println!("{} {}", "Node:".bold(), config.node_name);
    println!("   Listening on {}:{}", config.listen_address, config.listen_port);
    if let Some(url) = &config.announce_url {
        println!("   Announce endpoint: {}", url);
    }

    if config.shares.is_empty() {
        println!("\nNo shares configured. Add one with: lumesync add-share <name> <path>");
    } else {
        println!("\n{}", "Shares:".bold());
        for share in &config.shares {
            println!("  {} ({})", share.name.cyan(), share.path.display());
            println!("    Authorized peers: {}", share.authorized.len());
        }
    }

    if !config.peers.is_empty() {
        println!("\n{}", "Peers:".bold());
        for peer in &config.peers {
            let address = match (&peer.address, peer.port) {
                (Some(address), Some(port)) => format!("{}:{}", address, port),
                (Some(address), None) => address.clone(),
                _ => "announced".dimmed().to_string(),
            };
            println!("  {} {} {}", peer.name.cyan(), &peer.fingerprint, address);
        }
    }
    Ok(())
}

pub async fn run(config_dir: Option<&Path>) -> Result<()> {
    let config = load_config(config_dir).await?;
    let node = Node::start(&config).await?;

    println!("{} lumesync running as {}", "🚀".green(), node.identity().fingerprint.bold());
    println!("   Listening on {}", node.local_addr()?);
    println!("   Syncing {} share(s). Press Ctrl+C to stop.", config.shares.len());

    tokio::signal::ctrl_c().await?;

    println!("\n{} Stopping...", "🛑".red());
    node.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_init_writes_config_and_credentials() {
        let dir = TempDir::new().unwrap();
        init(Some(dir.path()), "desktop").await.unwrap();

        let config = load_config(Some(dir.path())).await.unwrap();
        assert_eq!(config.node_name, "desktop");
        let credentials = Credentials::load(&config.cert_path, &config.key_path).unwrap();
        assert_eq!(credentials.identity().unwrap().fingerprint.len(), 40);

        assert!(init(Some(dir.path()), "desktop").await.is_err());
    }

    #[tokio::test]
    async fn test_commands_require_init() {
        let dir = TempDir::new().unwrap();
        assert!(show_id(Some(dir.path())).await.is_err());
        assert!(show_status(Some(dir.path())).await.is_err());
    }

    #[tokio::test]
    async fn test_add_peer_authorizes_shares() {
        let dir = TempDir::new().unwrap();
        let data = TempDir::new().unwrap();
        init(Some(dir.path()), "desktop").await.unwrap();
        add_share(Some(dir.path()), "docs", data.path().to_path_buf(), vec![])
            .await
            .unwrap();

        let peer = PeerConfig {
            name: "laptop".to_string(),
            fingerprint: "ab12".to_string(),
            address: Some("127.0.0.1".to_string()),
            port: None,
        };
        add_peer(Some(dir.path()), peer, &["docs".to_string()]).await.unwrap();

        let config = load_config(Some(dir.path())).await.unwrap();
        assert_eq!(config.share("docs").unwrap().authorized, vec!["ab12".to_string()]);
        assert_eq!(config.peers.len(), 1);
    }

    #[tokio::test]
    async fn test_add_peer_to_unknown_share_fails() {
        let dir = TempDir::new().unwrap();
        init(Some(dir.path()), "desktop").await.unwrap();

        let peer = PeerConfig {
            name: "laptop".to_string(),
            fingerprint: "ab12".to_string(),
            address: None,
            port: None,
        };
        assert!(add_peer(Some(dir.path()), peer, &["missing".to_string()]).await.is_err());
    }

    #[test]
    fn test_cli_parses_add_peer() {
        let cli = Cli::try_parse_from([
            "lumesync",
            "--config-dir",
            "/tmp/x",
            "add-peer",
            "laptop",
            "AB12",
            "--share",
            "docs",
            "--share",
            "photos",
        ])
        .unwrap();
        assert_eq!(cli.config_dir, Some(PathBuf::from("/tmp/x")));
        match cli.command {
            Commands::AddPeer { name, shares, .. } => {
                assert_eq!(name, "laptop");
                assert_eq!(shares, vec!["docs", "photos"]);
            }
            _ => panic!("expected add-peer"),
        }
    }
}
