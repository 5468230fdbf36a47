//! # lumesync
//!
//! Peer-to-peer directory synchronization between nodes that authenticate
//! each other with self-signed certificates over mutual TLS.
//!
//! Each node exposes one or more named shares. Peers authorized for a share
//! join it, exchange file change notifications and pull changed content in
//! fixed-size chunks. There is no central server; an optional HTTP announce
//! endpoint only tells nodes where to dial each other.
//!
//! ## Core Modules
//!
//! - [`config`] - Configuration file and defaults
//! - [`crypto`] - Certificates, fingerprints and TLS configuration
//! - [`wire`] - Message framing
//! - [`session`] - Authenticated message connections to peers
//! - [`dispatcher`] - Fan-out of inbound messages to share engines
//! - [`share`] - Filesystem and metadata operations on one share
//! - [`sync`] - The per-share synchronization engine
//! - [`p2p`] - Endpoint, listener and the registry of connected peers
//! - [`connector`] - Dialing peers and finding them by name
//! - [`node`] - Everything above wired into a running node
//!
//! ## Quick Start
//!
//! ```bash
//! lumesync init desktop
//! lumesync add-share docs ~/Documents
//! lumesync add-peer laptop <fingerprint> --address 192.168.1.20 --share docs
//! lumesync run
//! ```

pub mod cli;
pub mod config;
pub mod connector;
pub mod crypto;
pub mod dispatcher;
pub mod error;
pub mod message;
pub mod node;
pub mod p2p;
pub mod session;
pub mod share;
pub mod storage;
pub mod sync;
pub mod watcher;
pub mod wire;

pub use config::Config;
pub use message::{Message, PeerIdentity};
pub use node::Node;
