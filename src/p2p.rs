//! # P2P Networking Module
//!
//! The node's QUIC endpoint and the bookkeeping around connected peers.
//!
//! ## Features
//!
//! - **Endpoint**: One QUIC endpoint both accepts and dials, using mutual TLS
//!   built from the node credentials
//! - **Client registry**: Process-wide map from fingerprint to live session
//! - **Listener**: Accept loop that authenticates inbound peers and hands new
//!   sessions to the node
//! - **Mismatch tracking**: Repeated identity failures from one address are
//!   reported with an attempt count
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use lumesync::crypto::Credentials;
//! use lumesync::p2p::bind_endpoint;
//!
//! async fn listen() -> anyhow::Result<()> {
//!     let generated = Credentials::generate("desktop")?;
//!     let endpoint = bind_endpoint(&generated.credentials, "0.0.0.0:41337".parse()?)?;
//!     println!("Listening on {}", endpoint.local_addr()?);
//!     Ok(())
//! }
//! ```

use parking_lot::Mutex;
use quinn::Endpoint;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::crypto::{self, Credentials};
use crate::error::{CryptoError, SessionError};
use crate::session::{self, Direction, Session, SessionSettings};

/// Bind a QUIC endpoint that accepts peers and dials with our certificate.
pub fn bind_endpoint(credentials: &Credentials, bind_addr: SocketAddr) -> Result<Endpoint, CryptoError> {
    let server_crypto = crypto::server_config(credentials)?;
    let client_crypto = crypto::client_config(credentials)?;

    let server_config = quinn::ServerConfig::with_crypto(Arc::new(server_crypto));
    let mut endpoint = Endpoint::server(server_config, bind_addr)?;
    endpoint.set_default_client_config(quinn::ClientConfig::new(Arc::new(client_crypto)));

    info!("Endpoint bound to {}", endpoint.local_addr()?);
    Ok(endpoint)
}

/// Live sessions keyed by peer fingerprint.
#[derive(Clone, Default)]
pub struct ClientRegistry {
    sessions: Arc<Mutex<HashMap<String, Session>>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session, returning the one it replaced.
    pub fn insert(&self, session: Session) -> Option<Session> {
        let fingerprint = session.identity().fingerprint.clone();
        self.sessions.lock().insert(fingerprint, session)
    }

    pub fn get(&self, fingerprint: &str) -> Option<Session> {
        self.sessions.lock().get(fingerprint).filter(|s| s.is_live()).cloned()
    }

    /// Remove the entry for `session`, unless it has already been replaced by
    /// a newer session for the same peer.
    pub fn remove_session(&self, session: &Session) -> bool {
        let mut sessions = self.sessions.lock();
        let fingerprint = &session.identity().fingerprint;
        match sessions.get(fingerprint) {
            Some(current) if current.same_as(session) => {
                sessions.remove(fingerprint);
                true
            }
            _ => false,
        }
    }

    pub fn is_connected(&self, fingerprint: &str) -> bool {
        self.get(fingerprint).is_some()
    }

    pub fn sessions(&self) -> Vec<Session> {
        self.sessions.lock().values().cloned().collect()
    }

    pub fn fingerprints(&self) -> Vec<String> {
        self.sessions.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// Close and forget every session.
    pub fn close_all(&self) {
        let sessions: Vec<Session> = self.sessions.lock().drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.close();
        }
    }
}

/// Addresses remembered by a [`MismatchTracker`] at most.
pub const MISMATCH_TRACKER_CAPACITY: usize = 1024;
/// A failure older than this no longer counts towards an address's attempts.
pub const MISMATCH_MEMORY: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Copy)]
struct Attempts {
    count: u32,
    last_seen: Instant,
}

/// Counts identity failures per remote address.
pub struct MismatchTracker {
    attempts: Mutex<HashMap<IpAddr, Attempts>>,
    capacity: usize,
    memory: Duration,
}

impl Default for MismatchTracker {
    fn default() -> Self {
        Self::with_limits(MISMATCH_TRACKER_CAPACITY, MISMATCH_MEMORY)
    }
}

impl MismatchTracker {
    pub fn with_limits(capacity: usize, memory: Duration) -> Self {
        Self {
            attempts: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
            memory,
        }
    }

    /// Record a failure and return how many there have been from `addr`
    /// within the memory window.
    pub fn record(&self, addr: IpAddr) -> u32 {
        let now = Instant::now();
        let mut attempts = self.attempts.lock();

        if !attempts.contains_key(&addr) && attempts.len() >= self.capacity {
            let memory = self.memory;
            attempts.retain(|_, a| now.duration_since(a.last_seen) < memory);
            if attempts.len() >= self.capacity {
                let oldest = attempts.iter().min_by_key(|(_, a)| a.last_seen).map(|(ip, _)| *ip);
                if let Some(oldest) = oldest {
                    attempts.remove(&oldest);
                }
            }
        }

        let entry = attempts.entry(addr).or_insert(Attempts {
            count: 0,
            last_seen: now,
        });
        if now.duration_since(entry.last_seen) >= self.memory {
            entry.count = 0;
        }
        entry.count += 1;
        entry.last_seen = now;
        entry.count
    }

    pub fn attempts(&self, addr: IpAddr) -> u32 {
        let attempts = self.attempts.lock();
        match attempts.get(&addr) {
            Some(a) if a.last_seen.elapsed() < self.memory => a.count,
            _ => 0,
        }
    }

    /// Number of addresses currently remembered.
    pub fn tracked(&self) -> usize {
        self.attempts.lock().len()
    }
}

/// Inbound accept loop.
pub struct Listener {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
    mismatches: Arc<MismatchTracker>,
}

impl Listener {
    /// Start accepting connections on `endpoint`. Authenticated sessions are
    /// sent on `sessions`.
    pub fn start(
        endpoint: Endpoint,
        authorized: HashSet<String>,
        settings: SessionSettings,
        sessions: mpsc::Sender<Session>,
    ) -> Self {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let mismatches = Arc::new(MismatchTracker::default());
        let authorized = Arc::new(authorized);
        let tracker = mismatches.clone();

        let task = tokio::spawn(async move {
            info!("Listening for peers");
            loop {
                let connecting = tokio::select! {
                    biased;
                    _ = stop_rx.changed() => break,
                    connecting = endpoint.accept() => match connecting {
                        Some(connecting) => connecting,
                        None => break,
                    },
                };

                let authorized = authorized.clone();
                let settings = settings.clone();
                let sessions = sessions.clone();
                let tracker = tracker.clone();
                tokio::spawn(async move {
                    let remote = connecting.remote_address();
                    match accept(connecting, &authorized, &settings).await {
                        Ok(session) => {
                            if sessions.send(session.clone()).await.is_err() {
                                session.close();
                            }
                        }
                        Err(e) if e.is_identity_mismatch() => {
                            let attempts = tracker.record(remote.ip());
                            if attempts > 1 {
                                warn!("Rejected {} again ({} attempts): {}", remote, attempts, e);
                            } else {
                                warn!("Rejected {}: {}", remote, e);
                            }
                        }
                        Err(e) => debug!("Inbound connection from {} failed: {}", remote, e),
                    }
                });
            }
            info!("Listener stopped");
        });

        Self {
            stop_tx,
            task,
            mismatches,
        }
    }

    pub fn mismatches(&self) -> &MismatchTracker {
        &self.mismatches
    }

    pub async fn stop(self) {
        self.stop_tx.send_replace(true);
        let _ = self.task.await;
    }
}

async fn accept(
    connecting: quinn::Connecting,
    authorized: &HashSet<String>,
    settings: &SessionSettings,
) -> Result<Session, SessionError> {
    let connection = session::connect(connecting).await?;
    session::establish(connection, Direction::Inbound, None, authorized, settings).await
}
