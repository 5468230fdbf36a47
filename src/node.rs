//! # Node
//!
//! Wires the pieces of a running node together:
//!
//! - one QUIC endpoint shared by the [`Listener`] and the [`PeerConnector`]
//! - the [`Dispatcher`] fed by every session reader
//! - one [`ShareEngine`] per configured share, registered with the dispatcher
//!   under the share name
//! - an optional [`PeerFinder`] polling the announce endpoint
//!
//! Every new session, inbound or outbound, lands in the [`ClientRegistry`] and
//! is told `Entering` for each share that authorizes its peer.

use anyhow::{Context, Result};
use quinn::Endpoint;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

use crate::config::{Config, DEFAULT_LISTEN_PORT};
use crate::connector::{HttpAnnounceResolver, PeerConnector, PeerFinder, PeerInfo};
use crate::crypto::Credentials;
use crate::dispatcher::Dispatcher;
use crate::message::{Message, PeerIdentity, ShareAction};
use crate::p2p::{bind_endpoint, ClientRegistry, Listener};
use crate::session::{Direction, Session, SessionSettings};
use crate::share::Share;
use crate::storage::{JsonMetadataStore, MetadataStore};
use crate::sync::{EngineContext, ShareEngine, ShareHandle, ShareState};
use crate::watcher::NotifyWatcher;

/// Capacity of the queue between session readers and the dispatcher.
pub const INBOUND_QUEUE_CAPACITY: usize = 256;

const SESSION_QUEUE_CAPACITY: usize = 16;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

struct ShareEntry {
    name: String,
    authorized: HashSet<String>,
    handle: Arc<ShareHandle>,
}

pub struct Node {
    identity: PeerIdentity,
    endpoint: Endpoint,
    dispatcher: Arc<Dispatcher>,
    registry: ClientRegistry,
    shares: Arc<Vec<ShareEntry>>,
    listener: Listener,
    connector: PeerConnector,
    finder: Option<PeerFinder>,
    admission: JoinHandle<()>,
    stop_tx: watch::Sender<bool>,
}

impl Node {
    /// Load the node credentials named in `config` and start.
    pub async fn start(config: &Config) -> Result<Self> {
        let credentials = Credentials::load(&config.cert_path, &config.key_path).with_context(|| {
            format!(
                "Failed to load credentials from {} and {}",
                config.cert_path.display(),
                config.key_path.display()
            )
        })?;
        Self::start_with(config, credentials).await
    }

    pub async fn start_with(config: &Config, credentials: Credentials) -> Result<Self> {
        let identity = credentials.identity()?;
        info!("Starting node {} ({})", config.node_name, identity.fingerprint);

        let store: Arc<dyn MetadataStore> = Arc::new(
            JsonMetadataStore::open(&config.metadata_path)
                .with_context(|| format!("Failed to open {}", config.metadata_path.display()))?,
        );
        let endpoint = bind_endpoint(&credentials, config.listen_addr()?)?;

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
        let settings = SessionSettings {
            inbound: inbound_tx,
            queue_capacity: config.queue_capacity,
        };
        let (session_tx, session_rx) = mpsc::channel(SESSION_QUEUE_CAPACITY);

        let registry = ClientRegistry::new();
        let dispatcher = Arc::new(Dispatcher::default());
        let connector = PeerConnector::start(endpoint.clone(), settings.clone(), session_tx.clone());

        let context = EngineContext {
            registry: registry.clone(),
            known_peers: config.known_peers(),
            dial_requests: Some(connector.requests()),
        };

        let mut shares = Vec::new();
        for spec in config.share_specs() {
            let (watcher, events) = NotifyWatcher::new()?;
            let name = spec.name.clone();
            let authorized = spec.authorized.clone();
            let share = Share::new(spec, store.clone());
            let handle = Arc::new(ShareEngine::start(share, watcher, events, context.clone()));

            dispatcher.register_handler(&name, handle.clone()).await?;
            shares.push(ShareEntry {
                name,
                authorized,
                handle,
            });
        }
        let shares = Arc::new(shares);
        dispatcher.start(inbound_rx).await?;

        let listener = Listener::start(
            endpoint.clone(),
            config.authorized_fingerprints(),
            settings.clone(),
            session_tx.clone(),
        );

        let finder = match &config.announce_url {
            Some(url) => {
                let resolver = HttpAnnounceResolver::new(url)?;
                let finder = PeerFinder::start(
                    Arc::new(resolver),
                    registry.clone(),
                    Duration::from_secs(config.poll_interval_secs.max(1)),
                    connector.requests(),
                );
                for peer in &config.peers {
                    finder.add_peer(&peer.name, &peer.fingerprint);
                }
                Some(finder)
            }
            None => None,
        };

        let (stop_tx, stop_rx) = watch::channel(false);
        let admission = tokio::spawn(admit_sessions(
            session_rx,
            registry.clone(),
            shares.clone(),
            identity.fingerprint.clone(),
            stop_rx,
        ));

        let dial_requests = connector.requests();
        for peer in &config.peers {
            let Some(address) = &peer.address else {
                continue;
            };
            let target = PeerInfo {
                address: address.clone(),
                port: peer.port.unwrap_or(DEFAULT_LISTEN_PORT),
                fingerprint: peer.fingerprint.clone(),
            };
            if dial_requests.send(target).await.is_err() {
                warn!("Connector stopped before dialing {}", peer.name);
            }
        }

        info!(
            "Node running on {} with {} share(s)",
            endpoint.local_addr()?,
            shares.len()
        );

        Ok(Self {
            identity,
            endpoint,
            dispatcher,
            registry,
            shares,
            listener,
            connector,
            finder,
            admission,
            stop_tx,
        })
    }

    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.endpoint.local_addr()?)
    }

    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    pub fn share_state(&self, name: &str) -> Option<ShareState> {
        self.shares
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| entry.handle.state())
    }

    /// Queue a dial request.
    pub async fn connect(&self, target: PeerInfo) -> Result<()> {
        self.connector
            .requests()
            .send(target)
            .await
            .context("Peer connector is not running")
    }

    /// Stop every loop, tell members we are leaving and close all sessions.
    pub async fn shutdown(self) {
        info!("Shutting down node");
        self.stop_tx.send_replace(true);

        if let Some(finder) = self.finder {
            finder.stop().await;
        }
        self.listener.stop().await;
        self.connector.stop().await;

        for entry in self.shares.iter() {
            if let Err(e) = self.dispatcher.remove_handler(&entry.name).await {
                debug!("Handler {} already gone: {}", entry.name, e);
            }
            entry.handle.stop().await;
        }
        self.dispatcher.stop().await;
        let _ = self.admission.await;

        // Let leave notices reach the wire before the streams finish.
        let sessions = self.registry.sessions();
        let _ = timeout(SHUTDOWN_GRACE, async {
            for session in &sessions {
                session.drain().await;
                session.stop();
                session.closed().await;
            }
        })
        .await;
        let _ = timeout(SHUTDOWN_GRACE, self.endpoint.wait_idle()).await;

        self.registry.close_all();
        self.endpoint.close(quinn::VarInt::from_u32(0), b"shutdown");
        info!("Node stopped");
    }
}

/// Which of two sessions to the same peer survives. Both ends pick the one
/// dialed by the node with the smaller fingerprint.
fn prefer_new(existing: &Session, new: &Session, own_fingerprint: &str) -> bool {
    if !existing.is_live() {
        return true;
    }
    let dialer = |session: &Session| match session.direction() {
        Direction::Outbound => own_fingerprint.to_string(),
        Direction::Inbound => session.identity().fingerprint.clone(),
    };
    dialer(new) < dialer(existing)
}

async fn admit_sessions(
    mut sessions: mpsc::Receiver<Session>,
    registry: ClientRegistry,
    shares: Arc<Vec<ShareEntry>>,
    own_fingerprint: String,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        let session = tokio::select! {
            biased;
            _ = stop_rx.changed() => break,
            session = sessions.recv() => match session {
                Some(session) => session,
                None => break,
            },
        };
        let fingerprint = session.identity().fingerprint.clone();

        if let Some(existing) = registry.get(&fingerprint) {
            if !prefer_new(&existing, &session, &own_fingerprint) {
                debug!("Keeping existing session with {}", session.identity().short());
                session.close();
                continue;
            }
            debug!("Replacing session with {}", session.identity().short());
            registry.insert(session.clone());
            existing.close();
        } else {
            registry.insert(session.clone());
        }

        session.activate();

        for entry in shares.iter().filter(|entry| entry.authorized.contains(&fingerprint)) {
            if let Err(e) = session.send(Message::share(&entry.name, ShareAction::Entering)).await {
                warn!("Could not enter {} with {}: {}", entry.name, session.identity().short(), e);
            }
        }

        let registry = registry.clone();
        let shares = shares.clone();
        tokio::spawn(async move {
            session.closed().await;
            registry.remove_session(&session);
            if registry.is_connected(&fingerprint) {
                return;
            }
            info!("Peer {} disconnected", session.identity().short());
            for entry in shares.iter() {
                if entry.handle.state() == ShareState::Running {
                    let _ = entry.handle.remove_member(&fingerprint).await;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{LocalTransport, DEFAULT_QUEUE_CAPACITY};

    fn session(fingerprint: &str, direction: Direction) -> (Session, tokio::io::DuplexStream) {
        let (local, remote) = tokio::io::duplex(1024);
        let (reader, writer) = tokio::io::split(local);
        let (inbound, _) = mpsc::channel(1);
        let session = Session::spawn(
            PeerIdentity::new(fingerprint, vec![]),
            direction,
            reader,
            writer,
            inbound,
            DEFAULT_QUEUE_CAPACITY,
            Arc::new(LocalTransport),
        );
        (session, remote)
    }

    #[tokio::test]
    async fn test_duplicate_sessions_resolve_the_same_way_on_both_ends() {
        // Node "aa" dialed "bb" while "bb" dialed "aa".
        let (a_outbound, _r1) = session("bb", Direction::Outbound);
        let (a_inbound, _r2) = session("bb", Direction::Inbound);
        let (b_outbound, _r3) = session("aa", Direction::Outbound);
        let (b_inbound, _r4) = session("aa", Direction::Inbound);

        // "aa" keeps the session it dialed, whichever arrived first.
        assert!(prefer_new(&a_inbound, &a_outbound, "aa"));
        assert!(!prefer_new(&a_outbound, &a_inbound, "aa"));
        // "bb" keeps the one "aa" dialed, which is its inbound session.
        assert!(prefer_new(&b_outbound, &b_inbound, "bb"));
        assert!(!prefer_new(&b_inbound, &b_outbound, "bb"));
    }

    #[tokio::test]
    async fn test_dead_session_is_always_replaced() {
        let (old, _r1) = session("bb", Direction::Outbound);
        let (new, _r2) = session("bb", Direction::Inbound);
        old.stop();
        old.closed().await;
        assert!(prefer_new(&old, &new, "aa"));
    }
}
