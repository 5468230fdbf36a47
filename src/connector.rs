//! # Peer Connector and Finder
//!
//! Two background loops that turn peer knowledge into sessions:
//!
//! - [`PeerConnector`] consumes [`PeerInfo`] dial requests, dials them with
//!   the node endpoint and verifies the peer presents the expected fingerprint.
//! - [`PeerFinder`] periodically resolves configured peer names through a
//!   [`PeerResolver`] and issues dial requests for peers that are not
//!   connected.
//!
//! Failed dials are logged and dropped. Nothing is retried until the next
//! request for the same peer.

use async_trait::async_trait;
use parking_lot::Mutex;
use quinn::Endpoint;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::crypto::SERVER_NAME;
use crate::error::{ConnectorError, SessionError};
use crate::p2p::ClientRegistry;
use crate::session::{self, Direction, Session, SessionSettings};

/// Capacity of the dial request queue.
pub const DIAL_QUEUE_CAPACITY: usize = 10;

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(10);

/// A dial target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerInfo {
    pub address: String,
    pub port: u16,
    pub fingerprint: String,
}

/// Dial `target` and establish a session, requiring the advertised fingerprint.
pub async fn dial(
    endpoint: &Endpoint,
    target: &PeerInfo,
    settings: &SessionSettings,
) -> Result<Session, ConnectorError> {
    let addr = tokio::net::lookup_host((target.address.as_str(), target.port))
        .await?
        .next()
        .ok_or_else(|| ConnectorError::Resolve(format!("{}:{}", target.address, target.port)))?;

    let connecting = endpoint.connect(addr, SERVER_NAME).map_err(SessionError::from)?;
    let connection = timeout(DIAL_TIMEOUT, session::connect(connecting))
        .await
        .map_err(|_| SessionError::Handshake(format!("dial to {} timed out", addr)))??;

    let session = session::establish(
        connection,
        Direction::Outbound,
        Some(&target.fingerprint),
        &HashSet::new(),
        settings,
    )
    .await?;
    Ok(session)
}

pub struct PeerConnector {
    requests: mpsc::Sender<PeerInfo>,
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PeerConnector {
    /// Start the dial loop. Established sessions are sent on `output`.
    pub fn start(endpoint: Endpoint, settings: SessionSettings, output: mpsc::Sender<Session>) -> Self {
        let (requests_tx, mut requests_rx) = mpsc::channel::<PeerInfo>(DIAL_QUEUE_CAPACITY);
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            info!("Peer connector running");
            loop {
                let target = tokio::select! {
                    biased;
                    _ = stop_rx.changed() => break,
                    target = requests_rx.recv() => match target {
                        Some(target) => target,
                        None => break,
                    },
                };

                debug!("Dialing {}:{}", target.address, target.port);
                match dial(&endpoint, &target, &settings).await {
                    Ok(session) => {
                        if output.send(session.clone()).await.is_err() {
                            session.close();
                            break;
                        }
                    }
                    Err(e) => warn!("Could not connect to {}:{}: {}", target.address, target.port, e),
                }
            }
            info!("Peer connector stopped");
        });

        Self {
            requests: requests_tx,
            stop_tx,
            task,
        }
    }

    /// Queue on which dial requests are accepted.
    pub fn requests(&self) -> mpsc::Sender<PeerInfo> {
        self.requests.clone()
    }

    pub async fn stop(self) {
        self.stop_tx.send_replace(true);
        let _ = self.task.await;
    }
}

/// Looks up where a named peer can currently be reached.
#[async_trait]
pub trait PeerResolver: Send + Sync {
    async fn resolve(&self, name: &str) -> Result<Option<(String, u16)>, ConnectorError>;
}

#[derive(Debug, Deserialize)]
struct Announcement {
    address: String,
    port: u16,
}

/// Resolves peers through an HTTP announce endpoint:
/// `GET {base}/peers/{name}` returns `{"address": .., "port": ..}` or 404.
pub struct HttpAnnounceResolver {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAnnounceResolver {
    pub fn new(base_url: &str) -> Result<Self, ConnectorError> {
        let client = reqwest::Client::builder().timeout(ANNOUNCE_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn peer_url(&self, name: &str) -> String {
        format!("{}/peers/{}", self.base_url, name)
    }
}

#[async_trait]
impl PeerResolver for HttpAnnounceResolver {
    async fn resolve(&self, name: &str) -> Result<Option<(String, u16)>, ConnectorError> {
        let response = self.client.get(self.peer_url(name)).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let announcement: Announcement = response.error_for_status()?.json().await?;
        Ok(Some((announcement.address, announcement.port)))
    }
}

type KnownPeers = Arc<Mutex<HashMap<String, String>>>;

/// Polls the resolver for every known peer that is not connected.
pub struct PeerFinder {
    known: KnownPeers,
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PeerFinder {
    pub fn start(
        resolver: Arc<dyn PeerResolver>,
        registry: ClientRegistry,
        poll_interval: Duration,
        dial_requests: mpsc::Sender<PeerInfo>,
    ) -> Self {
        let known: KnownPeers = Arc::new(Mutex::new(HashMap::new()));
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let peers = known.clone();

        let task = tokio::spawn(async move {
            let mut ticker = interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!("Peer finder polling every {:?}", poll_interval);

            loop {
                tokio::select! {
                    biased;
                    _ = stop_rx.changed() => break,
                    _ = ticker.tick() => {
                        poll_once(resolver.as_ref(), &registry, &peers, &dial_requests).await;
                    }
                }
            }
            info!("Peer finder stopped");
        });

        Self { known, stop_tx, task }
    }

    pub fn add_peer(&self, name: &str, fingerprint: &str) {
        self.known.lock().insert(name.to_string(), fingerprint.to_string());
    }

    pub fn remove_peer(&self, name: &str) -> bool {
        self.known.lock().remove(name).is_some()
    }

    pub fn known_peers(&self) -> Vec<(String, String)> {
        self.known
            .lock()
            .iter()
            .map(|(name, fingerprint)| (name.clone(), fingerprint.clone()))
            .collect()
    }

    pub async fn stop(self) {
        self.stop_tx.send_replace(true);
        let _ = self.task.await;
    }
}

async fn poll_once(
    resolver: &dyn PeerResolver,
    registry: &ClientRegistry,
    known: &KnownPeers,
    dial_requests: &mpsc::Sender<PeerInfo>,
) {
    let snapshot: Vec<(String, String)> = known
        .lock()
        .iter()
        .map(|(name, fingerprint)| (name.clone(), fingerprint.clone()))
        .collect();

    for (name, fingerprint) in snapshot {
        if registry.is_connected(&fingerprint) {
            continue;
        }

        match resolver.resolve(&name).await {
            Ok(Some((address, port))) => {
                debug!("{} announced at {}:{}", name, address, port);
                let target = PeerInfo {
                    address,
                    port,
                    fingerprint,
                };
                if dial_requests.send(target).await.is_err() {
                    return;
                }
            }
            Ok(None) => debug!("{} is not announced", name),
            Err(e) => warn!("Could not resolve {}: {}", name, e),
        }
    }
}
