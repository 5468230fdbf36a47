//! # Secure Sessions
//!
//! A [`Session`] is one authenticated, bidirectional message connection to a
//! peer. It runs exactly one reader task and one writer task:
//!
//! - The **writer** drains a bounded outbound queue and writes each message as
//!   one frame. [`Session::send`] waits while the queue is full, which is how
//!   backpressure reaches producers.
//! - The **reader** decodes frames, stamps them with the peer identity taken
//!   from the TLS handshake and forwards them to the dispatcher input.
//!
//! Any error in either task ends the session: the transport is closed, the stop
//! signal is raised and the other task exits. Sessions are never reconnected
//! internally; the connector dials again if needed.
//!
//! [`establish`] turns a QUIC connection into a session after checking the
//! peer's certificate fingerprint.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout, Duration};
use tracing::{debug, error, info, warn};

use crate::crypto;
use crate::error::{SessionError, WireError};
use crate::message::{Message, PeerIdentity};
use crate::wire;

/// Written by the dialer on the session stream before the first frame.
pub const PREAMBLE: &[u8; 4] = b"LMS1";

/// Default capacity of the outbound queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10;

const PREAMBLE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// The connection underneath a session's streams.
pub trait Transport: Send + Sync + 'static {
    fn close(&self, reason: &str);
    fn remote_address(&self) -> Option<SocketAddr>;
}

impl Transport for quinn::Connection {
    fn close(&self, reason: &str) {
        quinn::Connection::close(self, quinn::VarInt::from_u32(0), reason.as_bytes());
    }

    fn remote_address(&self) -> Option<SocketAddr> {
        Some(quinn::Connection::remote_address(self))
    }
}

/// Transport for sessions over in-process streams, where closing the streams
/// is all there is to do.
pub struct LocalTransport;

impl Transport for LocalTransport {
    fn close(&self, _reason: &str) {}

    fn remote_address(&self) -> Option<SocketAddr> {
        None
    }
}

struct Inner {
    identity: PeerIdentity,
    direction: Direction,
    outbound: mpsc::Sender<Message>,
    stop_tx: Arc<watch::Sender<bool>>,
    active_tx: watch::Sender<bool>,
    finished: watch::Receiver<bool>,
    transport: Arc<dyn Transport>,
}

/// Shared handle to a running session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("peer", &self.inner.identity.short())
            .field("direction", &self.inner.direction)
            .field("live", &self.is_live())
            .finish()
    }
}

impl Session {
    /// Start the reader and writer tasks over an already authenticated stream pair.
    pub fn spawn<R, W>(
        identity: PeerIdentity,
        direction: Direction,
        reader: R,
        writer: W,
        inbound: mpsc::Sender<Message>,
        capacity: usize,
        transport: Arc<dyn Transport>,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let session = Self::spawn_held(identity, direction, reader, writer, inbound, capacity, transport);
        session.activate();
        session
    }

    /// Like [`Session::spawn`], but received messages are held back until
    /// [`Session::activate`] is called.
    pub fn spawn_held<R, W>(
        identity: PeerIdentity,
        direction: Direction,
        reader: R,
        writer: W,
        inbound: mpsc::Sender<Message>,
        capacity: usize,
        transport: Arc<dyn Transport>,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity.max(1));
        let (stop_tx, _) = watch::channel(false);
        let stop_tx = Arc::new(stop_tx);
        let (active_tx, active_rx) = watch::channel(false);
        let (finished_tx, finished_rx) = watch::channel(false);

        tokio::spawn(write_loop(
            writer,
            outbound_rx,
            stop_tx.clone(),
            finished_tx,
            transport.clone(),
            identity.clone(),
        ));
        tokio::spawn(read_loop(
            reader,
            inbound,
            active_rx,
            stop_tx.clone(),
            transport.clone(),
            identity.clone(),
        ));

        info!(
            "Session with {} established ({:?}, {})",
            identity.short(),
            direction,
            transport
                .remote_address()
                .map(|a| a.to_string())
                .unwrap_or_else(|| "local".to_string())
        );

        Self {
            inner: Arc::new(Inner {
                identity,
                direction,
                outbound: outbound_tx,
                stop_tx,
                active_tx,
                finished: finished_rx,
                transport,
            }),
        }
    }

    pub fn identity(&self) -> &PeerIdentity {
        &self.inner.identity
    }

    pub fn direction(&self) -> Direction {
        self.inner.direction
    }

    pub fn remote_address(&self) -> Option<SocketAddr> {
        self.inner.transport.remote_address()
    }

    /// Whether both handles refer to the same session.
    pub fn same_as(&self, other: &Session) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Start forwarding received messages to the inbound queue.
    pub fn activate(&self) {
        self.inner.active_tx.send_replace(true);
    }

    /// Queue a message, waiting while the outbound queue is full.
    pub async fn send(&self, message: Message) -> Result<(), SessionError> {
        if self.is_stopped() {
            return Err(SessionError::TransportClosed);
        }
        self.inner
            .outbound
            .send(message)
            .await
            .map_err(|_| SessionError::TransportClosed)
    }

    /// Queue a message without waiting.
    pub fn try_send(&self, message: Message) -> Result<(), SessionError> {
        if self.is_stopped() {
            return Err(SessionError::TransportClosed);
        }
        self.inner.outbound.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SessionError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => SessionError::TransportClosed,
        })
    }

    /// Ask both tasks to exit. Messages still queued are dropped; the
    /// transport stays open so the peer sees the stream finish.
    pub fn stop(&self) {
        self.inner.stop_tx.send_replace(true);
    }

    /// Stop the session and close the underlying transport.
    pub fn close(&self) {
        self.stop();
        self.inner.transport.close("session closed");
    }

    /// Wait until the outbound queue is empty or the session has ended.
    pub async fn drain(&self) {
        let outbound = &self.inner.outbound;
        while self.is_live() && outbound.capacity() < outbound.max_capacity() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub fn is_live(&self) -> bool {
        !self.is_stopped() && !self.inner.outbound.is_closed()
    }

    /// Resolves once the writer task has exited.
    pub async fn closed(&self) {
        let mut finished = self.inner.finished.clone();
        let _ = finished.wait_for(|done| *done).await;
    }

    fn is_stopped(&self) -> bool {
        *self.inner.stop_tx.borrow()
    }
}

async fn write_loop<W>(
    mut writer: W,
    mut outbound: mpsc::Receiver<Message>,
    stop_tx: Arc<watch::Sender<bool>>,
    finished: watch::Sender<bool>,
    transport: Arc<dyn Transport>,
    identity: PeerIdentity,
) where
    W: AsyncWrite + Unpin,
{
    let mut stop_rx = stop_tx.subscribe();

    loop {
        if *stop_rx.borrow() {
            break;
        }

        let message = tokio::select! {
            biased;
            _ = stop_rx.changed() => break,
            message = outbound.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        if let Err(e) = wire::write_message(&mut writer, &message).await {
            error!("Write to {} failed: {}", identity.short(), e);
            transport.close("write failed");
            stop_tx.send_replace(true);
            break;
        }
        debug!("Sent {} message to {}", message.payload().kind(), identity.short());
    }

    outbound.close();
    let _ = writer.shutdown().await;
    finished.send_replace(true);
    debug!("Writer for {} exited", identity.short());
}

async fn read_loop<R>(
    mut reader: R,
    inbound: mpsc::Sender<Message>,
    mut active_rx: watch::Receiver<bool>,
    stop_tx: Arc<watch::Sender<bool>>,
    transport: Arc<dyn Transport>,
    identity: PeerIdentity,
) where
    R: AsyncRead + Unpin,
{
    let mut stop_rx = stop_tx.subscribe();

    tokio::select! {
        biased;
        _ = stop_rx.wait_for(|stopped| *stopped) => {
            debug!("Reader for {} stopped before activation", identity.short());
            return;
        }
        _ = active_rx.wait_for(|active| *active) => {}
    }

    loop {
        if *stop_rx.borrow() {
            debug!("Reader for {} stopped", identity.short());
            return;
        }

        let result = tokio::select! {
            biased;
            _ = stop_rx.changed() => continue,
            result = wire::read_message(&mut reader) => result,
        };

        match result {
            Ok(message) => {
                debug!("Received {} message from {}", message.payload().kind(), identity.short());
                if inbound.send(message.with_sender(identity.clone())).await.is_err() {
                    warn!("Dispatcher input closed, ending session with {}", identity.short());
                    break;
                }
            }
            Err(WireError::TransportClosed) => {
                info!("Session with {} closed by peer", identity.short());
                break;
            }
            Err(e) => {
                warn!("Session with {} failed: {}", identity.short(), e);
                break;
            }
        }
    }

    transport.close("session ended");
    stop_tx.send_replace(true);
    debug!("Reader for {} exited", identity.short());
}

/// Wait for a pending QUIC handshake.
pub async fn connect(connecting: quinn::Connecting) -> Result<quinn::Connection, SessionError> {
    connecting
        .await
        .map_err(|e| SessionError::Handshake(e.to_string()))
}

/// Identity of the peer on the other end of a completed handshake.
pub fn peer_identity(connection: &quinn::Connection) -> Result<PeerIdentity, SessionError> {
    let certificates = connection
        .peer_identity()
        .and_then(|any| any.downcast::<Vec<rustls::Certificate>>().ok())
        .ok_or_else(|| SessionError::Handshake("peer presented no certificate".to_string()))?;
    let leaf = certificates
        .first()
        .ok_or_else(|| SessionError::Handshake("peer presented an empty chain".to_string()))?;

    crypto::identity_from_certificate(&leaf.0).map_err(|e| SessionError::Handshake(e.to_string()))
}

/// Options shared by every session the node establishes.
#[derive(Clone)]
pub struct SessionSettings {
    pub inbound: mpsc::Sender<Message>,
    pub queue_capacity: usize,
}

/// Verify the peer and open the session stream.
///
/// Outbound dials name the fingerprint they expect; inbound connections must
/// present one of the `authorized` fingerprints. Either failure closes the
/// connection. The returned session holds received messages until it is
/// activated.
pub async fn establish(
    connection: quinn::Connection,
    direction: Direction,
    expected: Option<&str>,
    authorized: &HashSet<String>,
    settings: &SessionSettings,
) -> Result<Session, SessionError> {
    let identity = peer_identity(&connection)?;

    let verdict = match (direction, expected) {
        (_, Some(expected)) if expected != identity.fingerprint => Err(SessionError::IdentityMismatch {
            expected: expected.to_string(),
            actual: identity.fingerprint.clone(),
        }),
        (Direction::Inbound, None) if !authorized.contains(&identity.fingerprint) => {
            Err(SessionError::Unauthorized {
                fingerprint: identity.fingerprint.clone(),
            })
        }
        _ => Ok(()),
    };
    if let Err(e) = verdict {
        connection.close(quinn::VarInt::from_u32(1), b"identity mismatch");
        return Err(e);
    }

    let (send, recv) = match direction {
        Direction::Outbound => {
            let (mut send, recv) = connection.open_bi().await?;
            send.write_all(PREAMBLE).await?;
            (send, recv)
        }
        Direction::Inbound => {
            let (send, mut recv) = connection.accept_bi().await?;
            let mut preamble = [0u8; 4];
            match timeout(PREAMBLE_TIMEOUT, recv.read_exact(&mut preamble)).await {
                Ok(Ok(())) if &preamble == PREAMBLE => {}
                Ok(Ok(())) => {
                    connection.close(quinn::VarInt::from_u32(2), b"bad preamble");
                    return Err(SessionError::Handshake("unexpected stream preamble".to_string()));
                }
                Ok(Err(e)) => return Err(SessionError::Handshake(e.to_string())),
                Err(_) => {
                    connection.close(quinn::VarInt::from_u32(2), b"preamble timeout");
                    return Err(SessionError::Handshake("timed out waiting for preamble".to_string()));
                }
            }
            (send, recv)
        }
    };

    Ok(Session::spawn_held(
        identity,
        direction,
        recv,
        send,
        settings.inbound.clone(),
        settings.queue_capacity,
        Arc::new(connection),
    ))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use tokio::io::DuplexStream;

    /// A session over an in-memory stream whose inbound messages are dropped.
    /// The returned stream is the remote end.
    pub fn in_memory_session(identity: PeerIdentity) -> (Session, DuplexStream) {
        let (inbound, _) = mpsc::channel(1);
        in_memory_session_with(identity, inbound)
    }

    pub fn in_memory_session_with(
        identity: PeerIdentity,
        inbound: mpsc::Sender<Message>,
    ) -> (Session, DuplexStream) {
        let (local, remote) = tokio::io::duplex(1 << 20);
        let (reader, writer) = tokio::io::split(local);
        let session = Session::spawn(
            identity,
            Direction::Inbound,
            reader,
            writer,
            inbound,
            DEFAULT_QUEUE_CAPACITY,
            Arc::new(LocalTransport),
        );
        (session, remote)
    }

    /// Like [`in_memory_session`], but the stream buffers only a few bytes so
    /// the outbound queue fills as soon as the remote stops reading.
    pub fn constrained_session(identity: PeerIdentity) -> (Session, DuplexStream) {
        let (local, remote) = tokio::io::duplex(64);
        let (reader, writer) = tokio::io::split(local);
        let (inbound, _) = mpsc::channel(1);
        let session = Session::spawn(
            identity,
            Direction::Inbound,
            reader,
            writer,
            inbound,
            DEFAULT_QUEUE_CAPACITY,
            Arc::new(LocalTransport),
        );
        (session, remote)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::message::ShareAction;
    use assert_matches::assert_matches;

    fn peer() -> PeerIdentity {
        PeerIdentity::new("0123456789abcdef0123", vec![1, 2, 3])
    }

    #[tokio::test]
    async fn test_sent_messages_reach_the_stream() {
        let (session, mut remote) = in_memory_session(peer());

        session.send(Message::share("docs", ShareAction::Entering)).await.unwrap();
        let received = wire::read_message(&mut remote).await.unwrap();
        assert_eq!(received, Message::share("docs", ShareAction::Entering));
    }

    #[tokio::test]
    async fn test_received_messages_are_stamped() {
        let (inbound_tx, mut inbound_rx) = mpsc::channel(4);
        let (_session, mut remote) = in_memory_session_with(peer(), inbound_tx);

        wire::write_message(&mut remote, &Message::share("docs", ShareAction::Leaving))
            .await
            .unwrap();

        let received = inbound_rx.recv().await.unwrap();
        assert_eq!(received.sender(), Some(&peer()));
        assert_eq!(received.payload(), Message::share("docs", ShareAction::Leaving).payload());
    }

    #[tokio::test]
    async fn test_peer_eof_ends_session() {
        let (inbound_tx, _inbound_rx) = mpsc::channel(4);
        let (session, remote) = in_memory_session_with(peer(), inbound_tx);

        drop(remote);
        session.closed().await;
        assert!(!session.is_live());
        assert_matches!(
            session.send(Message::share("docs", ShareAction::Entering)).await,
            Err(SessionError::TransportClosed)
        );
    }

    #[tokio::test]
    async fn test_garbage_ends_session() {
        let (inbound_tx, _inbound_rx) = mpsc::channel(4);
        let (session, mut remote) = in_memory_session_with(peer(), inbound_tx);

        remote.write_all(&[0x7f, 0, 0, 0, 0]).await.unwrap();
        session.closed().await;
        assert!(!session.is_live());
    }

    #[tokio::test]
    async fn test_stop_is_observed() {
        let (session, _remote) = in_memory_session(peer());
        assert!(session.is_live());

        session.stop();
        session.closed().await;
        assert!(!session.is_live());
    }

    #[tokio::test]
    async fn test_held_session_forwards_after_activation() {
        let (local, mut remote) = tokio::io::duplex(1024);
        let (reader, writer) = tokio::io::split(local);
        let (inbound_tx, mut inbound_rx) = mpsc::channel(4);
        let session = Session::spawn_held(
            peer(),
            Direction::Inbound,
            reader,
            writer,
            inbound_tx,
            DEFAULT_QUEUE_CAPACITY,
            Arc::new(LocalTransport),
        );

        wire::write_message(&mut remote, &Message::share("docs", ShareAction::Entering))
            .await
            .unwrap();
        assert!(timeout(Duration::from_millis(100), inbound_rx.recv()).await.is_err());

        session.activate();
        let received = timeout(Duration::from_secs(5), inbound_rx.recv()).await.unwrap().unwrap();
        assert_eq!(received.sender(), Some(&peer()));
    }

    #[tokio::test]
    async fn test_drain_then_stop_delivers_queued_messages() {
        let (session, mut remote) = in_memory_session(peer());

        for _ in 0..3 {
            session.send(Message::share("docs", ShareAction::Leaving)).await.unwrap();
        }
        session.drain().await;
        session.stop();
        session.closed().await;

        for _ in 0..3 {
            let received = wire::read_message(&mut remote).await.unwrap();
            assert_eq!(received, Message::share("docs", ShareAction::Leaving));
        }
        assert_matches!(wire::read_message(&mut remote).await, Err(WireError::TransportClosed));
    }

    #[tokio::test]
    async fn test_try_send_reports_full_queue() {
        // A one-byte pipe stalls the writer so the queue fills up.
        let (local, _remote) = tokio::io::duplex(1);
        let (reader, writer) = tokio::io::split(local);
        let (inbound, _) = mpsc::channel(1);
        let session = Session::spawn(
            peer(),
            Direction::Outbound,
            reader,
            writer,
            inbound,
            1,
            Arc::new(LocalTransport),
        );

        let message = Message::share("docs", ShareAction::Entering);
        let mut saw_full = false;
        for _ in 0..8 {
            if let Err(e) = session.try_send(message.clone()) {
                assert_matches!(e, SessionError::QueueFull);
                saw_full = true;
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(saw_full);
    }
}
