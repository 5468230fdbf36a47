//! # Error Types
//!
//! One error enum per layer. Wire and session errors are terminal for the
//! session that produced them; share and store errors are terminal only for the
//! operation in progress; dispatcher errors are returned to the caller with no
//! state change.

use std::path::PathBuf;
use thiserror::Error;

/// Errors produced while framing or parsing messages.
#[derive(Error, Debug)]
pub enum WireError {
    /// The stream ended in the middle of a frame.
    #[error("truncated frame: stream ended while reading {section}")]
    TruncatedFrame { section: &'static str },

    /// A known opcode carried an empty or malformed payload.
    #[error("cannot decode payload for opcode {opcode:#04x}: {reason}")]
    Decode { opcode: u8, reason: String },

    /// The peer sent something no conforming implementation would send.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The stream ended cleanly on a frame boundary.
    #[error("transport closed")]
    TransportClosed,

    #[error("cannot encode message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that end a session or prevent one from being established.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("identity mismatch: expected {expected}, peer presented {actual}")]
    IdentityMismatch { expected: String, actual: String },

    #[error("unauthorized peer {fingerprint}")]
    Unauthorized { fingerprint: String },

    #[error("transport closed")]
    TransportClosed,

    #[error("outbound queue is full")]
    QueueFull,

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("connection error: {0}")]
    Connection(#[from] quinn::ConnectionError),

    #[error("connect error: {0}")]
    Connect(#[from] quinn::ConnectError),

    #[error("stream write error: {0}")]
    Write(#[from] quinn::WriteError),
}

impl SessionError {
    /// Whether the peer presented a certificate other than the one we trust.
    pub fn is_identity_mismatch(&self) -> bool {
        matches!(self, SessionError::IdentityMismatch { .. } | SessionError::Unauthorized { .. })
    }
}

/// Errors from credential loading and fingerprint derivation.
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no certificate found in {0}")]
    MissingCertificate(PathBuf),

    #[error("no private key found in {0}")]
    MissingKey(PathBuf),

    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),

    #[error("certificate generation failed: {0}")]
    Generation(#[from] rcgen::Error),

    #[error("TLS configuration error: {0}")]
    Tls(#[from] rustls::Error),
}

/// Misuse of the dispatcher registry or lifecycle.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum DispatchError {
    #[error("handler {0} is already registered")]
    AlreadyRegistered(String),

    #[error("handler {0} is not registered")]
    NotRegistered(String),

    #[error("dispatcher is already running")]
    AlreadyRunning,

    #[error("handler {0} is no longer accepting messages")]
    HandlerClosed(String),
}

/// Failures of the metadata store collaborator.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store index is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Errors raised by share-local filesystem operations.
#[derive(Error, Debug)]
pub enum ShareError {
    #[error("name conflict: {0} exists with the wrong kind")]
    NameConflict(PathBuf),

    #[error("invalid share path {0:?}")]
    InvalidPath(String),

    #[error("share path {0:?} passes through a symbolic link")]
    Symlinked(String),

    #[error("chunk {index} is out of range for {path}")]
    ChunkOutOfRange { path: String, index: u64 },

    #[error("chunk of {len} bytes exceeds the chunk size")]
    OversizedChunk { len: usize },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while turning a dial request into a session.
#[derive(Error, Debug)]
pub enum ConnectorError {
    #[error("cannot resolve {0}")]
    Resolve(String),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("announce endpoint error: {0}")]
    Announce(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
