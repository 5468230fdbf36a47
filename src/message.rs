//! # Message Model
//!
//! The closed set of messages exchanged between peers. Every payload variant
//! maps to exactly one wire opcode (see [`crate::wire`]). The sender identity
//! is never part of the encoded payload: the receiving session stamps it after
//! decoding, so a peer cannot claim to be someone else.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// SHA-1 content digest, the hash family used for fingerprints and file content.
pub type Digest = [u8; 20];

/// Stable identity of an authenticated peer.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PeerIdentity {
    pub fingerprint: String,
    pub public_key: Vec<u8>,
}

impl PeerIdentity {
    pub fn new(fingerprint: impl Into<String>, public_key: Vec<u8>) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            public_key,
        }
    }

    /// Shortened fingerprint for log lines.
    pub fn short(&self) -> &str {
        let end = self.fingerprint.len().min(12);
        &self.fingerprint[..end]
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileAction {
    Created,
    Updated,
    Removed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ShareAction {
    Entering,
    Leaving,
}

/// A file or directory changed inside a share.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMessage {
    pub share_name: String,
    pub filename: String,
    pub is_directory: bool,
    pub action: FileAction,
    #[serde(default, with = "hex_digest", skip_serializing_if = "Option::is_none")]
    pub hash: Option<Digest>,
}

/// A peer joins or leaves a share.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareMessage {
    pub share_name: String,
    pub action: ShareAction,
}

/// Advertisement of a reachable peer and the shares it serves.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerMessage {
    pub peer_name: String,
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub share_names: Vec<String>,
}

/// Ask a member for one chunk of a file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRequest {
    pub share_name: String,
    pub filename: String,
    pub index: u64,
}

/// One chunk of file content, together with the full file size.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkData {
    pub share_name: String,
    pub filename: String,
    pub index: u64,
    pub total_size: u64,
    #[serde(with = "base64_bytes")]
    pub data: Bytes,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload {
    File(FileMessage),
    Share(ShareMessage),
    Peer(PeerMessage),
    ChunkRequest(ChunkRequest),
    ChunkData(ChunkData),
}

impl Payload {
    /// Name of the share this payload is addressed to. Peer advertisements
    /// list several shares and are not addressed to a single one.
    pub fn share_name(&self) -> Option<&str> {
        match self {
            Payload::File(m) => Some(&m.share_name),
            Payload::Share(m) => Some(&m.share_name),
            Payload::Peer(_) => None,
            Payload::ChunkRequest(m) => Some(&m.share_name),
            Payload::ChunkData(m) => Some(&m.share_name),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Payload::File(_) => "file",
            Payload::Share(_) => "share",
            Payload::Peer(_) => "peer",
            Payload::ChunkRequest(_) => "chunk-request",
            Payload::ChunkData(_) => "chunk-data",
        }
    }
}

/// A decoded or to-be-encoded protocol message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    sender: Option<PeerIdentity>,
    payload: Payload,
}

impl Message {
    pub fn new(payload: Payload) -> Self {
        Self { sender: None, payload }
    }

    /// Identity of the session this message arrived on; `None` for locally
    /// built messages.
    pub fn sender(&self) -> Option<&PeerIdentity> {
        self.sender.as_ref()
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn into_payload(self) -> Payload {
        self.payload
    }

    /// Stamp the receiving session's peer identity. Only the session reader
    /// (and tests standing in for it) call this.
    pub fn with_sender(mut self, sender: PeerIdentity) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn file(
        share_name: &str,
        filename: &str,
        is_directory: bool,
        action: FileAction,
        hash: Option<Digest>,
    ) -> Self {
        Self::new(Payload::File(FileMessage {
            share_name: share_name.to_string(),
            filename: filename.to_string(),
            is_directory,
            action,
            hash,
        }))
    }

    pub fn share(share_name: &str, action: ShareAction) -> Self {
        Self::new(Payload::Share(ShareMessage {
            share_name: share_name.to_string(),
            action,
        }))
    }
}

mod hex_digest {
    use super::Digest;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Digest>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(digest) => serializer.serialize_some(&hex::encode(digest)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Digest>, D::Error> {
        let Some(text) = Option::<String>::deserialize(deserializer)? else {
            return Ok(None);
        };
        let bytes = hex::decode(&text).map_err(D::Error::custom)?;
        let digest: Digest = bytes
            .try_into()
            .map_err(|b: Vec<u8>| D::Error::custom(format!("digest has {} bytes, expected 20", b.len())))?;
        Ok(Some(digest))
    }
}

mod base64_bytes {
    use base64::prelude::*;
    use bytes::Bytes;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64_STANDARD.encode(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let text = String::deserialize(deserializer)?;
        BASE64_STANDARD
            .decode(text.as_bytes())
            .map(Bytes::from)
            .map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_share_name_routing() {
        let file = Message::file("docs", "a.txt", false, FileAction::Created, None);
        assert_eq!(file.payload().share_name(), Some("docs"));

        let peer = Message::new(Payload::Peer(PeerMessage {
            peer_name: "laptop".to_string(),
            address: "10.0.0.2".to_string(),
            port: 41337,
            share_names: vec!["docs".to_string()],
        }));
        assert_eq!(peer.payload().share_name(), None);
    }

    #[test]
    fn test_sender_is_stamped_not_constructed() {
        let msg = Message::share("docs", ShareAction::Entering);
        assert!(msg.sender().is_none());

        let stamped = msg.with_sender(PeerIdentity::new("abcdef0123456789", vec![1, 2, 3]));
        assert_eq!(stamped.sender().unwrap().short(), "abcdef012345");
    }

    #[test]
    fn test_digest_serializes_as_hex() {
        let msg = FileMessage {
            share_name: "docs".to_string(),
            filename: "x".to_string(),
            is_directory: false,
            action: FileAction::Updated,
            hash: Some([0xab; 20]),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(&"ab".repeat(20)));
        assert!(json.contains("\"UPDATED\""));
    }

    #[test]
    fn test_bad_digest_length_rejected() {
        let json = r#"{"share_name":"s","filename":"f","is_directory":false,"action":"CREATED","hash":"abcd"}"#;
        assert!(serde_json::from_str::<FileMessage>(json).is_err());
    }
}
