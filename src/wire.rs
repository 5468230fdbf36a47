//! # Wire Protocol
//!
//! Binary framing for [`Message`] values. Every frame is
//!
//! ```text
//! +--------+----------------------+-----------------+
//! | opcode | payload length (BE)  | payload         |
//! | 1 byte | 4 bytes              | length bytes    |
//! +--------+----------------------+-----------------+
//! ```
//!
//! The payload is the JSON encoding of the variant selected by the opcode.
//! Opcode values are part of the interoperability contract and never change.

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use std::io::ErrorKind;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::WireError;
use crate::message::{Message, Payload};

pub const OP_FILE: u8 = 0x01;
pub const OP_SHARE: u8 = 0x02;
pub const OP_PEER: u8 = 0x03;
pub const OP_CHUNK_REQUEST: u8 = 0x04;
pub const OP_CHUNK_DATA: u8 = 0x05;

/// Opcode byte plus the big-endian length.
pub const HEADER_LEN: usize = 5;

/// Upper bound on a declared payload length. A full chunk grows by a third
/// once base64 encoded, so this leaves ample room.
pub const MAX_PAYLOAD_LEN: u32 = 4 * 1024 * 1024;

pub fn opcode(payload: &Payload) -> u8 {
    match payload {
        Payload::File(_) => OP_FILE,
        Payload::Share(_) => OP_SHARE,
        Payload::Peer(_) => OP_PEER,
        Payload::ChunkRequest(_) => OP_CHUNK_REQUEST,
        Payload::ChunkData(_) => OP_CHUNK_DATA,
    }
}

fn is_known_opcode(op: u8) -> bool {
    matches!(op, OP_FILE | OP_SHARE | OP_PEER | OP_CHUNK_REQUEST | OP_CHUNK_DATA)
}

/// Encode a message into one complete frame. The sender is not encoded.
pub fn encode(message: &Message) -> Result<Bytes, WireError> {
    let payload = match message.payload() {
        Payload::File(m) => serde_json::to_vec(m)?,
        Payload::Share(m) => serde_json::to_vec(m)?,
        Payload::Peer(m) => serde_json::to_vec(m)?,
        Payload::ChunkRequest(m) => serde_json::to_vec(m)?,
        Payload::ChunkData(m) => serde_json::to_vec(m)?,
    };

    if payload.len() > MAX_PAYLOAD_LEN as usize {
        return Err(WireError::ProtocolViolation(format!(
            "payload of {} bytes exceeds the frame limit",
            payload.len()
        )));
    }

    let mut frame = BytesMut::with_capacity(HEADER_LEN + payload.len());
    frame.put_u8(opcode(message.payload()));
    frame.put_u32(payload.len() as u32);
    frame.put_slice(&payload);
    Ok(frame.freeze())
}

/// Decode exactly one frame held entirely in `frame`.
pub fn decode(frame: &[u8]) -> Result<Message, WireError> {
    if frame.is_empty() {
        return Err(WireError::TransportClosed);
    }
    let op = frame[0];
    if !is_known_opcode(op) {
        return Err(unknown_opcode(op));
    }
    if frame.len() < HEADER_LEN {
        return Err(WireError::TruncatedFrame { section: "length" });
    }

    let length = u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]);
    check_length(length)?;

    let body = &frame[HEADER_LEN..];
    let length = length as usize;
    if body.len() < length {
        return Err(WireError::TruncatedFrame { section: "payload" });
    }
    if body.len() > length {
        return Err(WireError::ProtocolViolation(format!(
            "{} trailing bytes after frame",
            body.len() - length
        )));
    }

    decode_payload(op, body).map(Message::new)
}

/// Parse the payload of a known opcode.
pub fn decode_payload(op: u8, payload: &[u8]) -> Result<Payload, WireError> {
    if payload.is_empty() {
        return Err(WireError::Decode {
            opcode: op,
            reason: "empty payload".to_string(),
        });
    }

    match op {
        OP_FILE => parse(op, payload).map(Payload::File),
        OP_SHARE => parse(op, payload).map(Payload::Share),
        OP_PEER => parse(op, payload).map(Payload::Peer),
        OP_CHUNK_REQUEST => parse(op, payload).map(Payload::ChunkRequest),
        OP_CHUNK_DATA => parse(op, payload).map(Payload::ChunkData),
        other => Err(unknown_opcode(other)),
    }
}

/// Read one frame from a stream, accumulating partial reads until the whole
/// frame is present.
pub async fn read_message<R>(reader: &mut R) -> Result<Message, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut op = [0u8; 1];
    read_section(reader, &mut op, "opcode").await.map_err(|e| match e {
        WireError::TruncatedFrame { .. } => WireError::TransportClosed,
        other => other,
    })?;
    let op = op[0];
    if !is_known_opcode(op) {
        return Err(unknown_opcode(op));
    }

    let mut length = [0u8; 4];
    read_section(reader, &mut length, "length").await?;
    let length = u32::from_be_bytes(length);
    check_length(length)?;

    let mut payload = vec![0u8; length as usize];
    read_section(reader, &mut payload, "payload").await?;

    decode_payload(op, &payload).map(Message::new)
}

/// Encode and write one frame, flushing the stream afterwards.
pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode(message)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_section<R>(reader: &mut R, buf: &mut [u8], section: &'static str) -> Result<(), WireError>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Err(WireError::TruncatedFrame { section }),
        Err(e) => Err(WireError::Io(e)),
    }
}

fn check_length(length: u32) -> Result<(), WireError> {
    if length > MAX_PAYLOAD_LEN {
        return Err(WireError::ProtocolViolation(format!(
            "declared payload length {} exceeds {}",
            length, MAX_PAYLOAD_LEN
        )));
    }
    Ok(())
}

fn unknown_opcode(op: u8) -> WireError {
    WireError::ProtocolViolation(format!("unknown opcode {:#04x}", op))
}

fn parse<T: DeserializeOwned>(op: u8, payload: &[u8]) -> Result<T, WireError> {
    serde_json::from_slice(payload).map_err(|e| WireError::Decode {
        opcode: op,
        reason: e.to_string(),
    })
}
