//! Wire codec for the device UDP protocol.
//!
//! Every datagram begins with a fixed 16-byte header: 4-byte magic `VAPB`,
//! 1-byte version, 1-byte packet type, 2 reserved bytes, 4-byte big-endian
//! session id, 4-byte big-endian sequence number. Payload follows
//! immediately. CONTROL payloads are UTF-8 JSON.

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use crate::error::{BridgeError, Result};

pub const MAGIC: &[u8; 4] = b"VAPB";
pub const VERSION: u8 = 1;
pub const HEADER_LEN: usize = 16;
pub const MAX_UDP_PACKET_SIZE: usize = 508;
pub const MAX_UDP_PAYLOAD_SIZE: usize = 480;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    MicAudio = 1,
    SpkAudio = 2,
    Control = 3,
}

impl PacketType {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::MicAudio),
            2 => Some(Self::SpkAudio),
            3 => Some(Self::Control),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub packet_type: PacketType,
    pub session_id: u32,
    pub seq: u32,
}

/// Encode a frame: header followed by `payload`.
pub fn encode(packet_type: PacketType, session_id: u32, seq: u32, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_slice(MAGIC);
    buf.put_u8(VERSION);
    buf.put_u8(packet_type as u8);
    buf.put_u16(0); // reserved
    buf.put_u32(session_id);
    buf.put_u32(seq);
    buf.put_slice(payload);
    buf.freeze()
}

/// Decode a frame into its header and payload slice.
pub fn decode(bytes: &[u8]) -> Result<(Header, &[u8])> {
    if bytes.len() < HEADER_LEN {
        return Err(BridgeError::bad_frame(format!(
            "frame too short: {} bytes",
            bytes.len()
        )));
    }
    if &bytes[0..4] != MAGIC {
        return Err(BridgeError::bad_frame("bad magic"));
    }
    let version = bytes[4];
    if version != VERSION {
        return Err(BridgeError::bad_frame(format!(
            "unsupported version {version}"
        )));
    }
    let packet_type = PacketType::from_byte(bytes[5])
        .ok_or_else(|| BridgeError::bad_frame(format!("unknown packet type {}", bytes[5])))?;
    let session_id = BigEndian::read_u32(&bytes[8..12]);
    let seq = BigEndian::read_u32(&bytes[12..16]);
    Ok((
        Header {
            packet_type,
            session_id,
            seq,
        },
        &bytes[HEADER_LEN..],
    ))
}

/// Serialize `obj` as compact JSON and wrap it as a CONTROL frame.
pub fn encode_control<T: Serialize>(obj: &T, session_id: u32, seq: u32) -> Result<Bytes> {
    let json = serde_json::to_vec(obj).map_err(|e| BridgeError::bad_control(e.to_string()))?;
    Ok(encode(PacketType::Control, session_id, seq, &json))
}

/// Parse a CONTROL payload as JSON.
pub fn decode_control<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    serde_json::from_slice(payload).map_err(|e| BridgeError::bad_control(e.to_string()))
}

/// Parse a CONTROL payload as a loosely-typed JSON value, for dispatch on `type`.
pub fn decode_control_value(payload: &[u8]) -> Result<Value> {
    serde_json::from_slice(payload).map_err(|e| BridgeError::bad_control(e.to_string()))
}

/// Split `payload` into chunks of at most `MAX_UDP_PAYLOAD_SIZE` bytes each.
pub fn chunk_payload(payload: &[u8]) -> impl Iterator<Item = &[u8]> {
    payload.chunks(MAX_UDP_PAYLOAD_SIZE)
}
