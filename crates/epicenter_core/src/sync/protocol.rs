//! Sync wire protocol.
//!
//! # Wire Format
//!
//! Every frame is a one-byte type tag followed by a length-prefixed payload:
//!
//! ```text
//! tag: u8 | varUint(len) | payload[len]
//! ```
//!
//! | tag | message           | payload                         |
//! |-----|-------------------|---------------------------------|
//! | 0   | `SYNC_STEP1`      | state vector of the sender      |
//! | 1   | `SYNC_STEP2`      | update the recipient is missing |
//! | 2   | `SYNC_UPDATE`     | incremental update              |
//! | 3   | `AWARENESS`       | awareness update                |
//! | 4   | `QUERY_AWARENESS` | empty                           |
//!
//! A transport message may carry several frames back to back; use
//! [`SyncMessage::decode_all`] to read them.
//!
//! varUint uses 7 bits per byte with the most significant bit marking
//! continuation, so small lengths cost one byte.

use thiserror::Error;

pub const MSG_SYNC_STEP1: u8 = 0;
pub const MSG_SYNC_STEP2: u8 = 1;
pub const MSG_SYNC_UPDATE: u8 = 2;
pub const MSG_AWARENESS: u8 = 3;
pub const MSG_QUERY_AWARENESS: u8 = 4;

/// Errors produced while decoding frames.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("frame is truncated")]
    Truncated,

    #[error("unknown message type {0}")]
    UnknownMessageType(u8),

    #[error("varUint does not fit in 64 bits")]
    VarIntOverflow,

    #[error("invalid awareness payload: {0}")]
    InvalidAwareness(String),
}

// ===========================================================================
// VarUint encoding/decoding
// ===========================================================================

/// Write a variable-length unsigned integer to a buffer.
pub(crate) fn write_var_uint(buf: &mut Vec<u8>, mut num: u64) {
    loop {
        let mut byte = (num & 0x7F) as u8;
        num >>= 7;
        if num > 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if num == 0 {
            break;
        }
    }
}

/// Read a variable-length unsigned integer.
/// Returns `(value, bytes_consumed)`.
pub(crate) fn read_var_uint(data: &[u8]) -> Result<(u64, usize), ProtocolError> {
    let mut num: u64 = 0;
    let mut shift = 0;
    for (i, &byte) in data.iter().enumerate() {
        if shift > 63 {
            return Err(ProtocolError::VarIntOverflow);
        }
        num |= ((byte & 0x7F) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok((num, i + 1));
        }
        shift += 7;
    }
    Err(ProtocolError::Truncated)
}

/// Write a byte array with a varUint length prefix.
pub(crate) fn write_var_bytes(buf: &mut Vec<u8>, data: &[u8]) {
    write_var_uint(buf, data.len() as u64);
    buf.extend_from_slice(data);
}

/// Read a length-prefixed byte array without copying it.
pub(crate) fn read_var_bytes(data: &[u8]) -> Result<(&[u8], usize), ProtocolError> {
    let (len, len_bytes) = read_var_uint(data)?;
    let len = usize::try_from(len).map_err(|_| ProtocolError::Truncated)?;
    let end = len_bytes.checked_add(len).ok_or(ProtocolError::Truncated)?;
    if data.len() < end {
        return Err(ProtocolError::Truncated);
    }
    Ok((&data[len_bytes..end], end))
}

pub(crate) fn write_var_string(buf: &mut Vec<u8>, s: &str) {
    write_var_bytes(buf, s.as_bytes());
}

pub(crate) fn read_var_string(data: &[u8]) -> Result<(String, usize), ProtocolError> {
    let (bytes, consumed) = read_var_bytes(data)?;
    let s = std::str::from_utf8(bytes)
        .map_err(|e| ProtocolError::InvalidAwareness(format!("string is not UTF-8: {}", e)))?;
    Ok((s.to_string(), consumed))
}

/// One protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    /// The sender's state vector.
    SyncStep1(Vec<u8>),
    /// Everything the recipient was missing.
    SyncStep2(Vec<u8>),
    /// An incremental update.
    Update(Vec<u8>),
    /// Encoded awareness update, see [`Awareness`](super::Awareness).
    Awareness(Vec<u8>),
    /// Request every known awareness state.
    QueryAwareness,
}

impl SyncMessage {
    pub fn tag(&self) -> u8 {
        match self {
            SyncMessage::SyncStep1(_) => MSG_SYNC_STEP1,
            SyncMessage::SyncStep2(_) => MSG_SYNC_STEP2,
            SyncMessage::Update(_) => MSG_SYNC_UPDATE,
            SyncMessage::Awareness(_) => MSG_AWARENESS,
            SyncMessage::QueryAwareness => MSG_QUERY_AWARENESS,
        }
    }

    fn payload(&self) -> &[u8] {
        match self {
            SyncMessage::SyncStep1(p)
            | SyncMessage::SyncStep2(p)
            | SyncMessage::Update(p)
            | SyncMessage::Awareness(p) => p,
            SyncMessage::QueryAwareness => &[],
        }
    }

    /// Encode as a single frame.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_into(&mut buf);
        buf
    }

    /// Append this frame to `buf`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        let payload = self.payload();
        buf.reserve(1 + 5 + payload.len());
        buf.push(self.tag());
        write_var_bytes(buf, payload);
    }

    /// Encode several frames into one transport message.
    pub fn encode_all(messages: &[SyncMessage]) -> Vec<u8> {
        let mut buf = Vec::new();
        for message in messages {
            message.encode_into(&mut buf);
        }
        buf
    }

    /// Decode the first frame of `data`.
    /// Returns the message and the number of bytes consumed.
    pub fn decode(data: &[u8]) -> Result<(Self, usize), ProtocolError> {
        let (&tag, rest) = data.split_first().ok_or(ProtocolError::Truncated)?;
        let (payload, consumed) = read_var_bytes(rest)?;
        let message = match tag {
            MSG_SYNC_STEP1 => SyncMessage::SyncStep1(payload.to_vec()),
            MSG_SYNC_STEP2 => SyncMessage::SyncStep2(payload.to_vec()),
            MSG_SYNC_UPDATE => SyncMessage::Update(payload.to_vec()),
            MSG_AWARENESS => SyncMessage::Awareness(payload.to_vec()),
            MSG_QUERY_AWARENESS => SyncMessage::QueryAwareness,
            other => return Err(ProtocolError::UnknownMessageType(other)),
        };
        Ok((message, 1 + consumed))
    }

    /// Decode every frame of a transport message.
    ///
    /// Fails as a whole if any frame is malformed so that a damaged message
    /// is never half applied.
    pub fn decode_all(data: &[u8]) -> Result<Vec<Self>, ProtocolError> {
        let mut messages = Vec::new();
        let mut offset = 0;
        while offset < data.len() {
            let (message, consumed) = Self::decode(&data[offset..])?;
            messages.push(message);
            offset += consumed;
        }
        if messages.is_empty() {
            return Err(ProtocolError::Truncated);
        }
        Ok(messages)
    }
}
