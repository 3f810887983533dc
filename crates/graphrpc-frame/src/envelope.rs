use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};

/// Envelope header: magic (2) + kind (1) + length (4) = 7 bytes.
pub const ENVELOPE_HEADER_SIZE: usize = 7;

/// Magic bytes: "GR" (0x47 0x52).
pub const MAGIC: [u8; 2] = [0x47, 0x52];

/// Default maximum envelope payload size: 16 MiB.
pub const DEFAULT_MAX_MESSAGE: usize = 16 * 1024 * 1024;

/// Normal closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// The endpoint is going away (process shutdown, session replaced).
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// The peer violated the protocol.
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;

/// What an envelope carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EnvelopeKind {
    /// One wire frame (a call or a response).
    Data = 0,
    /// Orderly close: `u16` code followed by a UTF-8 reason.
    Close = 1,
    /// Session handshake document.
    Handshake = 2,
}

impl TryFrom<u8> for EnvelopeKind {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Data),
            1 => Ok(Self::Close),
            2 => Ok(Self::Handshake),
            other => Err(FrameError::UnknownEnvelopeKind(other)),
        }
    }
}

/// One logical message on the byte stream.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// What the payload holds.
    pub kind: EnvelopeKind,
    /// The message payload.
    pub payload: Bytes,
}

impl Envelope {
    /// Create a new envelope.
    pub fn new(kind: EnvelopeKind, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    /// Create a data envelope.
    pub fn data(payload: impl Into<Bytes>) -> Self {
        Self::new(EnvelopeKind::Data, payload)
    }

    /// Create a close envelope.
    pub fn close(code: u16, reason: &str) -> Self {
        let mut payload = BytesMut::with_capacity(2 + reason.len());
        payload.put_u16_le(code);
        payload.put_slice(reason.as_bytes());
        Self::new(EnvelopeKind::Close, payload.freeze())
    }

    /// Parse the code and reason of a close envelope.
    ///
    /// An empty close payload means [`CLOSE_NORMAL`] with no reason.
    pub fn close_reason(&self) -> Result<(u16, String)> {
        if self.payload.is_empty() {
            return Ok((CLOSE_NORMAL, String::new()));
        }
        if self.payload.len() < 2 {
            return Err(FrameError::InvalidFrame(
                "close payload shorter than its code".to_string(),
            ));
        }
        let mut payload = self.payload.clone();
        let code = payload.get_u16_le();
        let reason = String::from_utf8(payload.to_vec())?;
        Ok((code, reason))
    }

    /// The total wire size of this envelope (header + payload).
    pub fn wire_size(&self) -> usize {
        ENVELOPE_HEADER_SIZE + self.payload.len()
    }
}

/// Encode an envelope into the wire format.
///
/// Wire format:
/// ```text
/// ┌──────────────┬──────────┬───────────┬─────────────────┐
/// │ Magic (2B)   │ Kind     │ Length    │ Payload         │
/// │ 0x47 0x52    │ (1B)     │ (4B LE)   │ (Length bytes)  │
/// │ "GR"         │          │           │                 │
/// └──────────────┴──────────┴───────────┴─────────────────┘
/// ```
pub fn encode_envelope(kind: EnvelopeKind, payload: &[u8], dst: &mut BytesMut) -> Result<()> {
    if payload.len() > u32::MAX as usize {
        return Err(FrameError::PayloadTooLarge {
            size: payload.len(),
            max: u32::MAX as usize,
        });
    }
    dst.reserve(ENVELOPE_HEADER_SIZE + payload.len());
    dst.put_slice(&MAGIC);
    dst.put_u8(kind as u8);
    dst.put_u32_le(payload.len() as u32);
    dst.put_slice(payload);
    Ok(())
}

/// Decode an envelope from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete envelope yet.
/// On success, consumes the envelope bytes from the buffer.
pub fn decode_envelope(src: &mut BytesMut, max_payload: usize) -> Result<Option<Envelope>> {
    if src.len() < ENVELOPE_HEADER_SIZE {
        return Ok(None);
    }

    if src[0..2] != MAGIC {
        return Err(FrameError::InvalidMagic);
    }

    let kind = EnvelopeKind::try_from(src[2])?;
    let payload_len = u32::from_le_bytes([src[3], src[4], src[5], src[6]]) as usize;

    if payload_len > max_payload {
        return Err(FrameError::PayloadTooLarge {
            size: payload_len,
            max: max_payload,
        });
    }

    let total = ENVELOPE_HEADER_SIZE + payload_len;
    if src.len() < total {
        return Ok(None);
    }

    src.advance(ENVELOPE_HEADER_SIZE);
    let payload = src.split_to(payload_len).freeze();

    Ok(Some(Envelope { kind, payload }))
}

/// Configuration for envelope readers and writers.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum envelope payload size in bytes. Default: 16 MiB.
    pub max_message_size: usize,
    /// Read timeout for blocking operations.
    pub read_timeout: Option<std::time::Duration>,
    /// Write timeout for blocking operations.
    pub write_timeout: Option<std::time::Duration>,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE,
            read_timeout: None,
            write_timeout: None,
        }
    }
}
