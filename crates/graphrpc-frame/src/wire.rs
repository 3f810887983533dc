//! Wire frame layout.
//!
//! ```text
//! ┌─────────┬───────┬──────────────┬──────────────┬─────────────┬──────────────────────────┐
//! │ version │ flags │ value length │ value stream │ string count│ per string: len, utf-8   │
//! │ u8      │ u8    │ u32 LE       │ (length B)   │ u32 LE      │ u32 LE, (len B)          │
//! └─────────┴───────┴──────────────┴──────────────┴─────────────┴──────────────────────────┘
//! ```

use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};
use crate::strings::StringTable;

/// Current wire version.
pub const WIRE_VERSION: u8 = 1;

/// Fixed header: version (1) + flags (1) + value length (4).
pub const FRAME_HEADER_SIZE: usize = 6;

/// Flag: the value stream carries a callback id right after the recipient.
pub const FLAG_CALLBACK: u8 = 0x01;

/// A decoded frame before value reading starts.
#[derive(Debug, Clone)]
pub struct WireFrame {
    pub version: u8,
    pub flags: u8,
    pub values: Bytes,
    pub strings: Vec<Arc<str>>,
}

/// Encode a finished value stream and its string table.
pub fn encode_wire_frame(
    flags: u8,
    values: &[u8],
    strings: &StringTable,
    dst: &mut BytesMut,
) -> Result<()> {
    let too_large = |size: usize| FrameError::PayloadTooLarge {
        size,
        max: u32::MAX as usize,
    };
    let values_len = u32::try_from(values.len()).map_err(|_| too_large(values.len()))?;
    let string_count = u32::try_from(strings.len()).map_err(|_| too_large(strings.len()))?;

    let table_bytes: usize = strings.entries().map(|s| 4 + s.len()).sum();
    dst.reserve(FRAME_HEADER_SIZE + values.len() + 4 + table_bytes);

    dst.put_u8(WIRE_VERSION);
    dst.put_u8(flags);
    dst.put_u32_le(values_len);
    dst.put_slice(values);
    dst.put_u32_le(string_count);
    for entry in strings.entries() {
        let len = u32::try_from(entry.len()).map_err(|_| too_large(entry.len()))?;
        dst.put_u32_le(len);
        dst.put_slice(entry.as_bytes());
    }
    Ok(())
}

/// Split a frame into its value stream and string table.
///
/// Every length and count is checked against the bytes actually present
/// before anything is allocated for it.
pub fn decode_wire_frame(mut src: Bytes) -> Result<WireFrame> {
    if src.len() < FRAME_HEADER_SIZE {
        return Err(FrameError::InvalidFrame(format!(
            "frame of {} bytes is shorter than its header",
            src.len()
        )));
    }

    let version = src.get_u8();
    if version != WIRE_VERSION {
        return Err(FrameError::UnsupportedVersion(version));
    }
    let flags = src.get_u8();
    let values_len = src.get_u32_le() as usize;

    if src.remaining() < values_len {
        return Err(FrameError::InvalidFrame(format!(
            "value stream length {values_len} exceeds {} remaining bytes",
            src.remaining()
        )));
    }
    let values = src.split_to(values_len);

    if src.remaining() < 4 {
        return Err(FrameError::InvalidFrame(
            "missing string table count".to_string(),
        ));
    }
    let string_count = src.get_u32_le() as usize;
    // Each entry needs at least its 4-byte length prefix.
    if string_count > src.remaining() / 4 {
        return Err(FrameError::InvalidFrame(format!(
            "string count {string_count} cannot fit in {} remaining bytes",
            src.remaining()
        )));
    }

    let mut strings = Vec::with_capacity(string_count);
    for _ in 0..string_count {
        if src.remaining() < 4 {
            return Err(FrameError::InvalidFrame(
                "string table truncated".to_string(),
            ));
        }
        let len = src.get_u32_le() as usize;
        if src.remaining() < len {
            return Err(FrameError::InvalidFrame(format!(
                "string of {len} bytes exceeds {} remaining bytes",
                src.remaining()
            )));
        }
        let raw = src.split_to(len);
        strings.push(Arc::from(String::from_utf8(raw.to_vec())?));
    }

    if src.has_remaining() {
        return Err(FrameError::InvalidFrame(format!(
            "{} trailing bytes after string table",
            src.remaining()
        )));
    }

    Ok(WireFrame {
        version,
        flags,
        values,
        strings,
    })
}
