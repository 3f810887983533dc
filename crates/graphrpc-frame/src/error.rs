/// Errors that can occur while encoding or decoding frames and value streams.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The envelope header contains an invalid magic number.
    #[error("invalid envelope magic (expected 0x4752 \"GR\")")]
    InvalidMagic,

    /// The envelope kind byte is not one this runtime understands.
    #[error("unknown envelope kind {0}")]
    UnknownEnvelopeKind(u8),

    /// The frame was produced by an incompatible wire version.
    #[error("unsupported wire version {0}")]
    UnsupportedVersion(u8),

    /// The payload exceeds the configured maximum size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// The frame layout is inconsistent (lengths, counts, trailing bytes).
    #[error("malformed frame: {0}")]
    InvalidFrame(String),

    /// A value could not be read because the stream ended first.
    #[error("value stream truncated (needed {needed} bytes, {remaining} remaining)")]
    Truncated { needed: usize, remaining: usize },

    /// A primitive held a value outside its domain.
    #[error("malformed value: {0}")]
    Malformed(String),

    /// A unicode scalar field held a surrogate or out-of-range code point.
    #[error("invalid unicode scalar value 0x{0:X}")]
    InvalidChar(u32),

    /// A string table entry is not valid UTF-8.
    #[error("string table entry is not valid utf-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    /// A string reference points outside the string table.
    #[error("string index {index} out of range (table has {len} entries)")]
    InvalidStringIndex { index: i64, len: usize },

    /// A back-reference points at an object not yet materialized.
    #[error("back-reference to object {index} but only {len} objects read")]
    InvalidBackReference { index: i64, len: usize },

    /// First-sight objects nest deeper than the reader allows.
    #[error("object nesting exceeds depth limit {limit}")]
    DepthExceeded { limit: usize },

    /// A collection length would exceed the slots the stream can supply.
    #[error("allocation claim of {requested} exceeds remaining budget {remaining}")]
    ClaimExceeded { requested: usize, remaining: usize },

    /// No type is registered for a decoded signature token.
    #[error("unknown type signature '{0}'")]
    UnknownSignature(String),

    /// An object being written has no registered signature.
    #[error("type '{0}' has no registered signature")]
    UnregisteredType(&'static str),

    /// An I/O error occurred while reading or writing envelopes.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed before a complete envelope was received.
    #[error("connection closed (incomplete envelope)")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, FrameError>;
