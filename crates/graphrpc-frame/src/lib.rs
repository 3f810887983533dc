//! Binary object-graph frame codec for graphrpc.
//!
//! Two layers live here:
//! - **Envelopes** delimit messages on the byte stream: a 2-byte magic
//!   ("GR"), a 1-byte kind and a 4-byte little-endian length. The
//!   [`MessageReader`] reassembles envelopes from fragmented reads.
//! - **Frames** are the payload of a data envelope: version, flags, a value
//!   stream and a trailing deduplicated string table. [`ValueWriter`] builds
//!   one; [`ValueReader`] is a cursor over a decoded one, preserving object
//!   aliasing and bounding allocation with a claim budget.

pub mod envelope;
pub mod error;
pub mod object;
pub mod reader;
pub mod strings;
pub mod value;
pub mod wire;
pub mod writer;

pub use envelope::{
    decode_envelope, encode_envelope, Envelope, EnvelopeKind, FrameConfig, CLOSE_GOING_AWAY,
    CLOSE_NORMAL, CLOSE_PROTOCOL_ERROR, DEFAULT_MAX_MESSAGE, ENVELOPE_HEADER_SIZE,
};
pub use error::{FrameError, Result};
pub use object::{
    lock_object, new_object, with_object, with_object_mut, ObjectRef, RemoteObject, TypeRegistry,
    TypeResolver,
};
pub use reader::MessageReader;
pub use strings::StringTable;
pub use value::{ClaimBudget, ValueReader, ValueWriter, DEFAULT_MAX_DEPTH};
pub use wire::{decode_wire_frame, encode_wire_frame, WireFrame, FLAG_CALLBACK, WIRE_VERSION};
pub use writer::MessageWriter;
