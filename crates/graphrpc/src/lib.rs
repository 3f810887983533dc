//! Client runtime for typed remote-procedure calls over one long-lived
//! duplex connection, using a compact binary object-graph encoding.
//!
//! # Crate Structure
//!
//! - [`transport`]: Unix domain socket and TCP streams, address parsing
//! - [`frame`]: Message envelopes, wire frames and the value-stream codec
//! - [`peer`]: Connections, call multiplexing, watchdog and endpoint binding
//!
//! Most applications only need [`bind`] plus a generated [`ServiceBinding`].

/// Re-export transport types.
pub mod transport {
    pub use graphrpc_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use graphrpc_frame::*;
}

/// Re-export peer types.
pub mod peer {
    pub use graphrpc_peer::*;
}

pub use graphrpc_frame::{
    new_object, with_object, ObjectRef, RemoteObject, TypeRegistry, TypeResolver, ValueReader,
    ValueWriter,
};
pub use graphrpc_peer::{
    bind, BindConfig, CallFailure, CallMultiplexer, CallResult, ConnectConfig, DispatchTarget,
    PeerError, RemoteEndpoint, ServiceBinding,
};
pub use graphrpc_transport::Address;
