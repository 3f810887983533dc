//! Session layer for graphrpc.
//!
//! A [`Connection`] owns one framed duplex stream and its send/receive
//! worker threads. A [`CallMultiplexer`] shares that connection between many
//! logical calls, correlating responses by callback id and failing stalled
//! calls through a watchdog. [`bind`] wires both together for one service.

pub mod binder;
pub mod callback;
pub mod connection;
pub mod connector;
pub mod error;
pub mod handshake;
pub mod multiplexer;
mod watchdog;

pub use binder::{bind, bind_address, BindConfig, RemoteEndpoint, ServiceBinding};
pub use callback::{BlockingCallback, BlockingHandle, Callback, Decoder, NonBlockingCallback};
pub use connection::{Connection, ConnectionHandler, ConnectionSender, ConnectionState};
pub use connector::{retry_with_backoff, ConnectConfig};
pub use error::{CallFailure, CallResult, PeerError, Result};
pub use handshake::{
    handshake_client, handshake_server, HandshakeConfig, HandshakeRequest, HandshakeResponse,
    HandshakeResult,
};
pub use multiplexer::{CallMultiplexer, DispatchTarget, FatalHandler, MessageSink};
