//! Duplex stream transport for graphrpc.
//!
//! Provides a unified byte-stream type over the socket kinds a graphrpc
//! server may listen on:
//! - Unix domain sockets (Linux/macOS)
//! - TCP
//!
//! This is the lowest layer of graphrpc. Everything else builds on top of
//! the [`DuplexStream`] and [`Address`] types provided here.

pub mod address;
pub mod error;
pub mod stream;

#[cfg(unix)]
pub mod uds;

pub use address::{Address, Endpoint};
pub use error::{Result, TransportError};
pub use stream::DuplexStream;

#[cfg(unix)]
pub use uds::UnixDomainSocket;
