use std::io::{ErrorKind, Read};

use bytes::BytesMut;
use graphrpc_transport::DuplexStream;
use tracing::trace;

use crate::envelope::{decode_envelope, Envelope, FrameConfig};
use crate::error::{FrameError, Result};

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;

/// Reads complete envelopes from any `Read` stream.
///
/// Fragmented reads are appended to one buffer whose capacity doubles each
/// time it fills, so callers only ever see whole messages.
pub struct MessageReader<T> {
    inner: T,
    buf: BytesMut,
    config: FrameConfig,
}

impl<T: Read> MessageReader<T> {
    /// Create a new message reader with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new message reader with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            config,
        }
    }

    /// Read the next complete envelope (blocking).
    ///
    /// Returns `Err(FrameError::ConnectionClosed)` when EOF is reached.
    pub fn read_message(&mut self) -> Result<Envelope> {
        loop {
            if let Some(envelope) = decode_envelope(&mut self.buf, self.config.max_message_size)? {
                return Ok(envelope);
            }

            let filled = self.buf.len();
            if filled == self.buf.capacity() {
                let target = (self.buf.capacity() * 2).max(INITIAL_BUFFER_CAPACITY);
                self.buf.reserve(target - filled);
                trace!(capacity = self.buf.capacity(), "message buffer grown");
            }
            let capacity = self.buf.capacity();
            self.buf.resize(capacity, 0);

            let read = match self.inner.read(&mut self.buf[filled..]) {
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => {
                    self.buf.truncate(filled);
                    continue;
                }
                Err(err) => {
                    self.buf.truncate(filled);
                    return Err(FrameError::Io(err));
                }
            };
            self.buf.truncate(filled + read);

            if read == 0 {
                return Err(FrameError::ConnectionClosed);
            }
        }
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the reader and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Update maximum message size for subsequent decoding.
    pub fn set_max_message_size(&mut self, max_message_size: usize) {
        self.config.max_message_size = max_message_size;
    }

    /// Bytes buffered but not yet returned as an envelope.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Current buffer capacity.
    pub fn buffer_capacity(&self) -> usize {
        self.buf.capacity()
    }

    /// Current message reader configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

impl MessageReader<DuplexStream> {
    /// Create a message reader for `DuplexStream` and apply read timeout from config.
    pub fn with_config_stream(inner: DuplexStream, config: FrameConfig) -> Result<Self> {
        inner
            .set_read_timeout(config.read_timeout)
            .map_err(transport_to_frame_error)?;
        Ok(Self::with_config(inner, config))
    }
}

pub(crate) fn transport_to_frame_error(err: graphrpc_transport::TransportError) -> FrameError {
    match err {
        graphrpc_transport::TransportError::Io(io)
        | graphrpc_transport::TransportError::Accept(io) => FrameError::Io(io),
        graphrpc_transport::TransportError::Bind { source, .. }
        | graphrpc_transport::TransportError::Connect { source, .. } => FrameError::Io(source),
        other => FrameError::Io(std::io::Error::other(other.to_string())),
    }
}
