use std::collections::VecDeque;
use std::fmt;
use std::io::ErrorKind;
use std::net::Shutdown;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use graphrpc_frame::{
    Envelope, EnvelopeKind, FrameError, MessageReader, MessageWriter, CLOSE_NORMAL,
    CLOSE_PROTOCOL_ERROR,
};
use graphrpc_transport::{Address, DuplexStream};
use tracing::{debug, error, info, warn};

use crate::connector::{self, ConnectConfig, Established};
use crate::error::{PeerError, Result};
use crate::handshake::{clamp_reason, HandshakeResult};

/// Lifecycle of a [`Connection`]. `Closed` and `Errored` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
    Errored,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Errored)
    }
}

/// Receives connection events from the worker loops.
///
/// `on_closed` and `on_error` are mutually exclusive and fire at most once.
/// All methods run on a worker thread and must not block for long.
pub trait ConnectionHandler: Send + Sync {
    /// Called once before the worker loops start.
    fn on_open(&self, _sender: ConnectionSender) {}

    /// One complete data message.
    fn on_message(&self, message: Bytes);

    /// Orderly close, initiated by either side.
    fn on_closed(&self, code: u16, reason: &str);

    /// The link failed.
    fn on_error(&self, error: PeerError);
}

enum Outbound {
    Message(Bytes),
    // Last entry the send loop processes.
    Close {
        code: u16,
        reason: String,
        cause: Option<PeerError>,
    },
}

#[derive(Default)]
struct Outbox {
    items: VecDeque<Outbound>,
    closing: bool,
    shutdown: bool,
}

struct Shared {
    state: Mutex<ConnectionState>,
    outbox: Mutex<Outbox>,
    ready: Condvar,
    // Clone of the socket used to unblock both loops on termination.
    control: DuplexStream,
    handler: Arc<dyn ConnectionHandler>,
    max_message_size: usize,
    peer: String,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    fn enqueue(&self, item: Outbound) -> Result<()> {
        let mut outbox = lock(&self.outbox);
        if outbox.shutdown || outbox.closing {
            return Err(PeerError::NotConnected);
        }
        if let Outbound::Close { .. } = item {
            outbox.closing = true;
        }
        outbox.items.push_back(item);
        drop(outbox);
        self.ready.notify_one();
        Ok(())
    }

    /// Move to a terminal state. Only the first caller wins.
    fn terminate(&self, next: ConnectionState) -> bool {
        {
            let mut state = lock(&self.state);
            if state.is_terminal() {
                return false;
            }
            *state = next;
        }

        {
            let mut outbox = lock(&self.outbox);
            outbox.shutdown = true;
            outbox.items.clear();
        }
        self.ready.notify_all();

        if let Err(err) = self.control.shutdown(Shutdown::Both) {
            debug!(peer = %self.peer, error = %err, "socket shutdown failed");
        }
        true
    }

    fn finish_closed(&self, code: u16, reason: &str) {
        if self.terminate(ConnectionState::Closed) {
            info!(peer = %self.peer, code, reason = clamp_reason(reason), "connection closed");
            self.handler.on_closed(code, reason);
        }
    }

    fn finish_errored(&self, err: PeerError) {
        if self.terminate(ConnectionState::Errored) {
            warn!(peer = %self.peer, error = %err, "connection failed");
            self.handler.on_error(err);
        }
    }
}

/// A cloneable handle for queueing messages on a connection.
#[derive(Clone)]
pub struct ConnectionSender {
    shared: Arc<Shared>,
}

impl ConnectionSender {
    /// Queue one data message. Never blocks; fails once the connection is
    /// closing or terminal.
    pub fn send(&self, message: Bytes) -> Result<()> {
        if message.len() > self.shared.max_message_size {
            return Err(PeerError::Frame(FrameError::PayloadTooLarge {
                size: message.len(),
                max: self.shared.max_message_size,
            }));
        }
        self.shared.enqueue(Outbound::Message(message))
    }

    /// Queue an orderly close after all previously queued messages.
    pub fn close_with(&self, code: u16, reason: &str) -> Result<()> {
        self.shared.enqueue(Outbound::Close {
            code,
            reason: reason.to_string(),
            cause: None,
        })
    }

    /// Close with `PROTOCOL_ERROR` and report `cause` through `on_error`.
    pub fn abort(&self, cause: PeerError) {
        let mut outbox = lock(&self.shared.outbox);
        if outbox.shutdown || outbox.closing {
            drop(outbox);
            self.shared.finish_errored(cause);
            return;
        }
        outbox.closing = true;
        outbox.items.push_back(Outbound::Close {
            code: CLOSE_PROTOCOL_ERROR,
            reason: cause.to_string(),
            cause: Some(cause),
        });
        drop(outbox);
        self.shared.ready.notify_one();
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }
}

impl fmt::Debug for ConnectionSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSender")
            .field("peer", &self.shared.peer)
            .field("state", &self.shared.state())
            .finish()
    }
}

/// One framed, handshaken duplex connection with its send and receive
/// worker threads.
///
/// Dropping a connection closes it.
pub struct Connection {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    handshake: HandshakeResult,
}

impl Connection {
    /// Connect to `address` with retry and backoff, then start the worker loops.
    pub fn open(
        address: &Address,
        config: &ConnectConfig,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Result<Self> {
        let established = connector::establish(address, config)?;
        info!(%address, version = %established.handshake.protocol_version, "connection open");
        Self::start(established, handler, address.to_string())
    }

    /// Run the server handshake on an accepted stream, then start the loops.
    pub fn serve(
        stream: DuplexStream,
        expected_checksum: Option<&str>,
        config: &ConnectConfig,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Result<Self> {
        let peer = format!("accepted {}", stream.transport_name());
        let established = connector::accept(stream, expected_checksum, config)?;
        debug!(%peer, "accepted connection handshaken");
        Self::start(established, handler, peer)
    }

    fn start(
        established: Established,
        handler: Arc<dyn ConnectionHandler>,
        peer: String,
    ) -> Result<Self> {
        let Established {
            reader,
            writer,
            handshake,
        } = established;

        let shared = Arc::new(Shared {
            state: Mutex::new(ConnectionState::Connecting),
            outbox: Mutex::new(Outbox::default()),
            ready: Condvar::new(),
            control: writer.get_ref().try_clone()?,
            handler,
            max_message_size: reader.config().max_message_size,
            peer,
        });

        shared.handler.on_open(ConnectionSender {
            shared: Arc::clone(&shared),
        });
        *lock(&shared.state) = ConnectionState::Open;

        let send_shared = Arc::clone(&shared);
        let send = thread::Builder::new()
            .name("graphrpc-send".to_string())
            .spawn(move || send_loop(send_shared, writer));
        let send = match send {
            Ok(handle) => handle,
            Err(err) => {
                shared.terminate(ConnectionState::Errored);
                return Err(err.into());
            }
        };

        let recv_shared = Arc::clone(&shared);
        let recv = thread::Builder::new()
            .name("graphrpc-recv".to_string())
            .spawn(move || recv_loop(recv_shared, reader));
        let recv = match recv {
            Ok(handle) => handle,
            Err(err) => {
                shared.terminate(ConnectionState::Errored);
                let _ = send.join();
                return Err(err.into());
            }
        };

        Ok(Self {
            shared,
            workers: Mutex::new(vec![send, recv]),
            handshake,
        })
    }

    /// Queue one data message.
    pub fn send(&self, message: Bytes) -> Result<()> {
        self.sender().send(message)
    }

    pub fn sender(&self) -> ConnectionSender {
        ConnectionSender {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Outcome of the handshake that opened this connection.
    pub fn handshake(&self) -> &HandshakeResult {
        &self.handshake
    }

    /// Close with `NORMAL` and wait for both worker loops to exit.
    pub fn close(&self) {
        self.close_with(CLOSE_NORMAL, "");
    }

    /// Close with an explicit code and reason, then wait for both loops.
    ///
    /// Messages queued earlier are written before the close envelope.
    /// Closing an already terminal connection only joins the loops.
    pub fn close_with(&self, code: u16, reason: &str) {
        if self.shared.enqueue(Outbound::Close {
            code,
            reason: reason.to_string(),
            cause: None,
        })
        .is_ok()
        {
            debug!(peer = %self.shared.peer, code, "close queued");
        }
        self.join_workers();
    }

    fn join_workers(&self) {
        let workers = std::mem::take(&mut *lock(&self.workers));
        let current = thread::current().id();
        for handle in workers {
            // A handler may close the connection from inside a worker loop.
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!(peer = %self.shared.peer, "connection worker panicked");
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.shared.peer)
            .field("state", &self.shared.state())
            .field("handshake", &self.handshake)
            .finish()
    }
}

fn send_loop(shared: Arc<Shared>, mut writer: MessageWriter<DuplexStream>) {
    debug!(peer = %shared.peer, "send loop started");
    loop {
        let next = {
            let mut outbox = lock(&shared.outbox);
            loop {
                if outbox.shutdown {
                    break None;
                }
                if let Some(item) = outbox.items.pop_front() {
                    break Some(item);
                }
                outbox = shared
                    .ready
                    .wait(outbox)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };

        match next {
            None => break,
            Some(Outbound::Message(message)) => {
                if let Err(err) = writer.send(EnvelopeKind::Data, &message) {
                    shared.finish_errored(link_error(err));
                    break;
                }
            }
            Some(Outbound::Close {
                code,
                reason,
                cause,
            }) => {
                let envelope = Envelope::close(code, clamp_reason(&reason));
                if let Err(err) = writer.write_message(&envelope) {
                    debug!(peer = %shared.peer, error = %err, "close envelope not delivered");
                }
                match cause {
                    Some(cause) => shared.finish_errored(cause),
                    None => shared.finish_closed(code, &reason),
                }
                break;
            }
        }
    }
    debug!(peer = %shared.peer, "send loop exited");
}

fn recv_loop(shared: Arc<Shared>, mut reader: MessageReader<DuplexStream>) {
    debug!(peer = %shared.peer, "receive loop started");
    loop {
        match reader.read_message() {
            Ok(envelope) => match envelope.kind {
                EnvelopeKind::Data => {
                    let handler = &shared.handler;
                    let payload = envelope.payload;
                    let handled =
                        panic::catch_unwind(AssertUnwindSafe(|| handler.on_message(payload)));
                    if let Err(panicked) = handled {
                        let cause = PeerError::from_panic(panicked.as_ref());
                        error!(peer = %shared.peer, error = %cause, "message handler panicked");
                        ConnectionSender {
                            shared: Arc::clone(&shared),
                        }
                        .abort(cause);
                        break;
                    }
                }
                EnvelopeKind::Close => {
                    match envelope.close_reason() {
                        Ok((code, reason)) => shared.finish_closed(code, &reason),
                        Err(err) => shared.finish_errored(PeerError::Frame(err)),
                    }
                    break;
                }
                EnvelopeKind::Handshake => {
                    protocol_violation(
                        &shared,
                        PeerError::HandshakeFailed("handshake envelope after session start".to_string()),
                    );
                    break;
                }
            },
            Err(FrameError::Io(err))
                if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
            {
                if shared.state().is_terminal() {
                    break;
                }
            }
            Err(FrameError::ConnectionClosed) => {
                shared.finish_errored(PeerError::Disconnected(
                    "peer closed the stream without a close message".to_string(),
                ));
                break;
            }
            Err(err @ FrameError::Io(_)) => {
                shared.finish_errored(link_error(err));
                break;
            }
            Err(err) => {
                protocol_violation(&shared, PeerError::Frame(err));
                break;
            }
        }

        if shared.state().is_terminal() {
            break;
        }
    }
    debug!(peer = %shared.peer, "receive loop exited");
}

fn protocol_violation(shared: &Arc<Shared>, cause: PeerError) {
    error!(peer = %shared.peer, error = %cause, "protocol violation");
    ConnectionSender {
        shared: Arc::clone(shared),
    }
    .abort(cause);
}

fn link_error(err: FrameError) -> PeerError {
    match err {
        FrameError::ConnectionClosed => PeerError::Disconnected("stream closed".to_string()),
        FrameError::Io(io)
            if matches!(
                io.kind(),
                ErrorKind::BrokenPipe
                    | ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::UnexpectedEof
            ) =>
        {
            PeerError::Disconnected(io.to_string())
        }
        other => PeerError::Frame(other),
    }
}
