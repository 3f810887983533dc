use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use bytes::Bytes;
use graphrpc_frame::{TypeRegistry, TypeResolver, ValueReader, ValueWriter, FLAG_CALLBACK};
use tracing::{debug, error, warn};

use crate::callback::{BlockingCallback, BlockingHandle, Callback, NonBlockingCallback};
use crate::connection::{ConnectionHandler, ConnectionSender};
use crate::error::{CallFailure, PeerError, Result};
use crate::watchdog::Watchdog;

/// Where the multiplexer hands finished outbound frames.
pub trait MessageSink: Send + Sync {
    fn send(&self, message: Bytes) -> Result<()>;

    /// Tear the link down after a protocol violation.
    fn abort(&self, cause: PeerError);
}

impl MessageSink for ConnectionSender {
    fn send(&self, message: Bytes) -> Result<()> {
        ConnectionSender::send(self, message)
    }

    fn abort(&self, cause: PeerError) {
        ConnectionSender::abort(self, cause)
    }
}

/// Local side of a binding: executes inbound calls.
///
/// `method` is the non-negative recipient id; `args` is positioned at the
/// first argument. When `callback_id` is set the caller expects a reply via
/// [`CallMultiplexer::respond`]. An error or panic here means the call could
/// not be handled and tears the session down like a protocol violation.
pub trait DispatchTarget: Send + Sync {
    fn dispatch(
        &self,
        method: i32,
        callback_id: Option<i32>,
        args: &mut ValueReader,
        mux: &CallMultiplexer,
    ) -> Result<()>;
}

/// Called with watchdog expiries and link failures.
pub type FatalHandler = Arc<dyn Fn(&PeerError) + Send + Sync>;

#[derive(Debug, Clone)]
enum Terminal {
    Closed { code: u16, reason: String },
    Lost(String),
    Shutdown,
}

impl Terminal {
    fn from_cause(cause: &PeerError) -> Self {
        match cause {
            PeerError::Closed { code, reason } => Terminal::Closed {
                code: *code,
                reason: reason.clone(),
            },
            other => Terminal::Lost(other.to_string()),
        }
    }

    fn to_error(&self) -> PeerError {
        match self {
            Terminal::Closed { code, reason } => PeerError::Closed {
                code: *code,
                reason: reason.clone(),
            },
            Terminal::Lost(reason) => PeerError::Disconnected(reason.clone()),
            Terminal::Shutdown => PeerError::NotConnected,
        }
    }
}

struct Registry {
    callbacks: HashMap<i32, Box<dyn Callback>>,
    next_id: i32,
    expired: Option<Duration>,
    terminal: Option<Terminal>,
}

impl Registry {
    /// Next free id in `[1, i32::MAX]`, wrapping to 1.
    fn allocate(&mut self) -> i32 {
        loop {
            let id = self.next_id;
            self.next_id = if id == i32::MAX { 1 } else { id + 1 };
            if !self.callbacks.contains_key(&id) {
                return id;
            }
        }
    }

    fn check_open(&self) -> Result<()> {
        if let Some(terminal) = &self.terminal {
            return Err(terminal.to_error());
        }
        if let Some(timeout) = self.expired {
            return Err(PeerError::WatchdogExpired(timeout));
        }
        Ok(())
    }
}

struct Inner {
    registry: Mutex<Registry>,
    sink: Mutex<Option<Arc<dyn MessageSink>>>,
    target: Mutex<Option<Arc<dyn DispatchTarget>>>,
    fatal: Mutex<Option<FatalHandler>>,
    watchdog: Mutex<Option<Watchdog>>,
    resolver: Arc<dyn TypeResolver>,
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shares one connection between many logical calls.
///
/// Outbound calls are framed as `recipient` (+ `callback_id` when a reply is
/// expected) followed by the arguments. Inbound frames with a non-negative
/// recipient go to the [`DispatchTarget`]; negative ones complete the pending
/// callback `-recipient`.
///
/// Cloning is cheap and yields a handle to the same multiplexer.
#[derive(Clone)]
pub struct CallMultiplexer {
    inner: Arc<Inner>,
}

impl Default for CallMultiplexer {
    fn default() -> Self {
        Self::new()
    }
}

impl CallMultiplexer {
    /// A multiplexer for payloads without objects.
    pub fn new() -> Self {
        Self::with_resolver(Arc::new(TypeRegistry::new()))
    }

    pub fn with_resolver(resolver: Arc<dyn TypeResolver>) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: Mutex::new(Registry {
                    callbacks: HashMap::new(),
                    next_id: 1,
                    expired: None,
                    terminal: None,
                }),
                sink: Mutex::new(None),
                target: Mutex::new(None),
                fatal: Mutex::new(None),
                watchdog: Mutex::new(None),
                resolver,
            }),
        }
    }

    /// Route outbound frames to `sink`.
    pub fn attach(&self, sink: Arc<dyn MessageSink>) {
        *lock(&self.inner.sink) = Some(sink);
    }

    pub fn set_dispatch_target(&self, target: Arc<dyn DispatchTarget>) {
        *lock(&self.inner.target) = Some(target);
    }

    pub fn set_fatal_handler(&self, handler: impl Fn(&PeerError) + Send + Sync + 'static) {
        *lock(&self.inner.fatal) = Some(Arc::new(handler));
    }

    pub fn resolver(&self) -> &Arc<dyn TypeResolver> {
        &self.inner.resolver
    }

    /// A fresh writer sharing this multiplexer's type resolver.
    pub fn writer(&self) -> ValueWriter {
        ValueWriter::with_resolver(Arc::clone(&self.inner.resolver))
    }

    /// Number of calls awaiting a response.
    pub fn pending_count(&self) -> usize {
        lock(&self.inner.registry).callbacks.len()
    }

    /// Whether the link behind this multiplexer has ended.
    pub fn is_terminal(&self) -> bool {
        lock(&self.inner.registry).terminal.is_some()
    }

    /// Send a call that expects no reply.
    pub fn invoke_fire_and_forget(
        &self,
        recipient: i32,
        write_args: impl FnOnce(&mut ValueWriter) -> graphrpc_frame::Result<()>,
    ) -> Result<()> {
        if recipient < 0 {
            return Err(PeerError::InvalidRecipient(recipient));
        }
        lock(&self.inner.registry).check_open()?;

        let mut writer = self.writer();
        writer.write_i32(recipient);
        write_args(&mut writer)?;
        let frame = writer.finish()?;
        self.sink()?.send(frame)
    }

    /// Send a call whose response completes `callback`.
    ///
    /// The callback is registered before the frame is queued. On any error
    /// returned here the callback has been dropped without running. If the
    /// link ends while the frame is being queued, the callback receives that
    /// failure instead and the id is still returned. Returns the allocated
    /// callback id.
    pub fn invoke_with_callback(
        &self,
        recipient: i32,
        write_args: impl FnOnce(&mut ValueWriter) -> graphrpc_frame::Result<()>,
        callback: Box<dyn Callback>,
    ) -> Result<i32> {
        if recipient < 0 {
            return Err(PeerError::InvalidRecipient(recipient));
        }
        let sink = self.sink()?;

        let callback_id = {
            let mut registry = lock(&self.inner.registry);
            registry.check_open()?;
            let id = registry.allocate();
            registry.callbacks.insert(id, callback);
            id
        };

        let sent = self
            .encode_call(recipient, callback_id, write_args)
            .and_then(|frame| sink.send(frame));
        if let Err(err) = sent {
            if lock(&self.inner.registry).callbacks.remove(&callback_id).is_some() {
                return Err(err);
            }
            debug!(callback_id, error = %err, "call not sent, callback already failed");
            return Ok(callback_id);
        }

        debug!(recipient, callback_id, "call sent");
        Ok(callback_id)
    }

    fn encode_call(
        &self,
        recipient: i32,
        callback_id: i32,
        write_args: impl FnOnce(&mut ValueWriter) -> graphrpc_frame::Result<()>,
    ) -> Result<Bytes> {
        let mut writer = self.writer();
        writer.set_flags(FLAG_CALLBACK);
        writer.write_i32(recipient);
        writer.write_i32(callback_id);
        write_args(&mut writer)?;
        Ok(writer.finish()?)
    }

    /// Issue a call and return a handle to block on its outcome.
    pub fn call<T, E>(
        &self,
        recipient: i32,
        write_args: impl FnOnce(&mut ValueWriter) -> graphrpc_frame::Result<()>,
        decode_success: impl FnOnce(&mut ValueReader) -> graphrpc_frame::Result<T> + Send + 'static,
        decode_failure: impl FnOnce(&mut ValueReader) -> graphrpc_frame::Result<E> + Send + 'static,
    ) -> Result<BlockingHandle<T, E>>
    where
        T: Send + 'static,
        E: Send + 'static,
    {
        let (callback, handle) = BlockingCallback::new(decode_success, decode_failure);
        self.invoke_with_callback(recipient, write_args, Box::new(callback))?;
        Ok(handle)
    }

    /// Issue a call whose outcome is delivered to continuations.
    pub fn call_with<T, E>(
        &self,
        recipient: i32,
        write_args: impl FnOnce(&mut ValueWriter) -> graphrpc_frame::Result<()>,
        decode_success: impl FnOnce(&mut ValueReader) -> graphrpc_frame::Result<T> + Send + 'static,
        decode_failure: impl FnOnce(&mut ValueReader) -> graphrpc_frame::Result<E> + Send + 'static,
        on_success: impl FnOnce(T) + Send + 'static,
        on_failure: impl FnOnce(CallFailure<E>) + Send + 'static,
    ) -> Result<i32>
    where
        T: 'static,
        E: 'static,
    {
        let callback = NonBlockingCallback::new(decode_success, decode_failure, on_success, on_failure);
        self.invoke_with_callback(recipient, write_args, Box::new(callback))
    }

    /// Answer an inbound call that carried `callback_id`.
    ///
    /// Replies are allowed while the watchdog is expired; only new calls
    /// are held back.
    pub fn respond(
        &self,
        callback_id: i32,
        success: bool,
        write_payload: impl FnOnce(&mut ValueWriter) -> graphrpc_frame::Result<()>,
    ) -> Result<()> {
        if callback_id <= 0 {
            return Err(PeerError::InvalidRecipient(callback_id));
        }
        if let Some(terminal) = &lock(&self.inner.registry).terminal {
            return Err(terminal.to_error());
        }

        let mut writer = self.writer();
        writer.write_i32(-callback_id);
        writer.write_bool(success);
        write_payload(&mut writer)?;
        let frame = writer.finish()?;
        self.sink()?.send(frame)
    }

    fn sink(&self) -> Result<Arc<dyn MessageSink>> {
        if let Some(sink) = lock(&self.inner.sink).as_ref() {
            return Ok(Arc::clone(sink));
        }
        match &lock(&self.inner.registry).terminal {
            Some(terminal) => Err(terminal.to_error()),
            None => Err(PeerError::NotConnected),
        }
    }

    /// Decode one inbound frame and route it.
    pub fn dispatch(&self, message: Bytes) {
        let mut reader =
            match ValueReader::decode_with_resolver(message, Arc::clone(&self.inner.resolver)) {
                Ok(reader) => reader,
                Err(err) => return self.protocol_violation(err.into()),
            };
        let recipient = match reader.read_i32() {
            Ok(recipient) => recipient,
            Err(err) => return self.protocol_violation(err.into()),
        };

        if recipient < 0 {
            self.complete_response(recipient, reader);
        } else {
            self.dispatch_local(recipient, reader);
        }
    }

    fn complete_response(&self, recipient: i32, reader: ValueReader) {
        let Some(callback_id) = recipient.checked_neg() else {
            return self.protocol_violation(PeerError::InvalidRecipient(recipient));
        };

        let callback = lock(&self.inner.registry).callbacks.remove(&callback_id);
        match callback {
            Some(callback) => {
                debug!(callback_id, "response received");
                callback.complete(Ok(reader));
            }
            None => warn!(callback_id, "response for unknown callback id dropped"),
        }
    }

    fn dispatch_local(&self, method: i32, mut reader: ValueReader) {
        let callback_id = if reader.has_flag(FLAG_CALLBACK) {
            match reader.read_i32() {
                Ok(id) if id > 0 => Some(id),
                Ok(id) => return self.protocol_violation(PeerError::InvalidRecipient(id)),
                Err(err) => return self.protocol_violation(err.into()),
            }
        } else {
            None
        };

        let target = lock(&self.inner.target).clone();
        let Some(target) = target else {
            warn!(method, "inbound call dropped: no dispatch target");
            return;
        };

        let handled = panic::catch_unwind(AssertUnwindSafe(|| {
            target.dispatch(method, callback_id, &mut reader, self)
        }));
        match handled {
            Ok(Ok(())) => {}
            Ok(Err(err)) => self.protocol_violation(err),
            Err(payload) => self.protocol_violation(PeerError::from_panic(payload.as_ref())),
        }
    }

    /// Unattributable decode failures poison the whole session.
    fn protocol_violation(&self, cause: PeerError) {
        error!(error = %cause, "inbound frame could not be handled, closing connection");
        let terminal = Terminal::Closed {
            code: graphrpc_frame::CLOSE_PROTOCOL_ERROR,
            reason: cause.to_string(),
        };
        let sink = lock(&self.inner.sink).clone();
        if self.terminate(terminal) {
            self.notify_fatal(&cause);
        }
        if let Some(sink) = sink {
            sink.abort(cause);
        }
    }

    /// Fail every pending call because the link ended.
    pub fn connection_lost(&self, cause: PeerError) {
        let orderly = matches!(cause, PeerError::Closed { .. });
        if self.terminate(Terminal::from_cause(&cause)) && !orderly {
            self.notify_fatal(&cause);
        }
    }

    // Enter the terminal state and drain the table under one lock.
    fn terminate(&self, terminal: Terminal) -> bool {
        let drained: Vec<_> = {
            let mut registry = lock(&self.inner.registry);
            if registry.terminal.is_some() {
                return false;
            }
            registry.terminal = Some(terminal.clone());
            registry.callbacks.drain().collect()
        };

        // Dropping the sink breaks the connection -> handler -> multiplexer cycle.
        lock(&self.inner.sink).take();
        self.stop_watchdog();

        if !drained.is_empty() {
            debug!(pending = drained.len(), reason = ?terminal, "failing pending calls");
        }
        for (_, callback) in drained {
            callback.complete(Err(terminal.to_error()));
        }
        true
    }

    /// Arm the watchdog. Replaces a running one and clears a prior expiry.
    pub fn start_watchdog(&self, timeout: Duration) -> Result<()> {
        if let Some(terminal) = &lock(&self.inner.registry).terminal {
            return Err(terminal.to_error());
        }
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let watchdog = Watchdog::start(timeout, move |timeout| {
            if let Some(inner) = weak.upgrade() {
                CallMultiplexer { inner }.expire(timeout);
            }
        })?;

        lock(&self.inner.registry).expired = None;
        let previous = lock(&self.inner.watchdog).replace(watchdog);
        drop(previous);
        Ok(())
    }

    /// Reset the watchdog deadline and lift a prior expiry.
    pub fn feed_watchdog(&self) {
        if let Some(watchdog) = lock(&self.inner.watchdog).as_ref() {
            watchdog.feed();
            lock(&self.inner.registry).expired = None;
        }
    }

    fn stop_watchdog(&self) {
        let watchdog = lock(&self.inner.watchdog).take();
        if let Some(mut watchdog) = watchdog {
            watchdog.stop();
        }
    }

    fn expire(&self, timeout: Duration) {
        let drained: Vec<_> = {
            let mut registry = lock(&self.inner.registry);
            if registry.terminal.is_some() {
                return;
            }
            registry.expired = Some(timeout);
            registry.callbacks.drain().collect()
        };

        warn!(?timeout, pending = drained.len(), "watchdog expired");
        for (_, callback) in drained {
            callback.complete(Err(PeerError::WatchdogExpired(timeout)));
        }
        self.notify_fatal(&PeerError::WatchdogExpired(timeout));
    }

    fn notify_fatal(&self, cause: &PeerError) {
        let handler = lock(&self.inner.fatal).clone();
        if let Some(handler) = handler {
            handler(cause);
        }
    }

    /// Stop the watchdog, fail pending calls and detach from the link.
    pub fn shutdown(&self) {
        self.terminate(Terminal::Shutdown);
        lock(&self.inner.target).take();
        lock(&self.inner.fatal).take();
    }
}

impl ConnectionHandler for CallMultiplexer {
    fn on_open(&self, sender: ConnectionSender) {
        self.attach(Arc::new(sender));
    }

    fn on_message(&self, message: Bytes) {
        self.dispatch(message);
    }

    fn on_closed(&self, code: u16, reason: &str) {
        self.connection_lost(PeerError::Closed {
            code,
            reason: reason.to_string(),
        });
    }

    fn on_error(&self, error: PeerError) {
        self.connection_lost(error);
    }
}

impl fmt::Debug for CallMultiplexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = lock(&self.inner.registry);
        f.debug_struct("CallMultiplexer")
            .field("pending", &registry.callbacks.len())
            .field("next_id", &registry.next_id)
            .field("expired", &registry.expired)
            .field("terminal", &registry.terminal)
            .finish()
    }
}
