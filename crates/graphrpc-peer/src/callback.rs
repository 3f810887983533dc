use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use graphrpc_frame::ValueReader;
use tracing::error;

use crate::error::{CallFailure, CallResult, PeerError, Result};

/// Decodes one typed payload from a response stream.
pub type Decoder<T> = Box<dyn FnOnce(&mut ValueReader) -> graphrpc_frame::Result<T> + Send>;

/// A pending response handler.
///
/// `complete` is invoked exactly once: with the response stream positioned
/// after the recipient, or with the error that ended the call (link loss,
/// watchdog expiry).
pub trait Callback: Send {
    fn complete(self: Box<Self>, outcome: Result<ValueReader>);
}

/// Read the success discriminator and decode with the matching decoder.
fn resolve<T, E>(
    outcome: Result<ValueReader>,
    decode_success: Decoder<T>,
    decode_failure: Decoder<E>,
) -> CallResult<T, E> {
    let mut reader = outcome?;
    if reader.read_bool()? {
        let value = guarded(|| decode_success(&mut reader))??;
        reader.expect_end()?;
        Ok(value)
    } else {
        let failure = guarded(|| decode_failure(&mut reader))??;
        reader.expect_end()?;
        Err(CallFailure::Remote(failure))
    }
}

/// A panicking decoder fails only its own call.
fn guarded<T>(
    decode: impl FnOnce() -> graphrpc_frame::Result<T>,
) -> Result<graphrpc_frame::Result<T>> {
    panic::catch_unwind(AssertUnwindSafe(decode)).map_err(|payload| {
        let cause = PeerError::from_panic(payload.as_ref());
        error!(error = %cause, "response decoder panicked");
        cause
    })
}

/// Hands the decoded outcome to success/failure continuations.
///
/// A panic inside a decoder or continuation is logged and swallowed so it can
/// never unwind into the receive loop or the watchdog thread.
pub struct NonBlockingCallback<T, E> {
    decode_success: Decoder<T>,
    decode_failure: Decoder<E>,
    on_success: Box<dyn FnOnce(T) + Send>,
    on_failure: Box<dyn FnOnce(CallFailure<E>) + Send>,
}

impl<T, E> NonBlockingCallback<T, E> {
    pub fn new(
        decode_success: impl FnOnce(&mut ValueReader) -> graphrpc_frame::Result<T> + Send + 'static,
        decode_failure: impl FnOnce(&mut ValueReader) -> graphrpc_frame::Result<E> + Send + 'static,
        on_success: impl FnOnce(T) + Send + 'static,
        on_failure: impl FnOnce(CallFailure<E>) + Send + 'static,
    ) -> Self {
        Self {
            decode_success: Box::new(decode_success),
            decode_failure: Box::new(decode_failure),
            on_success: Box::new(on_success),
            on_failure: Box::new(on_failure),
        }
    }
}

impl<T: 'static, E: 'static> Callback for NonBlockingCallback<T, E> {
    fn complete(self: Box<Self>, outcome: Result<ValueReader>) {
        let this = *self;
        let result = resolve(outcome, this.decode_success, this.decode_failure);
        let on_success = this.on_success;
        let on_failure = this.on_failure;

        let ran = panic::catch_unwind(AssertUnwindSafe(move || match result {
            Ok(value) => on_success(value),
            Err(failure) => on_failure(failure),
        }));
        if let Err(payload) = ran {
            let cause = PeerError::from_panic(payload.as_ref());
            error!(error = %cause, "call continuation panicked");
        }
    }
}

impl<T, E> fmt::Debug for NonBlockingCallback<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NonBlockingCallback").finish_non_exhaustive()
    }
}

type Slot<T, E> = Arc<(Mutex<Option<CallResult<T, E>>>, Condvar)>;

/// Stores the outcome for a thread waiting on the paired [`BlockingHandle`].
pub struct BlockingCallback<T, E> {
    decode_success: Decoder<T>,
    decode_failure: Decoder<E>,
    slot: Slot<T, E>,
}

/// The waiting side of a [`BlockingCallback`].
pub struct BlockingHandle<T, E> {
    slot: Slot<T, E>,
}

impl<T, E> BlockingCallback<T, E> {
    pub fn new(
        decode_success: impl FnOnce(&mut ValueReader) -> graphrpc_frame::Result<T> + Send + 'static,
        decode_failure: impl FnOnce(&mut ValueReader) -> graphrpc_frame::Result<E> + Send + 'static,
    ) -> (Self, BlockingHandle<T, E>) {
        let slot: Slot<T, E> = Arc::new((Mutex::new(None), Condvar::new()));
        let callback = Self {
            decode_success: Box::new(decode_success),
            decode_failure: Box::new(decode_failure),
            slot: Arc::clone(&slot),
        };
        (callback, BlockingHandle { slot })
    }
}

impl<T: Send + 'static, E: Send + 'static> Callback for BlockingCallback<T, E> {
    fn complete(self: Box<Self>, outcome: Result<ValueReader>) {
        let this = *self;
        let result = resolve(outcome, this.decode_success, this.decode_failure);
        let (lock, signal) = &*this.slot;
        *lock.lock().unwrap_or_else(PoisonError::into_inner) = Some(result);
        signal.notify_all();
    }
}

impl<T, E> BlockingHandle<T, E> {
    /// Block until the call completes or `timeout` elapses.
    ///
    /// Timing out does not cancel the call; a late response is discarded.
    pub fn wait(self, timeout: Duration) -> CallResult<T, E> {
        let deadline = Instant::now() + timeout;
        let (lock, signal) = &*self.slot;
        let mut guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(result) = guard.take() {
                return result;
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(CallFailure::Local(PeerError::Timeout(timeout)));
            }
            guard = signal
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Whether the outcome has arrived.
    pub fn is_complete(&self) -> bool {
        self.slot
            .0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

impl<T, E> fmt::Debug for BlockingHandle<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockingHandle")
            .field("complete", &self.is_complete())
            .finish()
    }
}
