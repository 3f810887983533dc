use std::any::Any;
use std::fmt;
use std::time::Duration;

/// Errors that can occur in connection, call and binding operations.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] graphrpc_transport::TransportError),

    /// Frame or value-stream error.
    #[error("frame error: {0}")]
    Frame(#[from] graphrpc_frame::FrameError),

    /// Every connect attempt within the budget failed.
    #[error(
        "failed to connect to {address} after {} attempt(s): {}",
        .attempts.len(),
        summarize(.attempts)
    )]
    ConnectFailed {
        address: String,
        attempts: Vec<PeerError>,
    },

    /// The handshake exchange itself went wrong.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// The server refused the session (e.g. schema checksum mismatch).
    #[error("handshake rejected by server: {0}")]
    HandshakeRejected(String),

    /// The link dropped without an orderly close.
    #[error("peer disconnected: {0}")]
    Disconnected(String),

    /// The connection was closed in an orderly way.
    #[error("connection closed ({code}): {reason}")]
    Closed { code: u16, reason: String },

    /// The liveness watchdog was not fed in time.
    #[error("watchdog expired after {0:?} without being fed")]
    WatchdogExpired(Duration),

    /// A blocking wait timed out.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Method ids are non-negative; callback ids are positive.
    #[error("invalid recipient id {0}")]
    InvalidRecipient(i32),

    /// Application code run by the runtime panicked.
    #[error("handler panicked: {0}")]
    Panicked(String),

    /// No open connection is attached.
    #[error("not connected")]
    NotConnected,

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PeerError {
    /// Whether a failed connect attempt is worth retrying.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            PeerError::HandshakeRejected(_) | PeerError::ConnectFailed { .. }
        )
    }

    pub(crate) fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let message = if let Some(text) = payload.downcast_ref::<&'static str>() {
            text
        } else if let Some(text) = payload.downcast_ref::<String>() {
            text.as_str()
        } else {
            "non-string panic payload"
        };
        PeerError::Panicked(message.to_string())
    }
}

impl From<std::io::Error> for PeerError {
    fn from(err: std::io::Error) -> Self {
        PeerError::Transport(graphrpc_transport::TransportError::Io(err))
    }
}

fn summarize(attempts: &[PeerError]) -> String {
    attempts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, PeerError>;

/// Why a call did not produce a success value.
///
/// `Remote` is a well-formed failure response decoded with the call's
/// failure reader; `Local` is anything that went wrong on this side of the
/// wire or with the link.
#[derive(Debug)]
pub enum CallFailure<E> {
    Remote(E),
    Local(PeerError),
}

impl<E> CallFailure<E> {
    /// The local error, if this is not an application-level failure.
    pub fn local(&self) -> Option<&PeerError> {
        match self {
            CallFailure::Local(err) => Some(err),
            CallFailure::Remote(_) => None,
        }
    }

    /// The decoded application failure, if any.
    pub fn remote(&self) -> Option<&E> {
        match self {
            CallFailure::Remote(value) => Some(value),
            CallFailure::Local(_) => None,
        }
    }
}

impl<E> From<PeerError> for CallFailure<E> {
    fn from(err: PeerError) -> Self {
        CallFailure::Local(err)
    }
}

impl<E> From<graphrpc_frame::FrameError> for CallFailure<E> {
    fn from(err: graphrpc_frame::FrameError) -> Self {
        CallFailure::Local(PeerError::Frame(err))
    }
}

impl<E: fmt::Debug> fmt::Display for CallFailure<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallFailure::Remote(value) => write!(f, "remote call failed: {value:?}"),
            CallFailure::Local(err) => write!(f, "{err}"),
        }
    }
}

impl<E: fmt::Debug> std::error::Error for CallFailure<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CallFailure::Local(err) => Some(err),
            CallFailure::Remote(_) => None,
        }
    }
}

pub type CallResult<T, E> = std::result::Result<T, CallFailure<E>>;
