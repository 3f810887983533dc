use std::thread;
use std::time::{Duration, Instant};

use graphrpc_frame::{FrameConfig, MessageReader, MessageWriter};
use graphrpc_transport::{Address, DuplexStream};
use tracing::{debug, info, warn};

use crate::error::{PeerError, Result};
use crate::handshake::{handshake_client, handshake_server, HandshakeConfig, HandshakeResult};

/// Configuration for establishing a connection.
#[derive(Debug, Clone)]
pub struct ConnectConfig {
    /// Overall budget for connect attempts, including backoff sleeps.
    pub timeout: Duration,
    /// Delay after the first failed attempt; doubles after each failure.
    pub initial_backoff: Duration,
    /// Handshake parameters.
    pub handshake: HandshakeConfig,
    /// Runtime framing limits applied once the handshake succeeds.
    pub frame: FrameConfig,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            initial_backoff: Duration::from_secs(1),
            handshake: HandshakeConfig::default(),
            frame: FrameConfig::default(),
        }
    }
}

/// A connected, handshaken stream pair ready for the worker loops.
pub(crate) struct Established {
    pub reader: MessageReader<DuplexStream>,
    pub writer: MessageWriter<DuplexStream>,
    pub handshake: HandshakeResult,
}

/// Run `attempt` until it succeeds or `timeout` is spent.
///
/// The first attempt always runs. After each retryable failure the helper
/// sleeps `initial_backoff`, then twice that, and so on, each sleep capped to
/// what is left of the budget. `attempt` receives the remaining budget so it
/// can bound its own blocking operations.
///
/// Exhausting the budget yields [`PeerError::ConnectFailed`] carrying every
/// attempt's error. A non-retryable error is returned as-is.
pub fn retry_with_backoff<T>(
    label: &str,
    timeout: Duration,
    initial_backoff: Duration,
    mut attempt: impl FnMut(Duration) -> Result<T>,
) -> Result<T> {
    let started = Instant::now();
    let deadline = started + timeout;
    let mut backoff = initial_backoff;
    let mut failures = Vec::new();

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match attempt(remaining) {
            Ok(value) => {
                if !failures.is_empty() {
                    info!(address = label, attempts = failures.len() + 1, "connected after retrying");
                }
                return Ok(value);
            }
            Err(err) if !err.is_retryable() => return Err(err),
            Err(err) => {
                debug!(address = label, attempt = failures.len() + 1, error = %err, "connect attempt failed");
                failures.push(err);
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        let delay = backoff.min(remaining);
        debug!(address = label, ?delay, "backing off before next attempt");
        thread::sleep(delay);
        backoff = backoff.saturating_mul(2);

        if Instant::now() >= deadline {
            break;
        }
    }

    warn!(
        address = label,
        attempts = failures.len(),
        elapsed = ?started.elapsed(),
        "giving up on connect"
    );
    Err(PeerError::ConnectFailed {
        address: label.to_string(),
        attempts: failures,
    })
}

/// Connect to `address`, perform the client handshake and restore runtime
/// framing limits. Transient failures are retried within `config.timeout`.
pub(crate) fn establish(address: &Address, config: &ConnectConfig) -> Result<Established> {
    let label = address.to_string();
    retry_with_backoff(&label, config.timeout, config.initial_backoff, |remaining| {
        establish_once(address, config, remaining)
    })
}

fn establish_once(address: &Address, config: &ConnectConfig, remaining: Duration) -> Result<Established> {
    let step_timeout = clamp_step(config.handshake.timeout.min(remaining));
    let stream = address.connect(Some(step_timeout))?;
    debug!(%address, transport = stream.transport_name(), "stream connected");

    let (mut reader, mut writer) = handshake_pair(stream, &config.handshake, step_timeout)?;
    let handshake = handshake_client(
        &mut reader,
        &mut writer,
        address.checksum(),
        &HandshakeConfig {
            timeout: step_timeout,
            ..config.handshake.clone()
        },
    )?;
    restore_runtime_limits(&mut reader, &mut writer, &config.frame)?;

    Ok(Established {
        reader,
        writer,
        handshake,
    })
}

/// Server side of [`establish`] for an accepted stream.
pub(crate) fn accept(
    stream: DuplexStream,
    expected_checksum: Option<&str>,
    config: &ConnectConfig,
) -> Result<Established> {
    let step_timeout = clamp_step(config.handshake.timeout);
    let (mut reader, mut writer) = handshake_pair(stream, &config.handshake, step_timeout)?;
    let handshake = handshake_server(&mut reader, &mut writer, expected_checksum, &config.handshake)?;
    restore_runtime_limits(&mut reader, &mut writer, &config.frame)?;

    Ok(Established {
        reader,
        writer,
        handshake,
    })
}

fn handshake_pair(
    stream: DuplexStream,
    handshake: &HandshakeConfig,
    step_timeout: Duration,
) -> Result<(MessageReader<DuplexStream>, MessageWriter<DuplexStream>)> {
    let reader_stream = stream.try_clone()?;

    // Pre-handshake traffic gets the tighter payload cap.
    let frame_config = FrameConfig {
        max_message_size: handshake.max_handshake_payload,
        read_timeout: Some(step_timeout),
        write_timeout: Some(step_timeout),
    };

    let reader = MessageReader::with_config_stream(reader_stream, frame_config.clone())?;
    let writer = MessageWriter::with_config_stream(stream, frame_config)?;
    Ok((reader, writer))
}

fn restore_runtime_limits(
    reader: &mut MessageReader<DuplexStream>,
    writer: &mut MessageWriter<DuplexStream>,
    frame: &FrameConfig,
) -> Result<()> {
    reader.set_max_message_size(frame.max_message_size);
    writer.set_max_message_size(frame.max_message_size);
    reader.get_ref().set_read_timeout(frame.read_timeout)?;
    writer.get_ref().set_write_timeout(frame.write_timeout)?;
    Ok(())
}

// Socket timeouts reject a zero duration.
fn clamp_step(timeout: Duration) -> Duration {
    timeout.max(Duration::from_millis(1))
}
