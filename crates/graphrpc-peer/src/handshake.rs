use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use graphrpc_frame::{EnvelopeKind, FrameError, MessageReader, MessageWriter};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{PeerError, Result};

const MAX_PROTOCOL_LEN: usize = 32;
const MAX_VERSION_LEN: usize = 16;
const MAX_CHECKSUM_LEN: usize = 256;
const MAX_REASON_LEN: usize = 1024;

/// Client hello sent in the first envelope of a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandshakeRequest {
    /// Protocol name. `graphrpc` by default.
    pub protocol: String,
    /// Protocol version string, `<major>.<minor>`.
    pub version: String,
    /// Schema checksum of the client build, if the bound type declares one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

/// Server answer to a [`HandshakeRequest`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandshakeResponse {
    pub protocol: String,
    pub version: String,
    /// Whether the session may proceed.
    pub accepted: bool,
    /// Why the session was refused.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Result of a successful handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResult {
    /// Version the remote side announced.
    pub protocol_version: String,
    /// Checksum the client presented (server side) or sent (client side).
    pub checksum: Option<String>,
}

/// Configuration for handshake negotiation.
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    /// Timeout for each blocking handshake operation.
    pub timeout: Duration,
    /// Expected protocol name.
    pub protocol_name: String,
    /// Local protocol version.
    pub protocol_version: String,
    /// Maximum handshake envelope payload size in bytes.
    pub max_handshake_payload: usize,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            protocol_name: "graphrpc".to_string(),
            protocol_version: "1.0".to_string(),
            max_handshake_payload: 16 * 1024,
        }
    }
}

/// Perform the client side of the handshake.
///
/// `checksum` is the schema token carried by the connection address.
pub fn handshake_client<R: Read, W: Write>(
    reader: &mut MessageReader<R>,
    writer: &mut MessageWriter<W>,
    checksum: Option<&str>,
    config: &HandshakeConfig,
) -> Result<HandshakeResult> {
    validate_protocol_name(&config.protocol_name)?;
    validate_version(&config.protocol_version)?;
    validate_checksum(checksum)?;

    let req = HandshakeRequest {
        protocol: config.protocol_name.clone(),
        version: config.protocol_version.clone(),
        checksum: checksum.map(str::to_string),
    };
    send_handshake_json(writer, &req)?;

    let deadline = Instant::now() + config.timeout;
    let payload = recv_handshake_payload(
        reader,
        deadline,
        config.timeout,
        config.max_handshake_payload,
    )?;
    let resp: HandshakeResponse = serde_json::from_slice(&payload)?;

    validate_protocol_name(&resp.protocol)?;
    validate_version(&resp.version)?;

    if resp.protocol != config.protocol_name {
        return Err(PeerError::HandshakeFailed(format!(
            "unknown protocol '{}' (expected '{}')",
            resp.protocol, config.protocol_name
        )));
    }

    if !resp.accepted {
        let reason = resp
            .reason
            .unwrap_or_else(|| "no reason given".to_string());
        warn!(%reason, "server rejected handshake");
        return Err(PeerError::HandshakeRejected(reason));
    }

    if !is_version_compatible(&config.protocol_version, &resp.version)? {
        return Err(PeerError::HandshakeFailed(format!(
            "incompatible version '{}' (local '{}')",
            resp.version, config.protocol_version
        )));
    }

    debug!(version = %resp.version, "handshake accepted");
    Ok(HandshakeResult {
        protocol_version: resp.version,
        checksum: req.checksum,
    })
}

/// Perform the server side of the handshake.
///
/// When `expected_checksum` is set, a client presenting a different checksum
/// is refused with an explanatory reason. Clients that present none are
/// accepted.
pub fn handshake_server<R: Read, W: Write>(
    reader: &mut MessageReader<R>,
    writer: &mut MessageWriter<W>,
    expected_checksum: Option<&str>,
    config: &HandshakeConfig,
) -> Result<HandshakeResult> {
    validate_protocol_name(&config.protocol_name)?;
    validate_version(&config.protocol_version)?;

    let deadline = Instant::now() + config.timeout;
    let payload = recv_handshake_payload(
        reader,
        deadline,
        config.timeout,
        config.max_handshake_payload,
    )?;
    let req: HandshakeRequest = serde_json::from_slice(&payload)?;

    validate_protocol_name(&req.protocol)?;
    validate_version(&req.version)?;
    validate_checksum(req.checksum.as_deref())?;

    let refusal = if req.protocol != config.protocol_name {
        Some(format!(
            "unknown protocol '{}' (expected '{}')",
            req.protocol, config.protocol_name
        ))
    } else if !is_version_compatible(&req.version, &config.protocol_version)? {
        Some(format!(
            "incompatible version '{}' (server '{}')",
            req.version, config.protocol_version
        ))
    } else {
        match (expected_checksum, req.checksum.as_deref()) {
            (Some(expected), Some(actual)) if expected != actual => Some(format!(
                "schema checksum mismatch (client '{actual}', server '{expected}')"
            )),
            _ => None,
        }
    };

    let resp = HandshakeResponse {
        protocol: config.protocol_name.clone(),
        version: config.protocol_version.clone(),
        accepted: refusal.is_none(),
        reason: refusal.clone(),
    };
    send_handshake_json(writer, &resp)?;

    if let Some(reason) = refusal {
        return Err(PeerError::HandshakeRejected(reason));
    }

    Ok(HandshakeResult {
        protocol_version: req.version,
        checksum: req.checksum,
    })
}

fn send_handshake_json<T: Serialize, W: Write>(
    writer: &mut MessageWriter<W>,
    value: &T,
) -> Result<()> {
    let payload = serde_json::to_vec(value)?;
    writer.send(EnvelopeKind::Handshake, &payload)?;
    Ok(())
}

fn recv_handshake_payload<R: Read>(
    reader: &mut MessageReader<R>,
    deadline: Instant,
    timeout: Duration,
    max_handshake_payload: usize,
) -> Result<Vec<u8>> {
    loop {
        if Instant::now() >= deadline {
            return Err(PeerError::Timeout(timeout));
        }

        match reader.read_message() {
            Ok(envelope) => {
                if envelope.kind != EnvelopeKind::Handshake {
                    return Err(PeerError::HandshakeFailed(format!(
                        "expected handshake envelope, got {:?}",
                        envelope.kind
                    )));
                }
                if envelope.payload.len() > max_handshake_payload {
                    return Err(PeerError::HandshakeFailed(format!(
                        "handshake payload too large: {} (max {})",
                        envelope.payload.len(),
                        max_handshake_payload
                    )));
                }
                return Ok(envelope.payload.to_vec());
            }
            Err(FrameError::Io(err))
                if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(FrameError::ConnectionClosed) => {
                return Err(PeerError::Disconnected(
                    "connection closed during handshake".to_string(),
                ));
            }
            Err(err) => return Err(PeerError::Frame(err)),
        }
    }
}

fn validate_protocol_name(protocol: &str) -> Result<()> {
    if protocol.is_empty() || protocol.len() > MAX_PROTOCOL_LEN {
        return Err(PeerError::HandshakeFailed(format!(
            "invalid protocol name length: {}",
            protocol.len()
        )));
    }
    Ok(())
}

fn validate_version(version: &str) -> Result<()> {
    if version.is_empty() || version.len() > MAX_VERSION_LEN {
        return Err(PeerError::HandshakeFailed(format!(
            "invalid protocol version length: {}",
            version.len()
        )));
    }
    let _ = parse_version(version)?;
    Ok(())
}

fn validate_checksum(checksum: Option<&str>) -> Result<()> {
    if let Some(token) = checksum {
        if token.is_empty() || token.len() > MAX_CHECKSUM_LEN {
            return Err(PeerError::HandshakeFailed(format!(
                "invalid checksum length: {}",
                token.len()
            )));
        }
    }
    Ok(())
}

fn is_version_compatible(client_version: &str, server_version: &str) -> Result<bool> {
    let (client_major, _) = parse_version(client_version)?;
    let (server_major, _) = parse_version(server_version)?;
    Ok(client_major == server_major)
}

fn parse_version(version: &str) -> Result<(u16, u16)> {
    let invalid = |what: &str| PeerError::HandshakeFailed(format!("invalid version '{version}': {what}"));

    let (major, minor) = version
        .split_once('.')
        .ok_or_else(|| invalid("expected '<major>.<minor>'"))?;
    if minor.contains('.') {
        return Err(invalid("expected '<major>.<minor>'"));
    }

    let major = major.parse::<u16>().map_err(|_| invalid("non-numeric major"))?;
    let minor = minor.parse::<u16>().map_err(|_| invalid("non-numeric minor"))?;
    Ok((major, minor))
}

/// Clamp a refusal reason so a hostile peer cannot make us log megabytes.
pub(crate) fn clamp_reason(reason: &str) -> &str {
    if reason.len() <= MAX_REASON_LEN {
        return reason;
    }
    let mut end = MAX_REASON_LEN;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}
