use std::fmt;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::debug;

use crate::error::{Result, TransportError};
use crate::stream::DuplexStream;

const CHECKSUM_QUERY: &str = "?checksum=";

/// Where a server listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Filesystem-path Unix domain socket.
    Unix(PathBuf),
    /// TCP `host:port`.
    Tcp(String),
}

/// A parsed connection address.
///
/// Accepted forms:
/// - `unix:/run/app.sock` or `unix:///run/app.sock`
/// - `/run/app.sock` (bare absolute path)
/// - `tcp://127.0.0.1:7000`
/// - `127.0.0.1:7000` (bare `host:port`)
///
/// Any form may carry a `?checksum=<token>` suffix naming the schema build
/// the client was generated from; the server rejects mismatches at handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    endpoint: Endpoint,
    checksum: Option<String>,
}

impl Address {
    /// Parse an address string.
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        let invalid = |reason: &str| TransportError::InvalidAddress {
            address: input.to_string(),
            reason: reason.to_string(),
        };

        let (location, checksum) = match input.rfind(CHECKSUM_QUERY) {
            Some(idx) => {
                let token = &input[idx + CHECKSUM_QUERY.len()..];
                if token.is_empty() {
                    return Err(invalid("empty checksum token"));
                }
                (&input[..idx], Some(token.to_string()))
            }
            None => (input, None),
        };

        if location.is_empty() {
            return Err(invalid("empty address"));
        }

        let endpoint = if let Some(path) = location.strip_prefix("unix://") {
            Endpoint::Unix(PathBuf::from(path))
        } else if let Some(path) = location.strip_prefix("unix:") {
            Endpoint::Unix(PathBuf::from(path))
        } else if let Some(host_port) = location.strip_prefix("tcp://") {
            Endpoint::Tcp(validate_host_port(host_port).map_err(|r| invalid(r))?)
        } else if location.starts_with('/') {
            Endpoint::Unix(PathBuf::from(location))
        } else if location.contains("://") {
            return Err(TransportError::Unsupported(location.to_string()));
        } else {
            Endpoint::Tcp(validate_host_port(location).map_err(|r| invalid(r))?)
        };

        if let Endpoint::Unix(path) = &endpoint {
            if path.as_os_str().is_empty() {
                return Err(invalid("empty socket path"));
            }
        }

        Ok(Self { endpoint, checksum })
    }

    /// Build an address from an endpoint with no checksum.
    pub fn from_endpoint(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            checksum: None,
        }
    }

    /// Return a copy of this address carrying `token` as its checksum.
    pub fn with_checksum(mut self, token: impl Into<String>) -> Self {
        self.checksum = Some(token.into());
        self
    }

    /// The endpoint to dial.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Schema checksum token, if any.
    pub fn checksum(&self) -> Option<&str> {
        self.checksum.as_deref()
    }

    /// Open a stream to this address (blocking).
    ///
    /// `timeout` bounds the TCP connect; Unix socket connects complete or fail
    /// immediately.
    pub fn connect(&self, timeout: Option<Duration>) -> Result<DuplexStream> {
        match &self.endpoint {
            #[cfg(unix)]
            Endpoint::Unix(path) => crate::uds::UnixDomainSocket::connect(path),
            #[cfg(not(unix))]
            Endpoint::Unix(path) => Err(TransportError::Unsupported(format!(
                "unix:{}",
                path.display()
            ))),
            Endpoint::Tcp(host_port) => connect_tcp(host_port, timeout),
        }
    }
}

impl FromStr for Address {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Unix(path) => write!(f, "unix:{}", path.display()),
            Endpoint::Tcp(host_port) => write!(f, "tcp://{host_port}"),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.endpoint)?;
        if let Some(token) = &self.checksum {
            write!(f, "{CHECKSUM_QUERY}{token}")?;
        }
        Ok(())
    }
}

fn validate_host_port(input: &str) -> std::result::Result<String, &'static str> {
    let (host, port) = input.rsplit_once(':').ok_or("expected host:port")?;
    if host.is_empty() {
        return Err("missing host");
    }
    port.parse::<u16>().map_err(|_| "invalid port")?;
    Ok(input.to_string())
}

fn connect_tcp(host_port: &str, timeout: Option<Duration>) -> Result<DuplexStream> {
    let connect_err = |source: std::io::Error| TransportError::Connect {
        address: format!("tcp://{host_port}"),
        source,
    };

    let addrs = host_port.to_socket_addrs().map_err(connect_err)?;
    let mut last_err = None;
    for addr in addrs {
        let attempt = match timeout {
            Some(timeout) if !timeout.is_zero() => TcpStream::connect_timeout(&addr, timeout),
            _ => TcpStream::connect(addr),
        };
        match attempt {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                debug!(%addr, "connected over tcp");
                return Ok(DuplexStream::from_tcp(stream));
            }
            Err(err) => last_err = Some(err),
        }
    }

    Err(connect_err(last_err.unwrap_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::AddrNotAvailable,
            "host resolved to no addresses",
        )
    })))
}
