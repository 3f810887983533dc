use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use graphrpc_frame::{TypeRegistry, TypeResolver};
use graphrpc_transport::Address;
use tracing::info;

use crate::connection::{Connection, ConnectionState};
use crate::connector::ConnectConfig;
use crate::error::Result;
use crate::multiplexer::{CallMultiplexer, DispatchTarget};

/// Generated glue for one service: how to dispatch inbound calls to a local
/// receiver, and which schema checksum the build carries.
pub trait ServiceBinding {
    /// The local object that serves inbound calls.
    type Local: Send + Sync + 'static;

    /// Appended to the connection address so a server built from a
    /// different schema can refuse the session at handshake.
    const CHECKSUM: Option<&'static str> = None;

    fn dispatcher(local: Self::Local) -> Arc<dyn DispatchTarget>;
}

/// Configuration for [`bind`].
#[derive(Clone)]
pub struct BindConfig {
    pub connect: ConnectConfig,
    /// Arm the call watchdog with this timeout once connected.
    pub watchdog: Option<Duration>,
    /// Signature resolver for objects in payloads.
    pub resolver: Arc<dyn TypeResolver>,
}

impl Default for BindConfig {
    fn default() -> Self {
        Self {
            connect: ConnectConfig::default(),
            watchdog: None,
            resolver: Arc::new(TypeRegistry::new()),
        }
    }
}

impl fmt::Debug for BindConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BindConfig")
            .field("connect", &self.connect)
            .field("watchdog", &self.watchdog)
            .finish_non_exhaustive()
    }
}

/// Connect a fresh session for `B` and return its remote-call handle.
///
/// Every call builds an independent connection and multiplexer, so binding
/// again after a close yields a new working session.
pub fn bind<B: ServiceBinding>(
    address: &str,
    local: B::Local,
    config: &BindConfig,
) -> Result<RemoteEndpoint> {
    let address = Address::parse(address)?;
    bind_address::<B>(address, local, config)
}

/// [`bind`] with an already parsed address.
pub fn bind_address<B: ServiceBinding>(
    mut address: Address,
    local: B::Local,
    config: &BindConfig,
) -> Result<RemoteEndpoint> {
    if let Some(checksum) = B::CHECKSUM {
        address = address.with_checksum(checksum);
    }

    let mux = CallMultiplexer::with_resolver(Arc::clone(&config.resolver));
    mux.set_dispatch_target(B::dispatcher(local));

    let connection = match Connection::open(&address, &config.connect, Arc::new(mux.clone())) {
        Ok(connection) => connection,
        Err(err) => {
            mux.shutdown();
            return Err(err);
        }
    };

    if let Some(timeout) = config.watchdog {
        if let Err(err) = mux.start_watchdog(timeout) {
            connection.close();
            mux.shutdown();
            return Err(err);
        }
    }

    info!(%address, watchdog = ?config.watchdog, "endpoint bound");
    Ok(RemoteEndpoint { mux, connection })
}

/// A bound session: issue calls through [`RemoteEndpoint::multiplexer`].
///
/// Dropping the endpoint closes it.
pub struct RemoteEndpoint {
    mux: CallMultiplexer,
    connection: Connection,
}

impl RemoteEndpoint {
    pub fn multiplexer(&self) -> &CallMultiplexer {
        &self.mux
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn is_open(&self) -> bool {
        self.connection.state() == ConnectionState::Open && !self.mux.is_terminal()
    }

    /// Close the connection, fail outstanding calls and stop the watchdog.
    pub fn close(&self) {
        self.connection.close();
        self.mux.shutdown();
    }
}

impl Drop for RemoteEndpoint {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for RemoteEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteEndpoint")
            .field("connection", &self.connection)
            .field("multiplexer", &self.mux)
            .finish()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::path::PathBuf;
    use std::thread;

    use graphrpc_frame::ValueReader;
    use graphrpc_transport::UnixDomainSocket;

    use super::*;
    use crate::error::PeerError;

    struct Greeter;

    struct GreeterTarget;

    impl DispatchTarget for GreeterTarget {
        fn dispatch(
            &self,
            _method: i32,
            _callback_id: Option<i32>,
            _args: &mut ValueReader,
            _mux: &CallMultiplexer,
        ) -> Result<()> {
            Ok(())
        }
    }

    impl ServiceBinding for Greeter {
        type Local = ();
        const CHECKSUM: Option<&'static str> = Some("greeter-v2");

        fn dispatcher(_local: ()) -> Arc<dyn DispatchTarget> {
            Arc::new(GreeterTarget)
        }
    }

    fn temp_socket(tag: &str) -> (PathBuf, PathBuf) {
        let dir = std::env::temp_dir().join(format!(
            "graphrpc-bind-{tag}-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("time should be after epoch")
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
        let sock = dir.join("bind.sock");
        (dir, sock)
    }

    fn quick() -> BindConfig {
        BindConfig {
            connect: ConnectConfig {
                timeout: Duration::from_millis(500),
                initial_backoff: Duration::from_millis(50),
                ..ConnectConfig::default()
            },
            ..BindConfig::default()
        }
    }

    #[test]
    fn binder_appends_declared_checksum() {
        let (dir, sock) = temp_socket("checksum");
        let listener = UnixDomainSocket::bind(&sock).expect("listener should bind");

        let server = thread::spawn(move || {
            let stream = listener.accept().expect("listener should accept");
            let conn = Connection::serve(
                stream,
                Some("greeter-v2"),
                &ConnectConfig::default(),
                Arc::new(CallMultiplexer::new()),
            )
            .expect("matching checksum should be accepted");
            let checksum = conn.handshake().checksum.clone();
            (conn, checksum)
        });

        let endpoint = bind::<Greeter>(&sock.display().to_string(), (), &quick())
            .expect("bind should succeed");
        let (server_conn, checksum) = server.join().expect("server thread should complete");
        assert_eq!(checksum.as_deref(), Some("greeter-v2"));
        assert!(endpoint.is_open());

        endpoint.close();
        assert!(!endpoint.is_open());
        drop(server_conn);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn bind_to_missing_socket_fails_within_budget() {
        let (dir, sock) = temp_socket("missing");
        let started = std::time::Instant::now();
        let result = bind::<Greeter>(&sock.display().to_string(), (), &quick());
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(matches!(result, Err(PeerError::ConnectFailed { .. })));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn invalid_address_is_reported() {
        let result = bind::<Greeter>("tcp://", (), &quick());
        assert!(matches!(result, Err(PeerError::Transport(_))));
    }
}
