//! In-process echo session: a server and a bound client over a Unix socket.
//!
//! Run with:
//!   cargo run -p graphrpc --example echo-session
//!
//! Set `GRAPHRPC_LOG=json` for JSON log lines on stderr.

use std::fs;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use graphrpc::frame::{self, ValueReader};
use graphrpc::peer::{
    bind, BindConfig, CallMultiplexer, ConnectConfig, Connection, DispatchTarget, PeerError,
    ServiceBinding,
};
use graphrpc::transport::UnixDomainSocket;
use tracing::info;

const ECHO: i32 = 0;
const SCHEMA: &str = "echo-demo-1";

struct EchoServer;

impl DispatchTarget for EchoServer {
    fn dispatch(
        &self,
        method: i32,
        callback_id: Option<i32>,
        args: &mut ValueReader,
        mux: &CallMultiplexer,
    ) -> graphrpc::peer::Result<()> {
        if method != ECHO {
            return Err(PeerError::InvalidRecipient(method));
        }
        let text = args.read_string()?;
        if let Some(id) = callback_id {
            mux.respond(id, true, |w| {
                w.write_str(&text);
                Ok(())
            })?;
        }
        Ok(())
    }
}

struct NoInbound;

impl DispatchTarget for NoInbound {
    fn dispatch(
        &self,
        method: i32,
        _callback_id: Option<i32>,
        _args: &mut ValueReader,
        _mux: &CallMultiplexer,
    ) -> graphrpc::peer::Result<()> {
        Err(PeerError::InvalidRecipient(method))
    }
}

struct Echo;

impl ServiceBinding for Echo {
    type Local = ();
    const CHECKSUM: Option<&'static str> = Some(SCHEMA);

    fn dispatcher(_local: ()) -> Arc<dyn DispatchTarget> {
        Arc::new(NoInbound)
    }
}

fn init_logging() {
    let builder = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(tracing::Level::DEBUG)
        .with_ansi(false)
        .with_target(false);

    if std::env::var("GRAPHRPC_LOG").as_deref() == Ok("json") {
        let _ = builder.json().try_init();
    } else {
        let _ = builder.try_init();
    }
}

fn read_string(r: &mut ValueReader) -> frame::Result<String> {
    r.read_string().map(|s| s.to_string())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let sock_dir = std::env::temp_dir().join(format!("graphrpc-echo-{}", std::process::id()));
    fs::create_dir_all(&sock_dir)?;
    let sock_path = sock_dir.join("echo.sock");

    let listener = UnixDomainSocket::bind(&sock_path)?;
    info!(path = %sock_path.display(), "echo server listening");

    let server = thread::spawn(move || -> Result<Connection, PeerError> {
        let stream = listener.accept()?;
        let mux = CallMultiplexer::new();
        mux.set_dispatch_target(Arc::new(EchoServer));
        Connection::serve(stream, Some(SCHEMA), &ConnectConfig::default(), Arc::new(mux))
    });

    let config = BindConfig {
        watchdog: Some(Duration::from_secs(5)),
        ..BindConfig::default()
    };
    let endpoint = bind::<Echo>(&format!("unix:{}", sock_path.display()), (), &config)?;
    let server_conn = server
        .join()
        .map_err(|_| "server thread panicked")??;

    for word in ["alpha", "beta", "gamma"] {
        let reply = endpoint
            .multiplexer()
            .call(
                ECHO,
                |w| {
                    w.write_str(word);
                    Ok(())
                },
                read_string,
                read_string,
            )?
            .wait(Duration::from_secs(2))?;
        endpoint.multiplexer().feed_watchdog();
        println!("{word} -> {reply}");
    }

    endpoint.close();
    drop(server_conn);
    let _ = fs::remove_dir_all(&sock_dir);
    Ok(())
}
