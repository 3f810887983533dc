#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use graphrpc::frame::{
    self, MessageReader, MessageWriter, ObjectRef, RemoteObject, TypeRegistry, ValueReader,
    ValueWriter,
};
use graphrpc::peer::{
    handshake_server, BindConfig, BlockingHandle, CallMultiplexer, ConnectConfig, Connection,
    DispatchTarget, HandshakeConfig, PeerError, Result, ServiceBinding,
};
use graphrpc::transport::{DuplexStream, UnixDomainSocket};

pub const ADD: i32 = 0;
pub const DIVIDE: i32 = 1;
pub const DEFER: i32 = 2;
pub const STALL: i32 = 3;
pub const ECHO_GRAPH: i32 = 4;
pub const NOTIFY_ME: i32 = 5;
pub const GARBAGE_REPLY: i32 = 6;

/// Client-side method the server calls back.
pub const ON_NOTICE: i32 = 0;

pub const CHECKSUM: &str = "calc-schema-1";

#[derive(Debug, Default)]
pub struct Node {
    pub label: String,
    pub next: Option<ObjectRef>,
}

impl RemoteObject for Node {
    fn write_fields(&self, writer: &mut ValueWriter) -> frame::Result<()> {
        writer.write_str(&self.label);
        writer.write_object(self.next.as_ref())
    }

    fn read_fields(&mut self, reader: &mut ValueReader) -> frame::Result<()> {
        self.label = reader.read_string()?.to_string();
        self.next = reader.read_object()?;
        Ok(())
    }
}

pub fn registry() -> Arc<TypeRegistry> {
    Arc::new(TypeRegistry::new().with::<Node>("test.Node"))
}

/// Server half of the calculator service.
#[derive(Default)]
pub struct CalculatorServer {
    deferred: Mutex<Vec<(i32, i32)>>,
}

impl DispatchTarget for CalculatorServer {
    fn dispatch(
        &self,
        method: i32,
        callback_id: Option<i32>,
        args: &mut ValueReader,
        mux: &CallMultiplexer,
    ) -> Result<()> {
        match (method, callback_id) {
            (ADD, Some(id)) => {
                let (a, b) = (args.read_i32()?, args.read_i32()?);
                mux.respond(id, true, |w| {
                    w.write_i32(a.wrapping_add(b));
                    Ok(())
                })
            }
            (DIVIDE, Some(id)) => {
                let (a, b) = (args.read_i32()?, args.read_i32()?);
                match a.checked_div(b) {
                    Some(q) => mux.respond(id, true, |w| {
                        w.write_i32(q);
                        Ok(())
                    }),
                    None => mux.respond(id, false, |w| {
                        w.write_str("division by zero");
                        Ok(())
                    }),
                }
            }
            (DEFER, Some(id)) => {
                let tag = args.read_i32()?;
                let ready = {
                    let mut deferred = self.deferred.lock().unwrap_or_else(|e| e.into_inner());
                    deferred.push((id, tag));
                    if deferred.len() == 2 {
                        std::mem::take(&mut *deferred)
                    } else {
                        Vec::new()
                    }
                };
                // Answer the later call first.
                for (id, tag) in ready.into_iter().rev() {
                    mux.respond(id, true, |w| {
                        w.write_i32(tag);
                        Ok(())
                    })?;
                }
                Ok(())
            }
            (STALL, _) => Ok(()),
            (ECHO_GRAPH, Some(id)) => {
                let graph = args.read_object()?;
                mux.respond(id, true, |w| w.write_object(graph.as_ref()))
            }
            (NOTIFY_ME, None) => {
                let text = args.read_string()?;
                mux.invoke_fire_and_forget(ON_NOTICE, |w| {
                    w.write_str(&format!("notice: {text}"));
                    Ok(())
                })
            }
            (GARBAGE_REPLY, Some(id)) => mux.respond(id, true, |_| Ok(())),
            (other, _) => Err(PeerError::InvalidRecipient(other)),
        }
    }
}

/// Client half: receives server notices.
pub struct NoticeTarget {
    notices: Sender<String>,
}

impl DispatchTarget for NoticeTarget {
    fn dispatch(
        &self,
        method: i32,
        _callback_id: Option<i32>,
        args: &mut ValueReader,
        _mux: &CallMultiplexer,
    ) -> Result<()> {
        if method != ON_NOTICE {
            return Err(PeerError::InvalidRecipient(method));
        }
        let text = args.read_string()?;
        let _ = self.notices.send(text.to_string());
        Ok(())
    }
}

pub struct Calculator;

impl ServiceBinding for Calculator {
    type Local = Sender<String>;
    const CHECKSUM: Option<&'static str> = Some(CHECKSUM);

    fn dispatcher(local: Sender<String>) -> Arc<dyn DispatchTarget> {
        Arc::new(NoticeTarget { notices: local })
    }
}

/// Same service built from a different schema.
pub struct StaleCalculator;

impl ServiceBinding for StaleCalculator {
    type Local = Sender<String>;
    const CHECKSUM: Option<&'static str> = Some("calc-schema-0");

    fn dispatcher(local: Sender<String>) -> Arc<dyn DispatchTarget> {
        Arc::new(NoticeTarget { notices: local })
    }
}

pub fn read_i32(r: &mut ValueReader) -> frame::Result<i32> {
    r.read_i32()
}

pub fn read_string(r: &mut ValueReader) -> frame::Result<String> {
    r.read_string().map(|s| s.to_string())
}

pub fn read_graph(r: &mut ValueReader) -> frame::Result<Option<ObjectRef>> {
    r.read_object()
}

pub fn call_i32(
    mux: &CallMultiplexer,
    method: i32,
    args: &[i32],
) -> Result<BlockingHandle<i32, String>> {
    let args = args.to_vec();
    mux.call(
        method,
        move |w| {
            for arg in args {
                w.write_i32(arg);
            }
            Ok(())
        },
        read_i32,
        read_string,
    )
}

pub const WAIT: Duration = Duration::from_secs(5);

pub fn bind_config() -> BindConfig {
    BindConfig {
        connect: ConnectConfig {
            timeout: Duration::from_secs(2),
            initial_backoff: Duration::from_millis(50),
            ..ConnectConfig::default()
        },
        resolver: registry(),
        ..BindConfig::default()
    }
}

/// A server session: its connection and multiplexer.
pub struct Served {
    pub connection: Connection,
    pub mux: CallMultiplexer,
}

pub struct TestServer {
    dir: PathBuf,
    sock: PathBuf,
    listener: Arc<UnixDomainSocket>,
}

impl TestServer {
    pub fn start(tag: &str) -> Self {
        let dir = std::env::temp_dir().join(format!(
            "graphrpc-it-{tag}-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("time should be after epoch")
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
        let sock = dir.join("calc.sock");
        let listener = UnixDomainSocket::bind(&sock).expect("listener should bind");
        Self {
            dir,
            sock,
            listener: Arc::new(listener),
        }
    }

    pub fn address(&self) -> String {
        format!("unix:{}", self.sock.display())
    }

    /// Accept one client on a background thread.
    pub fn accept(&self) -> JoinHandle<Result<Served>> {
        let listener = Arc::clone(&self.listener);
        thread::spawn(move || {
            let stream = listener.accept()?;
            let mux = CallMultiplexer::with_resolver(registry());
            mux.set_dispatch_target(Arc::new(CalculatorServer::default()));
            let connection = Connection::serve(
                stream,
                Some(CHECKSUM),
                &ConnectConfig::default(),
                Arc::new(mux.clone()),
            )?;
            Ok(Served { connection, mux })
        })
    }

    /// Accept one client, handshake, then hand the raw halves to `script`.
    pub fn accept_raw(
        &self,
        script: impl FnOnce(MessageReader<DuplexStream>, MessageWriter<DuplexStream>) + Send + 'static,
    ) -> JoinHandle<()> {
        let listener = Arc::clone(&self.listener);
        thread::spawn(move || {
            let stream = listener.accept().expect("listener should accept");
            let mut reader = MessageReader::new(stream.try_clone().expect("stream should clone"));
            let mut writer = MessageWriter::new(stream);
            handshake_server(&mut reader, &mut writer, None, &HandshakeConfig::default())
                .expect("server handshake should succeed");
            script(reader, writer);
        })
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}
