mod common;

use std::net::TcpListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use common::*;
use graphrpc::frame::{ValueReader, CLOSE_PROTOCOL_ERROR};
use graphrpc::peer::{
    bind, BindConfig, CallFailure, CallMultiplexer, ConnectConfig, ConnectionState,
    DispatchTarget, PeerError, ServiceBinding,
};

#[test]
fn watchdog_fails_stalled_calls_and_blocks_new_ones_until_fed() {
    let server = TestServer::start("watchdog");
    let accepted = server.accept();

    let config = BindConfig {
        watchdog: Some(Duration::from_millis(200)),
        ..bind_config()
    };
    let (notices, _rx) = mpsc::channel();
    let endpoint = bind::<Calculator>(&server.address(), notices, &config).expect("bind");
    let _served = accepted.join().expect("server thread").expect("server accept");

    let fatal = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fatal);
    endpoint.multiplexer().set_fatal_handler(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    endpoint.multiplexer().feed_watchdog();
    let stalled = call_i32(endpoint.multiplexer(), STALL, &[]).expect("call should send");
    let started = Instant::now();
    match stalled.wait(WAIT) {
        Err(CallFailure::Local(PeerError::WatchdogExpired(timeout))) => {
            assert_eq!(timeout, Duration::from_millis(200));
        }
        other => panic!("expected watchdog expiry, got {other:?}"),
    }
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(fatal.load(Ordering::SeqCst) >= 1);

    assert!(matches!(
        call_i32(endpoint.multiplexer(), ADD, &[1, 2]),
        Err(PeerError::WatchdogExpired(_))
    ));
    // Expiry does not close the connection.
    assert!(endpoint.is_open());

    endpoint.multiplexer().feed_watchdog();
    let sum = call_i32(endpoint.multiplexer(), ADD, &[1, 2])
        .expect("fed watchdog should allow calls")
        .wait(WAIT)
        .expect("add should succeed");
    assert_eq!(sum, 3);
}

#[test]
fn server_close_fails_pending_calls_once() {
    let server = TestServer::start("srvclose");
    let accepted = server.accept();

    let (notices, _rx) = mpsc::channel();
    let endpoint = bind::<Calculator>(&server.address(), notices, &bind_config()).expect("bind");
    let served = accepted.join().expect("server thread").expect("server accept");

    let pending = call_i32(endpoint.multiplexer(), STALL, &[]).expect("call should send");
    // Make sure the stalled call reached the server before it closes.
    let sum = call_i32(endpoint.multiplexer(), ADD, &[0, 0])
        .expect("call should send")
        .wait(WAIT)
        .expect("add should succeed");
    assert_eq!(sum, 0);

    served.connection.close_with(1001, "server restarting");

    match pending.wait(WAIT) {
        Err(CallFailure::Local(PeerError::Closed { code, reason })) => {
            assert_eq!(code, 1001);
            assert_eq!(reason, "server restarting");
        }
        other => panic!("expected closed, got {other:?}"),
    }

    wait_until(|| !endpoint.is_open());
    assert_eq!(endpoint.connection().state(), ConnectionState::Closed);
    assert!(matches!(
        call_i32(endpoint.multiplexer(), ADD, &[1, 1]),
        Err(PeerError::Closed { code: 1001, .. })
    ));
}

#[test]
fn abrupt_disconnect_is_reported_as_an_error() {
    let server = TestServer::start("abrupt");
    let (seen_tx, seen_rx) = mpsc::channel();
    let crashed = server.accept_raw(move |mut reader, writer| {
        let call = reader.read_message().expect("call should arrive");
        let _ = seen_tx.send(call.payload.len());
        // Dropping both halves ends the stream without a close envelope.
        drop((reader, writer));
    });

    let (notices, _rx) = mpsc::channel();
    let endpoint = bind::<Calculator>(&server.address(), notices, &bind_config()).expect("bind");
    let pending = call_i32(endpoint.multiplexer(), STALL, &[]).expect("call should send");
    assert!(seen_rx.recv_timeout(WAIT).expect("server should see the call") > 0);
    crashed.join().expect("server thread should complete");

    match pending.wait(WAIT) {
        Err(CallFailure::Local(PeerError::Disconnected(_))) => {}
        other => panic!("expected disconnect, got {other:?}"),
    }
    wait_until(|| endpoint.connection().state() == ConnectionState::Errored);
    assert!(!endpoint.is_open());
    assert!(matches!(
        call_i32(endpoint.multiplexer(), ADD, &[1, 1]),
        Err(PeerError::Disconnected(_))
    ));
}

#[test]
fn malformed_reply_fails_only_its_own_call() {
    let server = TestServer::start("badreply");
    let accepted = server.accept();

    let (notices, _rx) = mpsc::channel();
    let endpoint = bind::<Calculator>(&server.address(), notices, &bind_config()).expect("bind");
    let _served = accepted.join().expect("server thread").expect("server accept");

    let other = call_i32(endpoint.multiplexer(), DEFER, &[5]).expect("call should send");
    let broken = call_i32(endpoint.multiplexer(), GARBAGE_REPLY, &[]).expect("call should send");

    assert!(matches!(
        broken.wait(WAIT),
        Err(CallFailure::Local(PeerError::Frame(_)))
    ));
    assert!(endpoint.is_open());
    assert_eq!(endpoint.multiplexer().pending_count(), 1);

    // Completing the deferred pair releases the first call too.
    let partner = call_i32(endpoint.multiplexer(), DEFER, &[6]).expect("call should send");
    assert_eq!(partner.wait(WAIT).expect("partner"), 6);
    assert_eq!(other.wait(WAIT).expect("other"), 5);
}

#[test]
fn undecodable_frame_closes_the_session_with_protocol_error() {
    let server = TestServer::start("poison");
    let accepted = server.accept();

    let (notices, _rx) = mpsc::channel();
    let endpoint = bind::<Calculator>(&server.address(), notices, &bind_config()).expect("bind");
    let served = accepted.join().expect("server thread").expect("server accept");

    let first = call_i32(endpoint.multiplexer(), STALL, &[]).expect("call should send");
    let second = call_i32(endpoint.multiplexer(), STALL, &[]).expect("call should send");

    // Version byte 0x7f is not a frame this runtime can read.
    served
        .connection
        .send(Bytes::from_static(&[0x7f, 0, 0, 0, 0, 0, 0, 0, 0, 0]))
        .expect("raw send should queue");

    for pending in [first, second] {
        match pending.wait(WAIT) {
            Err(CallFailure::Local(PeerError::Closed { code, .. })) => {
                assert_eq!(code, CLOSE_PROTOCOL_ERROR)
            }
            other => panic!("expected protocol close, got {other:?}"),
        }
    }

    wait_until(|| served.connection.state().is_terminal());
    wait_until(|| endpoint.connection().state() == ConnectionState::Errored);
    assert!(!endpoint.is_open());
}

#[test]
fn checksum_mismatch_is_rejected_without_retrying() {
    let server = TestServer::start("mismatch");
    let accepted = server.accept();

    let config = BindConfig {
        connect: ConnectConfig {
            timeout: Duration::from_secs(10),
            initial_backoff: Duration::from_secs(1),
            ..ConnectConfig::default()
        },
        ..bind_config()
    };

    let started = Instant::now();
    let (notices, _rx) = mpsc::channel();
    let result = bind::<StaleCalculator>(&server.address(), notices, &config);
    assert!(
        started.elapsed() < Duration::from_secs(1),
        "rejection must not back off"
    );
    match result {
        Err(PeerError::HandshakeRejected(reason)) => assert!(reason.contains("checksum")),
        Err(other) => panic!("expected rejection, got {other}"),
        Ok(_) => panic!("stale schema should be refused"),
    }

    assert!(matches!(
        accepted.join().expect("server thread"),
        Err(PeerError::HandshakeRejected(_))
    ));
}

#[test]
fn connect_gives_up_within_its_budget() {
    // Reserve a port, then free it so nothing is listening there.
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").expect("ephemeral port");
        listener.local_addr().expect("local addr").port()
    };

    let budget = Duration::from_millis(1500);
    let config = BindConfig {
        connect: ConnectConfig {
            timeout: budget,
            initial_backoff: Duration::from_millis(200),
            ..ConnectConfig::default()
        },
        ..bind_config()
    };

    let started = Instant::now();
    let (notices, _rx) = mpsc::channel();
    let result = bind::<Calculator>(&format!("tcp://127.0.0.1:{port}"), notices, &config);
    let elapsed = started.elapsed();

    // Budget plus one attempt (a refused loopback connect is near-instant).
    assert!(elapsed < budget + Duration::from_millis(500), "took {elapsed:?}");
    match result {
        Err(PeerError::ConnectFailed { attempts, .. }) => {
            // 0, 200, 600 and 1400ms, then the capped sleep runs out the budget.
            assert!(attempts.len() >= 3, "only {} attempts", attempts.len());
        }
        Err(other) => panic!("expected ConnectFailed, got {other}"),
        Ok(_) => panic!("nothing listens on port {port}"),
    }
}

#[test]
fn closing_from_the_fatal_handler_returns() {
    let server = TestServer::start("fatalclose");
    let accepted = server.accept();

    let config = BindConfig {
        watchdog: Some(Duration::from_millis(100)),
        ..bind_config()
    };
    let (notices, _rx) = mpsc::channel();
    let endpoint =
        Arc::new(bind::<Calculator>(&server.address(), notices, &config).expect("bind"));
    let _served = accepted.join().expect("server thread").expect("server accept");

    let (closed_tx, closed_rx) = mpsc::channel();
    let weak = Arc::downgrade(&endpoint);
    endpoint.multiplexer().set_fatal_handler(move |_| {
        if let Some(endpoint) = weak.upgrade() {
            endpoint.close();
        }
        let _ = closed_tx.send(());
    });

    endpoint.multiplexer().feed_watchdog();
    let stalled = call_i32(endpoint.multiplexer(), STALL, &[]).expect("call should send");
    closed_rx
        .recv_timeout(WAIT)
        .expect("close from the fatal handler should return");

    assert!(matches!(
        stalled.wait(WAIT),
        Err(CallFailure::Local(PeerError::WatchdogExpired(_)))
    ));
    assert!(!endpoint.is_open());
    assert_eq!(endpoint.connection().state(), ConnectionState::Closed);
}

struct PanickingNotices;

impl DispatchTarget for PanickingNotices {
    fn dispatch(
        &self,
        _method: i32,
        _callback_id: Option<i32>,
        _args: &mut ValueReader,
        _mux: &CallMultiplexer,
    ) -> graphrpc::peer::Result<()> {
        panic!("notice handler bug")
    }
}

struct BrokenCalculator;

impl ServiceBinding for BrokenCalculator {
    type Local = ();
    const CHECKSUM: Option<&'static str> = Some(CHECKSUM);

    fn dispatcher(_local: ()) -> Arc<dyn DispatchTarget> {
        Arc::new(PanickingNotices)
    }
}

#[test]
fn panicking_local_receiver_fails_the_session_promptly() {
    let server = TestServer::start("panicky");
    let accepted = server.accept();

    let endpoint = bind::<BrokenCalculator>(&server.address(), (), &bind_config()).expect("bind");
    let _served = accepted.join().expect("server thread").expect("server accept");

    let pending = call_i32(endpoint.multiplexer(), STALL, &[]).expect("call should send");
    endpoint
        .multiplexer()
        .invoke_fire_and_forget(NOTIFY_ME, |w| {
            w.write_str("hello");
            Ok(())
        })
        .expect("notify should send");

    let started = Instant::now();
    match pending.wait(WAIT) {
        Err(CallFailure::Local(PeerError::Closed { code, reason })) => {
            assert_eq!(code, CLOSE_PROTOCOL_ERROR);
            assert!(reason.contains("notice handler bug"), "{reason}");
        }
        other => panic!("expected protocol close, got {other:?}"),
    }
    assert!(started.elapsed() < Duration::from_secs(2));
    wait_until(|| endpoint.connection().state() == ConnectionState::Errored);
    assert!(!endpoint.is_open());
}

fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(5));
    }
}
