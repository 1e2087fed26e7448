//! End-to-end connection establishment against real loopback listeners:
//! literal targets, asynchronous resolution, SOCKS4 negotiation, TLS
//! handshake deadlines and teardown.

mod common;

use std::cell::RefCell;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener};
use std::rc::Rc;
use std::time::{Duration, Instant};

use connwire::config::ConnectConfig;
use connwire::connection::{Connection, ConnectionState};
use connwire::error::Error;
use connwire::monitor::{ConnectionInfo, ConnectionMonitor};
use connwire::reactor::{PollReactor, Reactor};
use connwire::resolver::{AsyncResolver, Location, ResolveCallback, Resolver};
use connwire::tls::TlsContext;

use common::{pump_until, RecordSink};

/// Resolver that must never be consulted. Literal targets bypass
/// resolution entirely.
struct PanicResolver;

impl Resolver for PanicResolver {
    fn resolve(&self, location: &mut Location) -> Result<(), String> {
        panic!("resolver consulted for {location}");
    }
}

/// Asynchronous resolver double: answers with a fixed address (or a fixed
/// failure) on the next reactor turn, never inline.
struct FixedAsyncResolver {
    reactor: Rc<PollReactor>,
    answer: Result<SocketAddr, String>,
}

impl AsyncResolver for FixedAsyncResolver {
    fn start(&self, mut location: Location, done: ResolveCallback) {
        let answer = self.answer.clone();
        self.reactor.defer(Box::new(move || match answer {
            Ok(addr) => {
                location.merge_resolved(addr);
                done(Ok(location));
            }
            Err(msg) => done(Err(msg)),
        }));
    }
}

fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("listener");
    listener.local_addr().expect("addr").port()
    // Dropped here; nothing listens on the port afterwards.
}

type Conn = Rc<RefCell<Connection<RecordSink>>>;

fn literal_connection(reactor: Rc<PollReactor>, port: u16, config: ConnectConfig) -> Conn {
    Connection::new(
        reactor,
        Rc::new(PanicResolver),
        Location::new("127.0.0.1", port),
        config,
        RecordSink::default(),
    )
}

#[test]
fn test_literal_target_connects_without_resolver() {
    let reactor = Rc::new(PollReactor::new());
    let listener = TcpListener::bind("127.0.0.1:0").expect("listener");
    let port = listener.local_addr().expect("addr").port();

    let conn = literal_connection(reactor.clone(), port, ConnectConfig::default());
    conn.borrow_mut().connect().expect("connect");
    assert_eq!(conn.borrow().state(), ConnectionState::Connecting);

    let connected = pump_until(&reactor, Duration::from_secs(5), || {
        conn.borrow().state() == ConnectionState::Connected
    });
    assert!(connected, "never reached the data phase");
    assert!(conn.borrow().sink().connected);
    assert!(conn.borrow().sink().errors.is_empty());
}

#[test]
fn test_connect_while_active_is_rejected() {
    let reactor = Rc::new(PollReactor::new());
    let listener = TcpListener::bind("127.0.0.1:0").expect("listener");
    let port = listener.local_addr().expect("addr").port();

    let conn = literal_connection(reactor, port, ConnectConfig::default());
    conn.borrow_mut().connect().expect("connect");
    let second = conn.borrow_mut().connect();
    match second {
        Err(Error::Contract(_)) => {}
        other => panic!("expected contract violation, got {other:?}"),
    }
}

#[test]
fn test_refused_connect_reports_cannot_connect_to() {
    let reactor = Rc::new(PollReactor::new());
    let port = free_port();

    let conn = literal_connection(reactor.clone(), port, ConnectConfig::default());
    // Loopback refusal may surface inline or on a later reactor turn. Bind
    // the result first so no borrow is held while the reactor pumps.
    let submitted = conn.borrow_mut().connect();
    match submitted {
        Err(e) => assert!(e.to_string().contains("cannot connect to")),
        Ok(()) => {
            let failed = pump_until(&reactor, Duration::from_secs(5), || {
                !conn.borrow().sink().errors.is_empty()
            });
            assert!(failed, "refusal never reported");
            let guard = conn.borrow();
            let error = &guard.sink().errors[0];
            assert!(error.is_connect_failure(), "unexpected error {error:?}");
            assert!(error.to_string().contains("cannot connect to"));
        }
    }
    assert_eq!(conn.borrow().state(), ConnectionState::Idle);
    assert!(!conn.borrow().sink().connected);
}

#[test]
fn test_async_resolution_connects_on_a_later_turn() {
    let reactor = Rc::new(PollReactor::new());
    let listener = TcpListener::bind("127.0.0.1:0").expect("listener");
    let addr = listener.local_addr().expect("addr");

    let conn = Connection::new(
        reactor.clone(),
        Rc::new(PanicResolver),
        Location::new("irc.example.net", addr.port()),
        ConnectConfig::default(),
        RecordSink::default(),
    );
    conn.borrow_mut().set_async_resolver(Rc::new(FixedAsyncResolver {
        reactor: reactor.clone(),
        answer: Ok(addr),
    }));

    conn.borrow_mut().connect().expect("connect");
    assert_eq!(conn.borrow().state(), ConnectionState::Resolving);

    let connected = pump_until(&reactor, Duration::from_secs(5), || {
        conn.borrow().state() == ConnectionState::Connected
    });
    assert!(connected, "never reached the data phase");
    assert!(conn.borrow().sink().connected);
}

#[test]
fn test_resolution_failure_surfaces_as_dns_error() {
    let reactor = Rc::new(PollReactor::new());

    let conn = Connection::new(
        reactor.clone(),
        Rc::new(PanicResolver),
        Location::new("irc.example.net", 6667),
        ConnectConfig::default(),
        RecordSink::default(),
    );
    conn.borrow_mut().set_async_resolver(Rc::new(FixedAsyncResolver {
        reactor: reactor.clone(),
        answer: Err("no such host".to_string()),
    }));

    conn.borrow_mut().connect().expect("connect");
    let failed = pump_until(&reactor, Duration::from_secs(2), || {
        !conn.borrow().sink().errors.is_empty()
    });
    assert!(failed);
    let guard = conn.borrow();
    match &guard.sink().errors[0] {
        Error::Dns(msg) => assert_eq!(msg, "no such host"),
        other => panic!("expected DNS error, got {other:?}"),
    }
    assert_eq!(guard.state(), ConnectionState::Idle);
}

#[test]
fn test_send_before_connect_is_not_connected() {
    let reactor = Rc::new(PollReactor::new());
    let conn = literal_connection(reactor, 6667, ConnectConfig::default());
    let result = conn.borrow_mut().send(b"too early");
    match result {
        Err(Error::NotConnected) => {}
        other => panic!("expected NotConnected, got {other:?}"),
    }
}

#[test]
fn test_close_returns_to_idle_and_allows_reconnect() {
    let reactor = Rc::new(PollReactor::new());
    let listener = TcpListener::bind("127.0.0.1:0").expect("listener");
    let port = listener.local_addr().expect("addr").port();

    let conn = literal_connection(reactor.clone(), port, ConnectConfig::default());
    conn.borrow_mut().connect().expect("connect");
    pump_until(&reactor, Duration::from_secs(5), || {
        conn.borrow().state() == ConnectionState::Connected
    });

    conn.borrow_mut().close();
    assert_eq!(conn.borrow().state(), ConnectionState::Idle);

    conn.borrow_mut().connect().expect("reconnect");
    let connected = pump_until(&reactor, Duration::from_secs(5), || {
        conn.borrow().state() == ConnectionState::Connected
    });
    assert!(connected, "reconnect never completed");
}

/// Monitor double recording registry traffic.
#[derive(Default)]
struct RecordingMonitor {
    registered: RefCell<Vec<ConnectionInfo>>,
    unregistered: RefCell<Vec<u64>>,
}

impl ConnectionMonitor for RecordingMonitor {
    fn register(&self, info: ConnectionInfo) {
        self.registered.borrow_mut().push(info);
    }

    fn unregister(&self, id: u64) {
        self.unregistered.borrow_mut().push(id);
    }
}

#[test]
fn test_monitor_sees_register_and_unregister() {
    let reactor = Rc::new(PollReactor::new());
    let listener = TcpListener::bind("127.0.0.1:0").expect("listener");
    let port = listener.local_addr().expect("addr").port();

    let monitor = Rc::new(RecordingMonitor::default());
    let conn = literal_connection(reactor.clone(), port, ConnectConfig::default());
    conn.borrow_mut().set_monitor(monitor.clone());
    conn.borrow_mut().connect().expect("connect");
    let connected = pump_until(&reactor, Duration::from_secs(5), || {
        conn.borrow().state() == ConnectionState::Connected
    });
    assert!(connected);

    let id = {
        let registered = monitor.registered.borrow();
        assert_eq!(registered.len(), 1);
        assert!(registered[0].peer.is_some());
        registered[0].id
    };
    assert!(monitor.unregistered.borrow().is_empty());

    conn.borrow_mut().close();
    assert_eq!(monitor.unregistered.borrow().as_slice(), &[id]);
}

#[test]
fn test_close_cancels_pending_connect_delay_timer() {
    let reactor = Rc::new(PollReactor::new());
    let listener = TcpListener::bind("127.0.0.1:0").expect("listener");
    let port = listener.local_addr().expect("addr").port();

    let config = ConnectConfig {
        test_connect_delay: Some(Duration::from_secs(30)),
        ..ConnectConfig::default()
    };
    let conn = literal_connection(reactor.clone(), port, config);
    conn.borrow_mut().connect().expect("connect");
    let held = pump_until(&reactor, Duration::from_secs(5), || {
        conn.borrow().state() == ConnectionState::Testing
    });
    assert!(held, "delay never held the connection in Testing");
    assert_eq!(reactor.armed_timers(), 1);

    // A stale timer surviving close could complete a later reconnect
    // prematurely.
    conn.borrow_mut().close();
    assert_eq!(reactor.armed_timers(), 0);
    assert_eq!(conn.borrow().state(), ConnectionState::Idle);
}

#[test]
fn test_connect_delay_passes_through_testing_state() {
    let reactor = Rc::new(PollReactor::new());
    let listener = TcpListener::bind("127.0.0.1:0").expect("listener");
    let port = listener.local_addr().expect("addr").port();

    let config = ConnectConfig {
        test_connect_delay: Some(Duration::from_millis(150)),
        ..ConnectConfig::default()
    };
    let conn = literal_connection(reactor.clone(), port, config);
    let started = Instant::now();
    conn.borrow_mut().connect().expect("connect");

    let mut saw_testing = false;
    let connected = pump_until(&reactor, Duration::from_secs(5), || {
        let state = conn.borrow().state();
        if state == ConnectionState::Testing {
            saw_testing = true;
        }
        state == ConnectionState::Connected
    });
    assert!(connected);
    assert!(saw_testing, "delay never held the connection in Testing");
    assert!(started.elapsed() >= Duration::from_millis(150));
}

/// SOCKS4 server double: validates nothing, records the full request,
/// answers with `reply`, then echoes one exchange when granted.
fn spawn_socks_server(
    listener: TcpListener,
    reply: [u8; 8],
) -> std::thread::JoinHandle<(Vec<u8>, Vec<u8>)> {
    std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept");
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("timeout");

        // Fixed 8-byte header, then two NUL-terminated strings (userid and
        // the 4a hostname).
        let mut request = Vec::new();
        let mut byte = [0u8; 1];
        let mut nuls = 0;
        while request.len() < 8 || nuls < 2 {
            stream.read_exact(&mut byte).expect("request byte");
            if request.len() >= 8 && byte[0] == 0 {
                nuls += 1;
            }
            request.push(byte[0]);
        }

        stream.write_all(&reply).expect("reply");
        if reply[1] != 0x5A {
            return (request, Vec::new());
        }

        let mut data = vec![0u8; 4];
        stream.read_exact(&mut data).expect("tunnel data");
        stream.write_all(b"PONG").expect("tunnel reply");
        (request, data)
    })
}

#[test]
fn test_socks_granted_then_data_phase() {
    let reactor = Rc::new(PollReactor::new());
    let listener = TcpListener::bind("127.0.0.1:0").expect("listener");
    let port = listener.local_addr().expect("addr").port();
    let server = spawn_socks_server(listener, [0, 0x5A, 0, 0, 0, 0, 0, 0]);

    let conn = Connection::new(
        reactor.clone(),
        Rc::new(PanicResolver),
        Location::via_socks("127.0.0.1", port, "target.example.net", 6667),
        ConnectConfig::default(),
        RecordSink::default(),
    );
    conn.borrow_mut().connect().expect("connect");

    let connected = pump_until(&reactor, Duration::from_secs(5), || {
        conn.borrow().state() == ConnectionState::Connected
    });
    assert!(connected, "tunnel never established");

    conn.borrow_mut().send(b"PING").expect("send");
    assert_eq!(conn.borrow().sink().sent_calls, 1);
    let answered = pump_until(&reactor, Duration::from_secs(5), || {
        conn.borrow().sink().data == b"PONG"
    });
    assert!(answered, "no tunnel data came back");

    conn.borrow_mut().close();
    let (request, data) = server.join().expect("server thread");
    assert_eq!(data, b"PING");

    // Version 4, CONNECT, destination port in network byte order, the
    // 0.0.0.1 sentinel, empty userid, then the hostname.
    assert_eq!(&request[..2], &[0x04, 0x01]);
    assert_eq!(&request[2..4], &6667u16.to_be_bytes());
    assert_eq!(&request[4..8], &[0, 0, 0, 1]);
    assert_eq!(request[8], 0);
    assert_eq!(&request[9..], b"target.example.net\0");
}

#[test]
fn test_socks_rejection_surfaces_as_socks_error() {
    let reactor = Rc::new(PollReactor::new());
    let listener = TcpListener::bind("127.0.0.1:0").expect("listener");
    let port = listener.local_addr().expect("addr").port();
    let server = spawn_socks_server(listener, [0, 0x5B, 0, 0, 0, 0, 0, 0]);

    let conn = Connection::new(
        reactor.clone(),
        Rc::new(PanicResolver),
        Location::via_socks("127.0.0.1", port, "target.example.net", 6667),
        ConnectConfig::default(),
        RecordSink::default(),
    );
    conn.borrow_mut().connect().expect("connect");

    let failed = pump_until(&reactor, Duration::from_secs(5), || {
        !conn.borrow().sink().errors.is_empty()
    });
    assert!(failed, "rejection never reported");
    {
        let guard = conn.borrow();
        match &guard.sink().errors[0] {
            Error::Socks(msg) => assert!(msg.contains("rejected")),
            other => panic!("expected SOCKS error, got {other:?}"),
        }
        assert_eq!(guard.state(), ConnectionState::Idle);
        assert!(!guard.sink().connected);
    }
    server.join().expect("server thread");
}

#[test]
fn test_socks_reply_arriving_in_fragments() {
    let reactor = Rc::new(PollReactor::new());
    let listener = TcpListener::bind("127.0.0.1:0").expect("listener");
    let port = listener.local_addr().expect("addr").port();

    let server = std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept");
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("timeout");
        let mut request = Vec::new();
        let mut byte = [0u8; 1];
        let mut nuls = 0;
        while request.len() < 8 || nuls < 2 {
            stream.read_exact(&mut byte).expect("request byte");
            if request.len() >= 8 && byte[0] == 0 {
                nuls += 1;
            }
            request.push(byte[0]);
        }
        // Split the 8-byte reply to force reassembly on the client.
        stream.write_all(&[0, 0x5A, 0]).expect("reply head");
        std::thread::sleep(Duration::from_millis(120));
        stream.write_all(&[0, 0, 0, 0, 0]).expect("reply tail");
        std::thread::sleep(Duration::from_millis(200));
    });

    let conn = Connection::new(
        reactor.clone(),
        Rc::new(PanicResolver),
        Location::via_socks("127.0.0.1", port, "target.example.net", 6667),
        ConnectConfig::default(),
        RecordSink::default(),
    );
    conn.borrow_mut().connect().expect("connect");

    let connected = pump_until(&reactor, Duration::from_secs(5), || {
        conn.borrow().state() == ConnectionState::Connected
    });
    assert!(connected, "fragmented reply never completed");
    conn.borrow_mut().close();
    server.join().expect("server thread");
}

#[test]
fn test_tls_handshake_deadline_fires_secure_timeout() {
    let reactor = Rc::new(PollReactor::new());
    let listener = TcpListener::bind("127.0.0.1:0").expect("listener");
    let port = listener.local_addr().expect("addr").port();

    // A peer that accepts and reads but never answers the handshake.
    let server = std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept");
        stream
            .set_read_timeout(Some(Duration::from_millis(50)))
            .expect("timeout");
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut buf = [0u8; 4096];
        while Instant::now() < deadline {
            match stream.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(_) => break,
            }
        }
    });

    let config = ConnectConfig {
        secure_handshake_timeout: Some(Duration::from_millis(250)),
        ..ConnectConfig::default()
    };
    let conn = literal_connection(reactor.clone(), port, config);
    conn.borrow_mut().set_tls_context(Rc::new(TlsContext::new()));
    conn.borrow_mut().connect().expect("connect");

    let connected = pump_until(&reactor, Duration::from_secs(5), || {
        conn.borrow().state() == ConnectionState::Connected
    });
    assert!(connected, "TCP phase never completed");

    conn.borrow_mut().ssl_connect().expect("ssl_connect");
    let timed_out = pump_until(&reactor, Duration::from_secs(5), || {
        !conn.borrow().sink().errors.is_empty()
    });
    assert!(timed_out, "deadline never fired");
    {
        let guard = conn.borrow();
        assert!(
            guard.sink().errors[0].is_secure_timeout(),
            "unexpected error {:?}",
            guard.sink().errors[0]
        );
        assert_eq!(guard.state(), ConnectionState::Idle);
    }
    // Our side is closed; the server's read loop ends on EOF.
    server.join().expect("server thread");
}
