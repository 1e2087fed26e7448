#![allow(dead_code)]

//! Shared fixtures for integration tests: a recording sink, a protocol
//! harness that stands in for the connection during protocol-layer tests,
//! and loopback socket helpers.

use std::cell::RefCell;
use std::net::{TcpListener, TcpStream};
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use connwire::error::Error;
use connwire::protocol::{ProtocolLayer, ProtocolSink};
use connwire::reactor::{PollReactor, Reactor, SocketEvents};
use connwire::connection::ConnectionSink;
use connwire::socket::{Domain, NonBlockingSocket};
use connwire::tls::PeerCertificate;

/// Sink that records everything delivered to it.
#[derive(Default)]
pub struct RecordSink {
    pub data: Vec<u8>,
    pub connected: bool,
    pub secured: bool,
    pub peer_verified: Option<bool>,
    pub errors: Vec<Error>,
    pub sent_calls: usize,
}

impl ProtocolSink for RecordSink {
    fn on_data(&mut self, data: &[u8]) {
        self.data.extend_from_slice(data);
    }

    fn on_secure(&mut self, certificate: Option<&PeerCertificate>) {
        self.secured = true;
        self.peer_verified = certificate.map(|c| c.verified);
    }
}

impl ConnectionSink for RecordSink {
    fn on_connect(&mut self) {
        self.connected = true;
    }

    fn on_error(&mut self, error: Error) {
        self.errors.push(error);
    }

    fn on_sent(&mut self) {
        self.sent_calls += 1;
    }
}

/// Minimal owner for a `ProtocolLayer` in tests: receives the socket events
/// the connection orchestrator would normally receive and forwards them.
pub struct ProtoHarness {
    pub protocol: Option<ProtocolLayer>,
    pub sink: RecordSink,
    pub last_error: Option<Error>,
}

impl ProtoHarness {
    pub fn new(socket: NonBlockingSocket, reactor: Rc<dyn Reactor>) -> Rc<RefCell<Self>> {
        Rc::new_cyclic(|weak: &Weak<RefCell<Self>>| {
            let events: Weak<RefCell<dyn SocketEvents>> = weak.clone();
            RefCell::new(Self {
                protocol: Some(ProtocolLayer::new(socket, reactor, events)),
                sink: RecordSink::default(),
                last_error: None,
            })
        })
    }
}

impl SocketEvents for ProtoHarness {
    fn on_read_ready(&mut self) {
        if let Some(p) = self.protocol.as_mut() {
            if let Err(e) = p.on_readable(&mut self.sink) {
                self.last_error = Some(e);
            }
        }
    }

    fn on_write_ready(&mut self) {
        if let Some(p) = self.protocol.as_mut() {
            if let Err(e) = p.on_writable(&mut self.sink) {
                self.last_error = Some(e);
            }
        }
    }

    fn on_exception(&mut self) {}
}

/// A connected non-blocking socket plus its blocking peer.
pub fn connected_pair() -> (NonBlockingSocket, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("listener");
    let addr = listener.local_addr().expect("addr");
    let mut socket = NonBlockingSocket::stream(Domain::IPV4).expect("socket");
    let start = socket.connect(&addr);
    assert!(start.accepted, "loopback connect refused");
    let (peer, _) = listener.accept().expect("accept");
    let deadline = Instant::now() + Duration::from_secs(2);
    while socket.peer_addr().is_none() {
        assert!(Instant::now() < deadline, "connect did not settle");
        std::thread::sleep(Duration::from_millis(5));
    }
    (socket, peer)
}

/// Pump the reactor until `cond` holds or `timeout` passes.
pub fn pump_until(reactor: &PollReactor, timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        reactor.turn(Duration::from_millis(20));
    }
    cond()
}
