//! Client connection establishment and data-phase orchestration
//!
//! Sequences resolution, TCP connect, optional SOCKS4 negotiation and an
//! optional TLS handshake before handing off to the protocol layer for
//! application I/O. Driven entirely by reactor events; the only blocking
//! path is the explicit synchronous-DNS opt-in.

pub mod socks;

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use socket2::Domain;

use crate::config::ConnectConfig;
use crate::error::{Error, Result};
use crate::monitor::{ConnectionInfo, ConnectionMonitor};
use crate::protocol::{Position, ProtocolLayer, ProtocolSink, SegmentList, SendOutcome};
use crate::reactor::{Handler, Reactor, SocketEvents, TimerToken};
use crate::resolver::{AsyncResolver, Location, Resolver};
use crate::socket::NonBlockingSocket;
use crate::tls::TlsContext;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Connection lifecycle state. Exactly one is active at a time; `Idle`
/// holds only before `connect()` and after `close()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Resolving,
    Connecting,
    Testing,
    Socksing,
    Connected,
}

/// Application-side callbacks. `on_sent` is the overridable post-send hook
/// for response-timeout bookkeeping.
pub trait ConnectionSink: ProtocolSink {
    /// The data phase has begun (post-SOCKS, post-TLS where applicable).
    fn on_connect(&mut self);
    /// The connection failed or was torn down by the peer. The connection
    /// is already closed when this fires.
    fn on_error(&mut self, error: Error);
    /// Invoked after every successful `send` submission.
    fn on_sent(&mut self) {}
}

/// Client-facing connection state machine.
///
/// Lives in an `Rc<RefCell<..>>` so it can register itself as the event
/// handler for its own descriptor. All methods are called on the reactor
/// thread; sink callbacks run inside event dispatch and must not re-enter
/// the connection synchronously; use [`Reactor::defer`] from a callback
/// instead.
pub struct Connection<S: ConnectionSink + 'static> {
    id: u64,
    reactor: Rc<dyn Reactor>,
    resolver: Rc<dyn Resolver>,
    async_resolver: Option<Rc<dyn AsyncResolver>>,
    tls: Option<Rc<TlsContext>>,
    monitor: Option<Rc<dyn ConnectionMonitor>>,
    config: ConnectConfig,
    location: Location,
    state: ConnectionState,
    protocol: Option<ProtocolLayer>,
    sink: S,
    self_handle: Weak<RefCell<Self>>,
    connect_addr: Option<SocketAddr>,
    socks_buf: Vec<u8>,
    handshake_timer: Option<TimerToken>,
    delay_timer: Option<TimerToken>,
    delay_done: bool,
    warned_loopback_source: bool,
}

impl<S: ConnectionSink + 'static> Connection<S> {
    pub fn new(
        reactor: Rc<dyn Reactor>,
        resolver: Rc<dyn Resolver>,
        location: Location,
        config: ConnectConfig,
        sink: S,
    ) -> Rc<RefCell<Self>> {
        Rc::new_cyclic(|weak| {
            RefCell::new(Self {
                id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
                reactor,
                resolver,
                async_resolver: None,
                tls: None,
                monitor: None,
                config,
                location,
                state: ConnectionState::Idle,
                protocol: None,
                sink,
                self_handle: weak.clone(),
                connect_addr: None,
                socks_buf: Vec::with_capacity(socks::REPLY_LEN),
                handshake_timer: None,
                delay_timer: None,
                delay_done: false,
                warned_loopback_source: false,
            })
        })
    }

    /// Install an asynchronous resolver; without one (or with the
    /// synchronous-DNS opt-in) resolution blocks the `connect()` caller.
    pub fn set_async_resolver(&mut self, resolver: Rc<dyn AsyncResolver>) {
        self.async_resolver = Some(resolver);
    }

    /// Install the TLS profile registry used by [`Connection::ssl_connect`].
    pub fn set_tls_context(&mut self, context: Rc<TlsContext>) {
        self.tls = Some(context);
    }

    /// Install an optional connection monitor registry.
    pub fn set_monitor(&mut self, monitor: Rc<dyn ConnectionMonitor>) {
        self.monitor = Some(monitor);
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    #[must_use]
    pub fn location(&self) -> &Location {
        &self.location
    }

    #[must_use]
    pub fn sink(&self) -> &S {
        &self.sink
    }

    #[must_use]
    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    /// Reporting handle for the monitor registry.
    #[must_use]
    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            peer: self
                .protocol
                .as_ref()
                .and_then(|p| p.socket().peer_addr())
                .or(self.connect_addr),
            secure: self.protocol.as_ref().is_some_and(ProtocolLayer::is_secure),
            bytes_sent: self.protocol.as_ref().map_or(0, ProtocolLayer::bytes_sent),
            bytes_received: self
                .protocol
                .as_ref()
                .map_or(0, ProtocolLayer::bytes_received),
        }
    }

    /// Start establishing the connection.
    ///
    /// A literal `host:port` target skips the resolver entirely. With an
    /// asynchronous resolver installed the call returns immediately in
    /// `Resolving`; otherwise resolution blocks inline.
    pub fn connect(&mut self) -> Result<()> {
        if self.state != ConnectionState::Idle {
            return Err(Error::Contract("connect() while connection is active"));
        }
        self.delay_done = false;
        if self.location.resolved().is_none() {
            if let Some(addr) = self.location.literal_address() {
                // Resolve trivially.
                self.location.merge_resolved(addr);
            } else if !self.config.synchronous_dns && self.async_resolver.is_some() {
                let resolver = match self.async_resolver.clone() {
                    Some(r) => r,
                    None => return Err(Error::Contract("async resolver disappeared")),
                };
                self.state = ConnectionState::Resolving;
                tracing::debug!("resolving {}", self.location);
                let weak = self.self_handle.clone();
                resolver.start(
                    self.location.clone(),
                    Box::new(move |result| {
                        if let Some(conn) = weak.upgrade() {
                            conn.borrow_mut().resolver_finished(result);
                        }
                    }),
                );
                return Ok(());
            } else {
                self.resolver
                    .resolve(&mut self.location)
                    .map_err(Error::Dns)?;
            }
        }
        self.begin_connect().inspect_err(|_| {
            self.state = ConnectionState::Idle;
        })
    }

    fn resolver_finished(&mut self, result: std::result::Result<Location, String>) {
        if self.state != ConnectionState::Resolving {
            // Closed while the lookup was in flight.
            return;
        }
        match result {
            Ok(location) => {
                self.location = location;
                self.state = ConnectionState::Idle;
                if let Err(e) = self.begin_connect() {
                    self.state = ConnectionState::Idle;
                    self.fail(e);
                }
            }
            Err(msg) => {
                self.state = ConnectionState::Idle;
                self.sink.on_error(Error::Dns(msg));
            }
        }
    }

    fn begin_connect(&mut self) -> Result<()> {
        let addr = match self.location.resolved() {
            Some(addr) => addr,
            None => return Err(Error::Dns("resolution produced no address".into())),
        };
        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let mut socket = NonBlockingSocket::stream(domain)?;
        if self.config.tcp_nodelay {
            socket.set_nodelay(true);
        }
        if let Some(src) = self.config.source_address {
            if src.ip().is_loopback() && !addr.ip().is_loopback() && !self.warned_loopback_source {
                self.warned_loopback_source = true;
                tracing::warn!("binding loopback source {src} while connecting to {addr}");
            }
            socket.bind(&src)?;
        }

        tracing::debug!("connecting to {addr}");
        let start = socket.connect(&addr);
        if !start.accepted {
            return Err(Error::Connect(format!(
                "cannot connect to {addr}: {}",
                socket.last_error_message()
            )));
        }

        let fd = socket.descriptor();
        let events: Weak<RefCell<dyn SocketEvents>> = self.self_handle.clone();
        self.protocol = Some(ProtocolLayer::new(socket, self.reactor.clone(), events));
        self.connect_addr = Some(addr);
        self.state = ConnectionState::Connecting;

        let handler = match self.handler() {
            Some(h) => h,
            None => return Err(Error::Contract("connection is not owned by an Rc")),
        };
        self.reactor.add_exception_handler(fd, &handler);
        if start.immediate {
            // Never complete a connect inside the call that requested it;
            // process it on the next reactor turn instead.
            tracing::debug!("immediate connect to {addr}, deferring completion");
            let weak = self.self_handle.clone();
            self.reactor.defer(Box::new(move || {
                if let Some(conn) = weak.upgrade() {
                    conn.borrow_mut().on_write_ready();
                }
            }));
        } else {
            self.reactor.add_write_handler(fd, &handler);
        }
        if let Some(monitor) = &self.monitor {
            monitor.register(self.info());
        }
        Ok(())
    }

    fn complete_tcp_connect(&mut self) {
        let (fd, peer) = match self.protocol.as_ref() {
            Some(p) => (p.descriptor(), p.socket().peer_addr()),
            None => return,
        };
        match peer {
            None => {
                let addr = self
                    .connect_addr
                    .map_or_else(|| self.location.to_string(), |a| a.to_string());
                let reason = self
                    .protocol
                    .as_mut()
                    .and_then(|p| p.socket_mut().take_pending_error())
                    .map_or_else(|| "connection failed".to_string(), |e| e.to_string());
                self.fail(Error::Connect(format!("cannot connect to {addr}: {reason}")));
            }
            Some(peer) => {
                tracing::debug!("connected to {peer}");
                self.reactor.drop_write_handler(fd);
                let handler = match self.handler() {
                    Some(h) => h,
                    None => return,
                };
                self.reactor.add_read_handler(fd, &handler);
                if self.location.far_end().is_some() {
                    self.start_socks();
                } else {
                    self.finish_connect();
                }
            }
        }
    }

    fn start_socks(&mut self) {
        let (host, port) = match self.location.far_end() {
            Some((h, p)) => (h.to_string(), p),
            None => return,
        };
        self.state = ConnectionState::Socksing;
        self.socks_buf.clear();
        let request = socks::encode_request(&host, port);
        let written = match self.protocol.as_mut() {
            Some(p) => p.socket_mut().send(&request),
            None => None,
        };
        match written {
            Some(n) if n == request.len() => {
                tracing::debug!("SOCKS4 request for {host}:{port} sent");
            }
            _ => {
                // The request is tiny; a fresh socket that cannot take it in
                // one write is not worth a flow-control retry.
                self.fail(Error::Socks(
                    "could not write SOCKS4 request in one call".into(),
                ));
            }
        }
    }

    fn read_socks_reply(&mut self) {
        let mut chunk = [0u8; socks::REPLY_LEN];
        let need = socks::REPLY_LEN - self.socks_buf.len();
        let got = match self.protocol.as_mut() {
            Some(p) => p.socket_mut().recv(&mut chunk[..need]),
            None => return,
        };
        match got {
            Some(0) => self.fail(Error::Socks(
                "proxy closed connection during negotiation".into(),
            )),
            Some(n) => {
                self.socks_buf.extend_from_slice(&chunk[..n]);
                match socks::parse_reply(&self.socks_buf) {
                    socks::Reply::Incomplete => {}
                    socks::Reply::Granted => {
                        tracing::debug!("SOCKS4 tunnel established");
                        self.finish_connect();
                    }
                    socks::Reply::Rejected(code) => self.fail(Error::Socks(format!(
                        "proxy rejected connection (code 0x{code:02X})"
                    ))),
                    socks::Reply::Malformed(byte) => self.fail(Error::Socks(format!(
                        "malformed SOCKS4 reply (leading byte 0x{byte:02X})"
                    ))),
                }
            }
            None => {
                let transient = self
                    .protocol
                    .as_ref()
                    .is_some_and(|p| p.socket().would_block());
                if !transient {
                    let msg = self
                        .protocol
                        .as_ref()
                        .map_or_else(|| "socket gone".to_string(), |p| {
                            p.socket().last_error_message()
                        });
                    self.fail(Error::Socks(format!("reply read failed: {msg}")));
                }
            }
        }
    }

    fn finish_connect(&mut self) {
        self.state = ConnectionState::Connected;
        self.sink.on_connect();
    }

    /// Send a single buffer through the protocol layer.
    pub fn send(&mut self, data: &[u8]) -> Result<SendOutcome> {
        if self.state != ConnectionState::Connected {
            return Err(Error::NotConnected);
        }
        let result = match self.protocol.as_mut() {
            Some(p) => p.send(data),
            None => Err(Error::NotConnected),
        };
        self.after_send(result)
    }

    /// Send a scatter/gather payload. Raw mode only.
    pub fn send_segments(&mut self, segments: SegmentList, start: Position) -> Result<SendOutcome> {
        if self.state != ConnectionState::Connected {
            return Err(Error::NotConnected);
        }
        let result = match self.protocol.as_mut() {
            Some(p) => p.send_segments(segments, start),
            None => Err(Error::NotConnected),
        };
        self.after_send(result)
    }

    fn after_send(&mut self, result: Result<SendOutcome>) -> Result<SendOutcome> {
        match result {
            Ok(outcome) => {
                self.sink.on_sent();
                Ok(outcome)
            }
            Err(e) => {
                // Contract violations ("still busy") leave the connection
                // alone; a failed layer means the transport is gone.
                if self.protocol.as_ref().is_some_and(ProtocolLayer::is_failed) {
                    self.close();
                }
                Err(e)
            }
        }
    }

    /// Upgrade the established connection to TLS using the configured
    /// profile. Requires the connection to be established already.
    pub fn ssl_connect(&mut self) -> Result<()> {
        if self.state != ConnectionState::Connected {
            return Err(Error::NotConnected);
        }
        let context = match self.tls.as_ref() {
            Some(c) => c,
            None => return Err(Error::Contract("no TLS context configured")),
        };
        let profile = self
            .config
            .tls_profile
            .clone()
            .unwrap_or_else(|| "default".to_string());
        // Behind a SOCKS proxy the far end is the logical peer to verify.
        let server_name = self
            .location
            .far_end()
            .map_or_else(|| self.location.host().to_string(), |(h, _)| h.to_string());
        let engine = context.client_engine(&profile, &server_name)?;

        let result = match self.protocol.as_mut() {
            Some(p) => p.ssl_connect(Box::new(engine), &mut self.sink),
            None => Err(Error::NotConnected),
        };
        if let Err(e) = result {
            self.close();
            return Err(e);
        }
        if self
            .protocol
            .as_ref()
            .is_some_and(ProtocolLayer::is_handshaking)
        {
            if let Some(delay) = self.config.secure_handshake_timeout {
                let weak = self.self_handle.clone();
                let token = self.reactor.schedule(
                    delay,
                    Box::new(move || {
                        if let Some(conn) = weak.upgrade() {
                            conn.borrow_mut().secure_timeout_fired();
                        }
                    }),
                );
                self.handshake_timer = Some(token);
            }
        }
        Ok(())
    }

    fn secure_timeout_fired(&mut self) {
        self.handshake_timer = None;
        if self
            .protocol
            .as_ref()
            .is_some_and(ProtocolLayer::is_handshaking)
        {
            tracing::warn!("secure handshake deadline passed");
            self.fail(Error::SecureConnectionTimeout);
        }
    }

    /// Tear the connection down, releasing the protocol layer and socket
    /// and deregistering every event-handler interest.
    pub fn close(&mut self) {
        if let Some(p) = self.protocol.as_mut() {
            let fd = p.descriptor();
            p.release();
            self.reactor.drop_read_handler(fd);
            self.reactor.drop_write_handler(fd);
            self.reactor.drop_exception_handler(fd);
        }
        self.protocol = None;
        if let Some(token) = self.handshake_timer.take() {
            self.reactor.cancel(token);
        }
        if let Some(token) = self.delay_timer.take() {
            self.reactor.cancel(token);
        }
        if self.state != ConnectionState::Idle {
            if let Some(monitor) = &self.monitor {
                monitor.unregister(self.id);
            }
        }
        self.state = ConnectionState::Idle;
        self.socks_buf.clear();
    }

    fn fail(&mut self, error: Error) {
        self.close();
        self.sink.on_error(error);
    }

    fn handler(&self) -> Option<Handler> {
        let rc = self.self_handle.upgrade()?;
        let handler: Handler = rc;
        Some(handler)
    }

    fn forward_read(&mut self) {
        let result = match self.protocol.as_mut() {
            Some(p) => p.on_readable(&mut self.sink),
            None => Ok(()),
        };
        self.after_protocol_event(result);
    }

    fn forward_write(&mut self) {
        let result = match self.protocol.as_mut() {
            Some(p) => p.on_writable(&mut self.sink),
            None => Ok(()),
        };
        self.after_protocol_event(result);
    }

    fn after_protocol_event(&mut self, result: Result<()>) {
        if let Err(e) = result {
            self.fail(e);
            return;
        }
        if let Some(token) = self.handshake_timer {
            if self.protocol.as_ref().is_some_and(ProtocolLayer::is_secure) {
                self.reactor.cancel(token);
                self.handshake_timer = None;
            }
        }
    }

    fn timer_complete_connect(&mut self) {
        self.delay_timer = None;
        if self.state == ConnectionState::Testing {
            self.state = ConnectionState::Connecting;
            self.complete_tcp_connect();
        }
    }
}

impl<S: ConnectionSink + 'static> SocketEvents for Connection<S> {
    fn on_write_ready(&mut self) {
        match self.state {
            ConnectionState::Connecting => {
                if let Some(delay) = self.config.test_connect_delay {
                    if !self.delay_done {
                        // Test hook: hold the completion back for a while.
                        self.delay_done = true;
                        self.state = ConnectionState::Testing;
                        let weak = self.self_handle.clone();
                        let token = self.reactor.schedule(
                            delay,
                            Box::new(move || {
                                if let Some(conn) = weak.upgrade() {
                                    conn.borrow_mut().timer_complete_connect();
                                }
                            }),
                        );
                        self.delay_timer = Some(token);
                        return;
                    }
                }
                self.complete_tcp_connect();
            }
            ConnectionState::Connected => self.forward_write(),
            _ => {}
        }
    }

    fn on_read_ready(&mut self) {
        match self.state {
            ConnectionState::Socksing => self.read_socks_reply(),
            ConnectionState::Connected => self.forward_read(),
            _ => {}
        }
    }

    fn on_exception(&mut self) {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Testing => {
                let addr = self
                    .connect_addr
                    .map_or_else(|| self.location.to_string(), |a| a.to_string());
                let reason = self
                    .protocol
                    .as_mut()
                    .and_then(|p| p.socket_mut().take_pending_error())
                    .map_or_else(|| "connection failed".to_string(), |e| e.to_string());
                self.fail(Error::Connect(format!("cannot connect to {addr}: {reason}")));
            }
            ConnectionState::Socksing => {
                self.fail(Error::Socks("socket exception during negotiation".into()));
            }
            ConnectionState::Connected => {
                self.fail(Error::Read("socket exception".into()));
            }
            _ => {}
        }
    }
}
