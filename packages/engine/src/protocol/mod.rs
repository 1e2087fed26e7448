//! Half-duplex raw/TLS protocol layer
//!
//! Sits on one non-blocking socket and provides a uniform send/deliver
//! interface whether or not TLS is active. All partial-I/O bookkeeping lives
//! here: the pending-send cursor for raw flow control, the outgoing TLS
//! buffer, and the decode drain loop for records the engine has already
//! buffered.

pub mod segments;

pub use segments::{Position, SegmentList};

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use bytes::{Buf, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::reactor::{Descriptor, Reactor, SocketEvents};
use crate::socket::NonBlockingSocket;
use crate::tls::{PeerCertificate, TlsEngine, TlsStatus};

/// Upper bound on engine decode rounds per read event. Guards against an
/// engine that keeps reporting `More` without making progress.
const MAX_DECODE_ROUNDS: usize = 64;

/// Receive chunk size for raw reads and TLS plaintext.
const RECV_CHUNK: usize = 0x4000;

/// Protocol layer state. `Raw` is both the initial state and the terminal
/// one if TLS is never requested; `TlsIdle` is the steady state once a TLS
/// session is established.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolState {
    Raw,
    TlsConnecting,
    TlsAccepting,
    TlsWriting,
    TlsIdle,
}

/// Result of a send call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Every byte was handed to the OS.
    Complete,
    /// Flow control asserted; the layer kept the unsent tail and will
    /// finish on later write-ready events.
    Pending,
}

/// Receiver of decoded application data and TLS session notifications.
pub trait ProtocolSink {
    /// One chunk of plaintext arrived.
    fn on_data(&mut self, data: &[u8]);
    /// A TLS session is established. `None` when the peer presented no
    /// certificate.
    fn on_secure(&mut self, certificate: Option<&PeerCertificate>);
}

struct PendingSend {
    segments: SegmentList,
    pos: Position,
}

/// Half-duplex protocol layer over one socket.
pub struct ProtocolLayer {
    socket: NonBlockingSocket,
    reactor: Rc<dyn Reactor>,
    events: Weak<RefCell<dyn SocketEvents>>,
    state: ProtocolState,
    pending: Option<PendingSend>,
    engine: Option<Box<dyn TlsEngine>>,
    tls_out: BytesMut,
    recv_buf: Vec<u8>,
    write_registered: bool,
    failed: bool,
    secure: bool,
    bytes_sent: u64,
    bytes_received: u64,
}

impl ProtocolLayer {
    pub fn new(
        socket: NonBlockingSocket,
        reactor: Rc<dyn Reactor>,
        events: Weak<RefCell<dyn SocketEvents>>,
    ) -> Self {
        Self {
            socket,
            reactor,
            events,
            state: ProtocolState::Raw,
            pending: None,
            engine: None,
            tls_out: BytesMut::new(),
            recv_buf: vec![0u8; RECV_CHUNK],
            write_registered: false,
            failed: false,
            secure: false,
            bytes_sent: 0,
            bytes_received: 0,
        }
    }

    #[must_use]
    pub fn state(&self) -> ProtocolState {
        self.state
    }

    #[must_use]
    pub fn descriptor(&self) -> Descriptor {
        self.socket.descriptor()
    }

    #[must_use]
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    #[must_use]
    pub fn is_handshaking(&self) -> bool {
        matches!(
            self.state,
            ProtocolState::TlsConnecting | ProtocolState::TlsAccepting
        )
    }

    /// True once a fatal transport or engine error has been recorded; the
    /// layer refuses further work after that.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    #[must_use]
    pub fn has_pending_send(&self) -> bool {
        self.pending.is_some()
            || !self.tls_out.is_empty()
            || self.state == ProtocolState::TlsWriting
    }

    #[must_use]
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    #[must_use]
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    /// Direct socket access for the connection-establishment phase (SOCKS
    /// negotiation happens below the protocol layer).
    pub fn socket_mut(&mut self) -> &mut NonBlockingSocket {
        &mut self.socket
    }

    #[must_use]
    pub fn socket(&self) -> &NonBlockingSocket {
        &self.socket
    }

    /// Send one logical payload described as scatter/gather segments,
    /// starting at `start`. Raw mode only; the restriction that this is not
    /// available over TLS is deliberate.
    pub fn send_segments(&mut self, segments: SegmentList, mut start: Position) -> Result<SendOutcome> {
        if self.state != ProtocolState::Raw {
            return Err(Error::Send(
                "scatter/gather send is not supported over TLS".into(),
            ));
        }
        if self.failed {
            return Err(Error::Send("protocol layer already failed".into()));
        }
        if self.pending.is_some() {
            return Err(Error::Send("still busy sending previous data".into()));
        }
        start.normalize(&segments);
        self.pending = Some(PendingSend {
            segments,
            pos: start,
        });
        self.pump_raw()
    }

    /// Send a single buffer. In raw mode the caller's buffer does not need
    /// to outlive the call: only the unsent tail is copied, and only when
    /// flow control interrupts the send.
    pub fn send(&mut self, data: &[u8]) -> Result<SendOutcome> {
        if self.failed {
            return Err(Error::Send("protocol layer already failed".into()));
        }
        match self.state {
            ProtocolState::Raw => self.send_raw(data),
            ProtocolState::TlsIdle => {
                self.tls_out.extend_from_slice(data);
                self.state = ProtocolState::TlsWriting;
                self.pump_tls_write()
            }
            ProtocolState::TlsWriting => {
                Err(Error::Send("still busy sending previous data".into()))
            }
            ProtocolState::TlsConnecting | ProtocolState::TlsAccepting => {
                Err(Error::Send("TLS handshake in progress".into()))
            }
        }
    }

    fn send_raw(&mut self, data: &[u8]) -> Result<SendOutcome> {
        if self.pending.is_some() {
            return Err(Error::Send("still busy sending previous data".into()));
        }
        let mut off = 0;
        loop {
            if off == data.len() {
                return Ok(SendOutcome::Complete);
            }
            match self.socket.send(&data[off..]) {
                Some(n) => {
                    self.bytes_sent += n as u64;
                    let short = n < data.len() - off;
                    off += n;
                    if short {
                        self.stash_tail(&data[off..]);
                        return Ok(SendOutcome::Pending);
                    }
                }
                None if self.socket.would_block() => {
                    self.stash_tail(&data[off..]);
                    return Ok(SendOutcome::Pending);
                }
                None => return Err(self.fail_send()),
            }
        }
    }

    fn stash_tail(&mut self, tail: &[u8]) {
        self.pending = Some(PendingSend {
            segments: vec![Bytes::copy_from_slice(tail)],
            pos: Position::default(),
        });
        self.set_write_interest(true);
    }

    fn fail_send(&mut self) -> Error {
        let msg = self.socket.last_error_message();
        self.pending = None;
        self.failed = true;
        self.set_write_interest(false);
        Error::Send(format!("write failed: {msg}"))
    }

    /// Resume or finish the recorded raw send from its cursor.
    fn pump_raw(&mut self) -> Result<SendOutcome> {
        enum Step {
            Done,
            Progress(usize),
            Short(usize),
            Blocked,
            Fatal,
        }
        loop {
            let step = match self.pending.as_mut() {
                None => Step::Done,
                Some(p) if p.pos.finished(&p.segments) => Step::Done,
                Some(p) => {
                    let chunk_len = p.segments[p.pos.segment].len() - p.pos.offset;
                    let sent = {
                        let seg = &p.segments[p.pos.segment];
                        self.socket.send(&seg[p.pos.offset..])
                    };
                    match sent {
                        Some(n) => {
                            p.pos.advance(&p.segments, n);
                            if n == chunk_len {
                                Step::Progress(n)
                            } else {
                                Step::Short(n)
                            }
                        }
                        None if self.socket.would_block() => Step::Blocked,
                        None => Step::Fatal,
                    }
                }
            };
            match step {
                Step::Done => {
                    self.pending = None;
                    self.set_write_interest(false);
                    return Ok(SendOutcome::Complete);
                }
                Step::Progress(n) => {
                    self.bytes_sent += n as u64;
                }
                Step::Short(n) => {
                    self.bytes_sent += n as u64;
                    self.set_write_interest(true);
                    return Ok(SendOutcome::Pending);
                }
                Step::Blocked => {
                    self.set_write_interest(true);
                    return Ok(SendOutcome::Pending);
                }
                Step::Fatal => return Err(self.fail_send()),
            }
        }
    }

    /// Drive the TLS send until the engine reports completion. The layer
    /// stays in `TlsWriting` while the engine is blocked, even once all
    /// plaintext has been consumed: the engine may still hold encrypted
    /// records the socket would not accept, and only an `Ok` with an empty
    /// outgoing buffer means every byte is on the wire.
    fn pump_tls_write(&mut self) -> Result<SendOutcome> {
        loop {
            let (status, consumed) = match self.engine.as_mut() {
                Some(engine) => engine.write(&mut self.socket, &self.tls_out),
                None => return Err(Error::Contract("TLS write without an engine")),
            };
            self.bytes_sent += consumed as u64;
            self.tls_out.advance(consumed);
            match status {
                // Engines do not report More on write; treat it like Ok.
                TlsStatus::Ok | TlsStatus::More => {
                    if self.tls_out.is_empty() {
                        self.state = ProtocolState::TlsIdle;
                        self.set_write_interest(false);
                        return Ok(SendOutcome::Complete);
                    }
                    if consumed == 0 {
                        // No progress; wait for the socket rather than spin.
                        self.set_write_interest(true);
                        return Ok(SendOutcome::Pending);
                    }
                }
                TlsStatus::NeedsWrite => {
                    self.set_write_interest(true);
                    return Ok(SendOutcome::Pending);
                }
                TlsStatus::NeedsRead => {
                    // Renegotiation wants socket bytes; read-readiness is
                    // always registered, so just wait.
                    self.set_write_interest(false);
                    return Ok(SendOutcome::Pending);
                }
                TlsStatus::Failed => {
                    self.failed = true;
                    self.tls_out.clear();
                    self.set_write_interest(false);
                    return Err(Error::Send("TLS engine write failed".into()));
                }
            }
        }
    }

    /// Ask the engine to flush records it already holds, without submitting
    /// new plaintext. Used when a read-path operation left the engine
    /// blocked on the socket.
    fn flush_engine(&mut self) -> Result<()> {
        let status = match self.engine.as_mut() {
            Some(engine) => engine.write(&mut self.socket, &[]).0,
            None => {
                self.set_write_interest(false);
                return Ok(());
            }
        };
        match status {
            TlsStatus::NeedsWrite => {
                self.set_write_interest(true);
                Ok(())
            }
            TlsStatus::Failed => {
                self.failed = true;
                Err(Error::Send("TLS engine write failed".into()))
            }
            _ => {
                self.set_write_interest(false);
                Ok(())
            }
        }
    }

    /// Switch from raw passthrough to a client-side TLS handshake.
    pub fn ssl_connect(
        &mut self,
        engine: Box<dyn TlsEngine>,
        sink: &mut dyn ProtocolSink,
    ) -> Result<()> {
        self.start_tls(engine, sink, ProtocolState::TlsConnecting)
    }

    /// Switch from raw passthrough to a server-side TLS handshake.
    pub fn ssl_accept(
        &mut self,
        engine: Box<dyn TlsEngine>,
        sink: &mut dyn ProtocolSink,
    ) -> Result<()> {
        self.start_tls(engine, sink, ProtocolState::TlsAccepting)
    }

    fn start_tls(
        &mut self,
        engine: Box<dyn TlsEngine>,
        sink: &mut dyn ProtocolSink,
        state: ProtocolState,
    ) -> Result<()> {
        if self.state != ProtocolState::Raw {
            return Err(Error::Contract("TLS already active on this connection"));
        }
        if self.pending.is_some() {
            return Err(Error::Contract("cannot start TLS with a send in flight"));
        }
        self.engine = Some(engine);
        self.state = state;
        self.drive_handshake(sink)
    }

    fn drive_handshake(&mut self, sink: &mut dyn ProtocolSink) -> Result<()> {
        let connecting = self.state == ProtocolState::TlsConnecting;
        let status = match self.engine.as_mut() {
            Some(engine) => {
                if connecting {
                    engine.connect(&mut self.socket)
                } else {
                    engine.accept(&mut self.socket)
                }
            }
            None => return Err(Error::Contract("TLS handshake without an engine")),
        };
        match status {
            TlsStatus::Ok => {
                self.state = ProtocolState::TlsIdle;
                self.secure = true;
                self.set_write_interest(false);
                let cert = self.engine.as_ref().and_then(|e| e.peer_certificate());
                tracing::debug!(verified = cert.as_ref().map(|c| c.verified), "TLS session established");
                sink.on_secure(cert.as_ref());
                Ok(())
            }
            TlsStatus::NeedsRead => {
                self.set_write_interest(false);
                Ok(())
            }
            TlsStatus::NeedsWrite => {
                self.set_write_interest(true);
                Ok(())
            }
            // Engines do not report More during handshakes.
            TlsStatus::More => Ok(()),
            TlsStatus::Failed => {
                self.failed = true;
                Err(Error::Read("TLS handshake failed".into()))
            }
        }
    }

    /// Write-readiness entry point, re-invoked by the reactor whenever a
    /// partially-completed operation registered interest.
    pub fn on_writable(&mut self, sink: &mut dyn ProtocolSink) -> Result<()> {
        match self.state {
            ProtocolState::Raw => {
                if self.pending.is_some() {
                    self.pump_raw().map(|_| ())
                } else {
                    self.set_write_interest(false);
                    Ok(())
                }
            }
            ProtocolState::TlsConnecting | ProtocolState::TlsAccepting => {
                self.drive_handshake(sink)
            }
            ProtocolState::TlsWriting => self.pump_tls_write().map(|_| ()),
            ProtocolState::TlsIdle => self.flush_engine(),
        }
    }

    /// Read-readiness entry point.
    pub fn on_readable(&mut self, sink: &mut dyn ProtocolSink) -> Result<()> {
        match self.state {
            ProtocolState::Raw => self.read_raw(sink),
            ProtocolState::TlsConnecting | ProtocolState::TlsAccepting => {
                self.drive_handshake(sink)
            }
            ProtocolState::TlsIdle | ProtocolState::TlsWriting => {
                self.read_tls(sink)?;
                // Socket bytes may be exactly what a blocked TLS write was
                // waiting for (renegotiation); resume it.
                if self.state == ProtocolState::TlsWriting {
                    self.pump_tls_write().map(|_| ())
                } else {
                    Ok(())
                }
            }
        }
    }

    fn read_raw(&mut self, sink: &mut dyn ProtocolSink) -> Result<()> {
        let got = self.socket.recv(self.recv_buf.as_mut_slice());
        match got {
            Some(0) => {
                self.failed = true;
                Err(Error::Read("connection closed by peer".into()))
            }
            Some(n) => {
                self.bytes_received += n as u64;
                sink.on_data(&self.recv_buf[..n]);
                Ok(())
            }
            None if self.socket.would_block() => Ok(()),
            None => {
                self.failed = true;
                Err(Error::Read(format!(
                    "read failed: {}",
                    self.socket.last_error_message()
                )))
            }
        }
    }

    fn read_tls(&mut self, sink: &mut dyn ProtocolSink) -> Result<()> {
        // `More` means the engine already decoded further plaintext; there
        // will be no additional socket event for it, so keep draining.
        for _ in 0..MAX_DECODE_ROUNDS {
            let (status, n) = match self.engine.as_mut() {
                Some(engine) => engine.read(&mut self.socket, self.recv_buf.as_mut_slice()),
                None => return Err(Error::Contract("TLS read without an engine")),
            };
            if n > 0 {
                self.bytes_received += n as u64;
                sink.on_data(&self.recv_buf[..n]);
            }
            match status {
                TlsStatus::Ok | TlsStatus::NeedsRead => return Ok(()),
                TlsStatus::More => {}
                TlsStatus::NeedsWrite => {
                    self.set_write_interest(true);
                    return Ok(());
                }
                TlsStatus::Failed => {
                    self.failed = true;
                    return Err(Error::Read("TLS read failed".into()));
                }
            }
        }
        self.failed = true;
        Err(Error::Read(
            "TLS engine did not settle after repeated decode rounds".into(),
        ))
    }

    /// Drop write interest and all buffered state. Called when the owning
    /// connection closes.
    pub fn release(&mut self) {
        self.set_write_interest(false);
        self.pending = None;
        self.tls_out.clear();
        self.engine = None;
    }

    fn set_write_interest(&mut self, on: bool) {
        if on == self.write_registered {
            return;
        }
        let fd = self.socket.descriptor();
        if on {
            if let Some(handler) = self.events.upgrade() {
                self.reactor.add_write_handler(fd, &handler);
                self.write_registered = true;
            }
        } else {
            self.reactor.drop_write_handler(fd);
            self.write_registered = false;
        }
    }
}
