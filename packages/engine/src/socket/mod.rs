//! Exception-free non-blocking socket wrapper
//!
//! Owns one descriptor, keeps it in non-blocking mode from the moment it is
//! opened, and classifies low-level failures instead of surfacing them as
//! errors: callers branch on [`NonBlockingSocket::would_block`],
//! [`NonBlockingSocket::in_progress`] and [`NonBlockingSocket::msg_too_big`]
//! to decide between retry and fatal handling.

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::fd::AsRawFd;

use socket2::{Protocol, SockAddr, Socket, Type};
pub use socket2::Domain;

use crate::error::{Error, Result};
use crate::reactor::Descriptor;

/// Outcome of a connect submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectStart {
    /// False when the request was refused before any syscall (family
    /// mismatch) or the OS rejected it outright.
    pub accepted: bool,
    /// True when the connection completed synchronously, typical for
    /// loopback targets. The completion must still be processed on a later
    /// reactor turn, never inline.
    pub immediate: bool,
}

/// A freshly accepted connection plus its peer address.
pub struct AcceptPair {
    pub socket: NonBlockingSocket,
    pub peer: SocketAddr,
}

/// Thin wrapper over a platform socket handle.
///
/// The descriptor is owned by exactly one `NonBlockingSocket` and becomes
/// invalid when the wrapper is dropped.
pub struct NonBlockingSocket {
    inner: Socket,
    domain: Domain,
    stream: bool,
    last_error: Option<io::Error>,
}

impl NonBlockingSocket {
    /// Open a non-blocking stream socket for the given domain.
    ///
    /// Keep-alive and no-linger are essential here; failure to apply either
    /// is fatal. Fails with [`Error::Socket`] if the OS open call fails.
    pub fn stream(domain: Domain) -> Result<Self> {
        let inner = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        inner.set_nonblocking(true)?;
        inner.set_keepalive(true)?;
        inner.set_linger(None)?;
        Ok(Self {
            inner,
            domain,
            stream: true,
            last_error: None,
        })
    }

    /// Open a non-blocking datagram socket for the given domain.
    pub fn datagram(domain: Domain) -> Result<Self> {
        let inner = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        inner.set_nonblocking(true)?;
        Ok(Self {
            inner,
            domain,
            stream: false,
            last_error: None,
        })
    }

    /// Wrap an already-open handle (an accepted connection), forcing it into
    /// non-blocking mode.
    pub fn from_accepted(inner: Socket, domain: Domain) -> Result<Self> {
        inner.set_nonblocking(true)?;
        inner.set_keepalive(true)?;
        inner.set_linger(None)?;
        Ok(Self {
            inner,
            domain,
            stream: true,
            last_error: None,
        })
    }

    /// The raw descriptor, for readiness registration with the reactor.
    #[must_use]
    pub fn descriptor(&self) -> Descriptor {
        self.inner.as_raw_fd()
    }

    #[must_use]
    pub fn is_stream(&self) -> bool {
        self.stream
    }

    fn family_matches(&self, addr: &SocketAddr) -> bool {
        if self.domain == Domain::IPV4 {
            addr.is_ipv4()
        } else if self.domain == Domain::IPV6 {
            addr.is_ipv6()
        } else {
            false
        }
    }

    /// Bind a local address. Fails with [`Error::Bind`] on family mismatch
    /// or if the OS bind call fails. Address-reuse is advisory: a failure to
    /// set it is logged and ignored.
    pub fn bind(&mut self, addr: &SocketAddr) -> Result<()> {
        if !self.family_matches(addr) {
            return Err(Error::Bind(format!(
                "address family of {addr} does not match socket domain"
            )));
        }
        if let Err(e) = self.inner.set_reuse_address(true) {
            tracing::warn!("could not set SO_REUSEADDR: {e}");
        }
        if addr.is_ipv6() {
            if let Err(e) = self.inner.set_only_v6(false) {
                tracing::warn!("could not clear IPV6_V6ONLY: {e}");
            }
        }
        self.inner
            .bind(&SockAddr::from(*addr))
            .map_err(|e| Error::Bind(format!("cannot bind {addr}: {e}")))
    }

    /// Non-throwing bind variant.
    pub fn try_bind(&mut self, addr: &SocketAddr) -> bool {
        self.bind(addr).is_ok()
    }

    /// Submit a connect. Never blocks.
    ///
    /// A family mismatch is refused before any syscall. `immediate` is set
    /// when the connect completed synchronously; the normal TCP case leaves
    /// the connection in progress and the caller waits for write-readiness.
    pub fn connect(&mut self, addr: &SocketAddr) -> ConnectStart {
        if !self.family_matches(addr) {
            return ConnectStart {
                accepted: false,
                immediate: false,
            };
        }
        match self.inner.connect(&SockAddr::from(*addr)) {
            Ok(()) => ConnectStart {
                accepted: true,
                immediate: true,
            },
            Err(e) if is_in_progress(&e) || is_would_block(&e) => ConnectStart {
                accepted: true,
                immediate: false,
            },
            Err(e) => {
                self.last_error = Some(e);
                ConnectStart {
                    accepted: false,
                    immediate: false,
                }
            }
        }
    }

    /// Start listening for inbound connections (stream sockets only).
    pub fn listen(&mut self, backlog: i32) -> Result<()> {
        self.inner.listen(backlog).map_err(Error::Socket)
    }

    /// Accept one pending inbound connection.
    pub fn accept(&mut self) -> Result<AcceptPair> {
        let (raw, peer) = self
            .inner
            .accept()
            .map_err(|e| Error::Accept(e.to_string()))?;
        let peer = peer
            .as_socket()
            .ok_or_else(|| Error::Accept("peer has no inet address".into()))?;
        let socket = Self::from_accepted(raw, self.domain)?;
        Ok(AcceptPair { socket, peer })
    }

    /// Write bytes, returning how many the OS accepted.
    ///
    /// `None` means no progress; consult [`Self::would_block`] and
    /// [`Self::msg_too_big`] for the reason. A zero-length write is a no-op.
    pub fn send(&mut self, buf: &[u8]) -> Option<usize> {
        if buf.is_empty() {
            return Some(0);
        }
        match self.inner.write(buf) {
            Ok(n) => {
                self.last_error = None;
                Some(n)
            }
            Err(e) => {
                self.last_error = Some(e);
                None
            }
        }
    }

    /// Read bytes into `buf`, returning how many arrived. `Some(0)` means
    /// the peer performed an orderly shutdown. A zero-length read is a
    /// no-op. `None` follows the same classification as [`Self::send`].
    pub fn recv(&mut self, buf: &mut [u8]) -> Option<usize> {
        if buf.is_empty() {
            return Some(0);
        }
        match self.inner.read(buf) {
            Ok(n) => {
                self.last_error = None;
                Some(n)
            }
            Err(e) => {
                self.last_error = Some(e);
                None
            }
        }
    }

    /// The locally bound address, if any.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr().ok().and_then(|a| a.as_socket())
    }

    /// The connected peer address. `None` while no connection exists, which
    /// is also how a failed asynchronous connect is detected.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer_addr().ok().and_then(|a| a.as_socket())
    }

    /// Advisory: disable Nagle's algorithm. Failure is logged, not fatal.
    pub fn set_nodelay(&mut self, nodelay: bool) {
        if let Err(e) = self.inner.set_tcp_nodelay(nodelay) {
            tracing::warn!("could not set TCP_NODELAY: {e}");
        }
    }

    /// True when the last failed operation would have blocked and should be
    /// retried on a later readiness event.
    #[must_use]
    pub fn would_block(&self) -> bool {
        self.last_error.as_ref().is_some_and(is_would_block)
    }

    /// True when the last failed operation reported a connect in progress.
    #[must_use]
    pub fn in_progress(&self) -> bool {
        self.last_error.as_ref().is_some_and(is_in_progress)
    }

    /// True when the last failed operation was a datagram exceeding the
    /// maximum message size.
    #[must_use]
    pub fn msg_too_big(&self) -> bool {
        self.last_error
            .as_ref()
            .and_then(io::Error::raw_os_error)
            .is_some_and(|code| code == libc::EMSGSIZE)
    }

    /// Drain the socket's pending error (SO_ERROR), falling back to the
    /// last captured operation error. Used to explain failed asynchronous
    /// connects.
    pub fn take_pending_error(&mut self) -> Option<io::Error> {
        self.inner
            .take_error()
            .ok()
            .flatten()
            .or_else(|| self.last_error.take())
    }

    /// Human-readable description of the last captured OS error.
    #[must_use]
    pub fn last_error_message(&self) -> String {
        match &self.last_error {
            Some(e) => e.to_string(),
            None => "no error".to_string(),
        }
    }
}

// The TLS engine drives the descriptor through plain io traits; would-block
// surfaces as io::ErrorKind::WouldBlock there and is classified by the
// engine itself.
impl Read for NonBlockingSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Write for NonBlockingSocket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

fn is_would_block(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    ) || e
        .raw_os_error()
        .is_some_and(|code| code == libc::EAGAIN || code == libc::EWOULDBLOCK || code == libc::EINTR)
}

fn is_in_progress(e: &io::Error) -> bool {
    e.raw_os_error().is_some_and(|code| code == libc::EINPROGRESS)
}
