//! rustls-backed TLS engine
//!
//! Translates rustls's wants_read/wants_write/process_new_packets model into
//! the engine's five-way status. All socket traffic goes through the io
//! object handed in per call; the engine itself never owns the descriptor.

use std::io::{self, Read, Write};

use rustls::{ClientConnection, ServerConnection};
use x509_parser::prelude::FromDer;

use super::{PeerCertificate, TlsEngine, TlsIo, TlsStatus};

enum Session {
    Client(ClientConnection),
    Server(ServerConnection),
}

/// Per-connection TLS protocol object over rustls.
pub struct RustlsEngine {
    session: Session,
    verified: bool,
}

macro_rules! with_session {
    ($self:expr, $conn:ident => $body:expr) => {
        match &mut $self.session {
            Session::Client($conn) => $body,
            Session::Server($conn) => $body,
        }
    };
}

macro_rules! with_session_ref {
    ($self:expr, $conn:ident => $body:expr) => {
        match &$self.session {
            Session::Client($conn) => $body,
            Session::Server($conn) => $body,
        }
    };
}

impl RustlsEngine {
    pub(crate) fn client(conn: ClientConnection, verified: bool) -> Self {
        Self {
            session: Session::Client(conn),
            verified,
        }
    }

    pub(crate) fn server(conn: ServerConnection) -> Self {
        Self {
            session: Session::Server(conn),
            verified: false,
        }
    }

    fn wants_write(&self) -> bool {
        with_session_ref!(self, c => c.wants_write())
    }

    fn wants_read(&self) -> bool {
        with_session_ref!(self, c => c.wants_read())
    }

    fn is_handshaking(&self) -> bool {
        with_session_ref!(self, c => c.is_handshaking())
    }

    fn write_tls(&mut self, io: &mut dyn TlsIo) -> io::Result<usize> {
        with_session!(self, c => c.write_tls(&mut IoAdapter(io)))
    }

    fn read_tls(&mut self, io: &mut dyn TlsIo) -> io::Result<usize> {
        with_session!(self, c => c.read_tls(&mut IoAdapter(io)))
    }

    fn process(&mut self) -> Result<(), rustls::Error> {
        with_session!(self, c => c.process_new_packets().map(|_| ()))
    }

    fn read_plaintext(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        with_session!(self, c => c.reader().read(buf))
    }

    fn write_plaintext(&mut self, data: &[u8]) -> io::Result<usize> {
        with_session!(self, c => c.writer().write(data))
    }

    /// Flush pending TLS records to the socket. Returns `None` when fully
    /// flushed, `Some(status)` when blocked or failed.
    fn flush_records(&mut self, io: &mut dyn TlsIo) -> Option<TlsStatus> {
        while self.wants_write() {
            match self.write_tls(io) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Some(TlsStatus::NeedsWrite);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    tracing::debug!("TLS record write failed: {e}");
                    return Some(TlsStatus::Failed);
                }
            }
        }
        None
    }

    fn drive_handshake(&mut self, io: &mut dyn TlsIo) -> TlsStatus {
        loop {
            if let Some(blocked) = self.flush_records(io) {
                return blocked;
            }
            if !self.is_handshaking() {
                return TlsStatus::Ok;
            }
            if !self.wants_read() {
                // Nothing to write, nothing to read, still handshaking:
                // should not happen with a well-formed session.
                return TlsStatus::Failed;
            }
            match self.read_tls(io) {
                Ok(0) => {
                    tracing::debug!("peer closed during TLS handshake");
                    return TlsStatus::Failed;
                }
                Ok(_) => {
                    if let Err(e) = self.process() {
                        tracing::debug!("TLS handshake failed: {e}");
                        // Flush the alert if the socket will take it.
                        let _ = self.flush_records(io);
                        return TlsStatus::Failed;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return TlsStatus::NeedsRead;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    tracing::debug!("TLS record read failed: {e}");
                    return TlsStatus::Failed;
                }
            }
        }
    }
}

impl TlsEngine for RustlsEngine {
    fn connect(&mut self, io: &mut dyn TlsIo) -> TlsStatus {
        debug_assert!(matches!(self.session, Session::Client(_)));
        self.drive_handshake(io)
    }

    fn accept(&mut self, io: &mut dyn TlsIo) -> TlsStatus {
        debug_assert!(matches!(self.session, Session::Server(_)));
        self.drive_handshake(io)
    }

    fn read(&mut self, io: &mut dyn TlsIo, buf: &mut [u8]) -> (TlsStatus, usize) {
        // Already-decoded plaintext first; it will never be announced by
        // another socket event.
        match self.read_plaintext(buf) {
            Ok(0) => return (TlsStatus::Failed, 0),
            Ok(n) if n == buf.len() => return (TlsStatus::More, n),
            Ok(n) => return (TlsStatus::Ok, n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                tracing::debug!("TLS plaintext read failed: {e}");
                return (TlsStatus::Failed, 0);
            }
        }
        match self.read_tls(io) {
            Ok(0) => return (TlsStatus::Failed, 0),
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                return (TlsStatus::NeedsRead, 0);
            }
            Err(e) => {
                tracing::debug!("TLS record read failed: {e}");
                return (TlsStatus::Failed, 0);
            }
        }
        if let Err(e) = self.process() {
            tracing::debug!("TLS record decode failed: {e}");
            return (TlsStatus::Failed, 0);
        }
        match self.read_plaintext(buf) {
            Ok(0) => (TlsStatus::Failed, 0),
            Ok(n) if n == buf.len() => (TlsStatus::More, n),
            Ok(n) => (TlsStatus::Ok, n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => (TlsStatus::NeedsRead, 0),
            Err(e) => {
                tracing::debug!("TLS plaintext read failed: {e}");
                (TlsStatus::Failed, 0)
            }
        }
    }

    fn write(&mut self, io: &mut dyn TlsIo, data: &[u8]) -> (TlsStatus, usize) {
        let consumed = match self.write_plaintext(data) {
            Ok(n) => n,
            Err(e) => {
                tracing::debug!("TLS plaintext write failed: {e}");
                return (TlsStatus::Failed, 0);
            }
        };
        match self.flush_records(io) {
            None => (TlsStatus::Ok, consumed),
            Some(status) => (status, consumed),
        }
    }

    fn peer_certificate(&self) -> Option<PeerCertificate> {
        let der = with_session_ref!(self, c => c.peer_certificates())?.first()?;
        let text = match x509_parser::certificate::X509Certificate::from_der(der.as_ref()) {
            Ok((_, cert)) => format!(
                "subject: {}\nissuer: {}\nserial: {}\nnot before: {}\nnot after: {}",
                cert.subject(),
                cert.issuer(),
                cert.raw_serial_as_string(),
                cert.validity().not_before,
                cert.validity().not_after,
            ),
            Err(e) => format!("unparsable certificate: {e}"),
        };
        Some(PeerCertificate {
            text,
            verified: self.verified,
        })
    }
}

// rustls wants a concrete io::Read/Write value; wrap the dyn reference.
struct IoAdapter<'a>(&'a mut dyn TlsIo);

impl Read for IoAdapter<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl Write for IoAdapter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}
