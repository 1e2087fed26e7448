//! Pluggable TLS engine interface and the rustls-backed implementation
//!
//! The protocol layer treats TLS as an opaque engine that consumes and
//! produces socket bytes through a plain io object and reports progress with
//! a small result enum. [`RustlsEngine`] is the stock implementation;
//! profile names are resolved to rustls configuration by an explicit,
//! injected [`TlsContext`] rather than a process-wide singleton.

mod context;
mod engine;

pub use context::{TlsContext, TlsProfile};
pub use engine::RustlsEngine;

use std::io;

/// Five-way progress report from the TLS engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsStatus {
    /// The operation completed.
    Ok,
    /// The engine needs more bytes from the socket before it can continue.
    NeedsRead,
    /// The engine has pending bytes the socket would not accept yet.
    NeedsWrite,
    /// Hard engine failure; the session is unusable.
    Failed,
    /// The operation completed and the engine already holds further decoded
    /// data; keep draining without waiting for another socket event. Never
    /// reported for writes.
    More,
}

/// The transport the engine pulls records from and pushes records to.
/// Would-block must surface as `io::ErrorKind::WouldBlock`.
pub trait TlsIo: io::Read + io::Write {}

impl<T: io::Read + io::Write> TlsIo for T {}

/// Printable peer certificate summary plus the verification outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerCertificate {
    /// Human-readable certificate description (subject, issuer, validity).
    pub text: String,
    /// Whether the peer verified against the profile's trust roots.
    pub verified: bool,
}

/// Opaque per-connection TLS protocol object.
pub trait TlsEngine {
    /// Drive the client side of the handshake one step.
    fn connect(&mut self, io: &mut dyn TlsIo) -> TlsStatus;

    /// Drive the server side of the handshake one step.
    fn accept(&mut self, io: &mut dyn TlsIo) -> TlsStatus;

    /// Decode plaintext into `buf`. The returned count is valid for
    /// [`TlsStatus::Ok`] and [`TlsStatus::More`].
    fn read(&mut self, io: &mut dyn TlsIo, buf: &mut [u8]) -> (TlsStatus, usize);

    /// Encrypt and flush as much of `data` as possible. The returned count
    /// is how many plaintext bytes the engine consumed. An empty `data`
    /// asks the engine to flush records it already holds.
    fn write(&mut self, io: &mut dyn TlsIo, data: &[u8]) -> (TlsStatus, usize);

    /// The peer certificate, once the handshake has completed.
    fn peer_certificate(&self) -> Option<PeerCertificate>;
}
