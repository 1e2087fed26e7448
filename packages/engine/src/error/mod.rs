//! Error types surfaced by the connection engine
//!
//! Transient transport conditions (would-block, connect-in-progress) never
//! appear here; they are absorbed by the socket and protocol layers and turn
//! into readiness registrations instead. Everything in this enum is fatal
//! for the connection it was raised on.

/// A Result alias where the Err case is `connwire::Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while establishing or using a connection.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Opening or configuring the underlying socket failed.
    #[error("socket error: {0}")]
    Socket(#[from] std::io::Error),
    /// Binding a local address failed or the family did not match.
    #[error("bind error: {0}")]
    Bind(String),
    /// No connection to the peer could be established.
    ///
    /// The message always starts with `cannot connect to <address>` so log
    /// filters can key on it.
    #[error("{0}")]
    Connect(String),
    /// Name resolution failed.
    #[error("DNS error: {0}")]
    Dns(String),
    /// SOCKS4 proxy negotiation failed.
    #[error("SOCKS error: {0}")]
    Socks(String),
    /// Accepting an inbound connection failed.
    #[error("accept error: {0}")]
    Accept(String),
    /// The peer went away or the transport failed while reading.
    #[error("read error: {0}")]
    Read(String),
    /// A payload could not be delivered.
    #[error("send error: {0}")]
    Send(String),
    /// The TLS handshake did not complete within the configured deadline.
    #[error("secure connection timed out")]
    SecureConnectionTimeout,
    /// An operation was attempted with no live socket.
    #[error("not connected")]
    NotConnected,
    /// The caller violated an API contract (for example calling `send`
    /// while a previous send is still in flight).
    #[error("contract violated: {0}")]
    Contract(&'static str),
}

impl Error {
    /// True for errors raised by the TLS handshake deadline.
    #[must_use]
    pub fn is_secure_timeout(&self) -> bool {
        matches!(self, Error::SecureConnectionTimeout)
    }

    /// True when the error means the connection never came up at all.
    #[must_use]
    pub fn is_connect_failure(&self) -> bool {
        matches!(self, Error::Connect(_) | Error::Dns(_) | Error::Socks(_))
    }
}
