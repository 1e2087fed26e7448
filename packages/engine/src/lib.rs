//! # connwire
//!
//! Reactor-driven client connection engine: a non-blocking socket wrapper,
//! a half-duplex raw/TLS protocol layer on top of it, and a connection
//! state machine that sequences DNS resolution, TCP connect, optional
//! SOCKS4 proxy negotiation and an optional TLS handshake before handing
//! off to application read/write.
//!
//! ## Design
//!
//! - **Single-threaded, cooperative.** All state transitions happen inside
//!   callbacks invoked by an external event loop implementing [`reactor::Reactor`].
//!   Nothing blocks except the explicit synchronous-DNS opt-in.
//! - **Transient conditions are not errors.** Would-block and
//!   connect-in-progress are absorbed as readiness registrations; only
//!   unretryable failures surface as typed [`error::Error`] values, and the
//!   connection is left closed when they do.
//! - **Exactly-once byte streams.** Partial sends are resumed from a
//!   recorded cursor; whether a payload goes out in one write or across
//!   many write-ready retries, the peer observes an identical stream.
//!
//! ## Usage
//!
//! ```no_run
//! use std::rc::Rc;
//! use connwire::config::ConnectConfig;
//! use connwire::connection::{Connection, ConnectionSink};
//! use connwire::protocol::ProtocolSink;
//! use connwire::reactor::PollReactor;
//! use connwire::resolver::{GaiResolver, Location};
//! use connwire::tls::PeerCertificate;
//!
//! struct Printer;
//!
//! impl ProtocolSink for Printer {
//!     fn on_data(&mut self, data: &[u8]) {
//!         println!("<- {} bytes", data.len());
//!     }
//!     fn on_secure(&mut self, cert: Option<&PeerCertificate>) {
//!         println!("secure: {:?}", cert.map(|c| c.verified));
//!     }
//! }
//!
//! impl ConnectionSink for Printer {
//!     fn on_connect(&mut self) {
//!         println!("connected");
//!     }
//!     fn on_error(&mut self, error: connwire::error::Error) {
//!         eprintln!("error: {error}");
//!     }
//! }
//!
//! let reactor = Rc::new(PollReactor::new());
//! let conn = Connection::new(
//!     reactor.clone(),
//!     Rc::new(GaiResolver::new()),
//!     Location::new("irc.example.net", 6667),
//!     ConnectConfig::low_latency(),
//!     Printer,
//! );
//! conn.borrow_mut().connect().expect("connect submission");
//! loop {
//!     reactor.turn(std::time::Duration::from_millis(100));
//! }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod monitor;
pub mod protocol;
pub mod reactor;
pub mod resolver;
pub mod socket;
pub mod tls;

pub use config::ConnectConfig;
pub use connection::{Connection, ConnectionSink, ConnectionState};
pub use error::{Error, Result};
pub use monitor::{ConnectionInfo, ConnectionMonitor};
pub use protocol::{Position, ProtocolLayer, ProtocolSink, ProtocolState, SegmentList, SendOutcome};
pub use reactor::{Descriptor, Handler, PollReactor, Reactor, SocketEvents, TimerToken};
pub use resolver::{AsyncResolver, GaiResolver, Location, Resolver};
pub use socket::{AcceptPair, ConnectStart, Domain, NonBlockingSocket};
pub use tls::{PeerCertificate, RustlsEngine, TlsContext, TlsEngine, TlsIo, TlsProfile, TlsStatus};
