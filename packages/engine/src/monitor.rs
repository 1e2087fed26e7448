//! Optional connection monitoring registry
//!
//! Connections register a lightweight reporting handle with an injected
//! monitor and remove it on close. The registry is shared across
//! connections by the owning application; the engine only calls into it.

use std::net::SocketAddr;

/// Lightweight reporting handle for one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: u64,
    pub peer: Option<SocketAddr>,
    pub secure: bool,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Registry of live connections, injected by the application.
pub trait ConnectionMonitor {
    fn register(&self, info: ConnectionInfo);
    fn unregister(&self, id: u64);
}
