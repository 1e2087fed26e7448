//! Remote endpoint description and name resolution interfaces
//!
//! Resolution itself is an external collaborator: the engine consumes a
//! [`Resolver`] (synchronous) or an [`AsyncResolver`] (callback-based) and
//! never implements lookup algorithms. [`GaiResolver`] is the stock
//! getaddrinfo-backed implementation.

use std::net::{IpAddr, SocketAddr, ToSocketAddrs};

/// A possibly-unresolved remote endpoint.
///
/// Created from configuration, mutated exactly once when resolution merges
/// an address in, immutable afterwards apart from the SOCKS far-end
/// accessors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    host: String,
    port: u16,
    resolved: Option<SocketAddr>,
    far_end: Option<(String, u16)>,
}

impl Location {
    /// Describe a direct target.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            resolved: None,
            far_end: None,
        }
    }

    /// Describe a target reached through a SOCKS4 proxy: `host:port` is the
    /// proxy itself, the far end is the destination the proxy connects to.
    #[must_use]
    pub fn via_socks(
        proxy_host: impl Into<String>,
        proxy_port: u16,
        far_host: impl Into<String>,
        far_port: u16,
    ) -> Self {
        Self {
            host: proxy_host.into(),
            port: proxy_port,
            resolved: None,
            far_end: Some((far_host.into(), far_port)),
        }
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// True when the host is already a literal address and no name lookup
    /// is needed.
    #[must_use]
    pub fn is_literal(&self) -> bool {
        self.host.parse::<IpAddr>().is_ok()
    }

    /// Resolve a literal host without consulting any resolver.
    #[must_use]
    pub fn literal_address(&self) -> Option<SocketAddr> {
        self.host
            .parse::<IpAddr>()
            .ok()
            .map(|ip| SocketAddr::new(ip, self.port))
    }

    /// The address resolution produced, if it ran.
    #[must_use]
    pub fn resolved(&self) -> Option<SocketAddr> {
        self.resolved
    }

    /// Merge the resolver's answer into this location. Called once.
    pub fn merge_resolved(&mut self, addr: SocketAddr) {
        self.resolved = Some(addr);
    }

    /// SOCKS far-end accessor: the destination the proxy is asked to reach.
    #[must_use]
    pub fn far_end(&self) -> Option<(&str, u16)> {
        self.far_end.as_ref().map(|(h, p)| (h.as_str(), *p))
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Synchronous resolver collaborator. Blocks the caller; used only on the
/// explicit synchronous-DNS opt-in path.
pub trait Resolver {
    /// Resolve `location` in place. An `Err` carries a human-readable
    /// reason.
    fn resolve(&self, location: &mut Location) -> std::result::Result<(), String>;
}

/// Completion callback for asynchronous resolution. Must be invoked on the
/// reactor thread.
pub type ResolveCallback = Box<dyn FnOnce(std::result::Result<Location, String>)>;

/// Asynchronous resolver collaborator. Implementations deliver the result
/// through `done` on a later reactor turn, never inside `start`.
pub trait AsyncResolver {
    fn start(&self, location: Location, done: ResolveCallback);
}

/// getaddrinfo-backed resolver.
#[derive(Debug, Default)]
pub struct GaiResolver;

impl GaiResolver {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Resolver for GaiResolver {
    fn resolve(&self, location: &mut Location) -> std::result::Result<(), String> {
        if let Some(addr) = location.literal_address() {
            location.merge_resolved(addr);
            return Ok(());
        }
        let host = location.host().to_string();
        let addrs = (host.as_str(), location.port())
            .to_socket_addrs()
            .map_err(|e| format!("lookup of {host} failed: {e}"))?;
        // Prefer IPv4 to match the engine's default stream domain choice.
        let mut picked: Option<SocketAddr> = None;
        for addr in addrs {
            if addr.is_ipv4() {
                picked = Some(addr);
                break;
            }
            picked.get_or_insert(addr);
        }
        match picked {
            Some(addr) => {
                tracing::debug!("resolved {host} to {addr}");
                location.merge_resolved(addr);
                Ok(())
            }
            None => Err(format!("no addresses found for {host}")),
        }
    }
}
