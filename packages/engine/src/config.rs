//! Connection configuration
//!
//! Flat settings struct handed to each connection at construction. Presets
//! cover the common client shapes; everything can also be set field by
//! field.

use std::net::SocketAddr;
use std::time::Duration;

/// Per-connection settings.
#[derive(Debug, Clone)]
pub struct ConnectConfig {
    /// Disable Nagle's algorithm on the stream socket. Advisory; a failure
    /// to apply it is logged, not fatal.
    pub tcp_nodelay: bool,
    /// Bind this local address before connecting. Bind failure is fatal.
    pub source_address: Option<SocketAddr>,
    /// Resolve names inline, blocking the `connect()` caller. The explicit
    /// opt-out of the non-blocking design.
    pub synchronous_dns: bool,
    /// Deadline for the TLS handshake started by `ssl_connect`. Expiry is
    /// fatal and surfaces as `SecureConnectionTimeout`.
    pub secure_handshake_timeout: Option<Duration>,
    /// TLS profile name resolved through the injected `TlsContext`.
    /// Defaults to `"default"` when unset.
    pub tls_profile: Option<String>,
    /// Test hook: delay connect completion by this long after the socket
    /// reports writable.
    pub test_connect_delay: Option<Duration>,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            tcp_nodelay: false,
            source_address: None,
            synchronous_dns: false,
            secure_handshake_timeout: Some(Duration::from_secs(30)),
            tls_profile: None,
            test_connect_delay: None,
        }
    }
}

impl ConnectConfig {
    /// Configuration for interactive protocols where latency matters more
    /// than throughput.
    ///
    /// # Examples
    /// ```
    /// use connwire::config::ConnectConfig;
    ///
    /// let config = ConnectConfig::low_latency();
    /// assert!(config.tcp_nodelay);
    /// ```
    #[must_use]
    pub fn low_latency() -> Self {
        Self {
            tcp_nodelay: true,
            secure_handshake_timeout: Some(Duration::from_secs(15)),
            ..Self::default()
        }
    }

    /// Configuration for environments where only the system resolver is
    /// trustworthy and blocking on it is acceptable.
    #[must_use]
    pub fn blocking_dns() -> Self {
        Self {
            synchronous_dns: true,
            ..Self::default()
        }
    }
}
