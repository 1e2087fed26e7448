//! SOCKS4/SOCKS4a client wire format
//!
//! The request always uses the SOCKS4a hostname form: the address field is
//! the invalid IPv4 0.0.0.1 sentinel, which asks the proxy to resolve the
//! hostname appended after the user-id field.

/// Success code in a SOCKS4 reply ('Z').
const GRANTED: u8 = 0x5A;

/// Length of a SOCKS4 reply.
pub const REPLY_LEN: usize = 8;

/// Build a SOCKS4a CONNECT request for `host:port` with an empty user-id.
#[must_use]
pub fn encode_request(host: &str, port: u16) -> Vec<u8> {
    let mut request = Vec::with_capacity(10 + host.len());
    request.push(0x04); // version
    request.push(0x01); // CONNECT
    request.extend_from_slice(&port.to_be_bytes());
    request.extend_from_slice(&[0x00, 0x00, 0x00, 0x01]); // 4a sentinel
    request.push(0x00); // empty user-id, NUL terminated
    request.extend_from_slice(host.as_bytes());
    request.push(0x00);
    request
}

/// Decision from accumulated reply bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Fewer than eight bytes so far; keep waiting.
    Incomplete,
    /// The proxy granted the connection.
    Granted,
    /// The proxy rejected the request with the given code.
    Rejected(u8),
    /// The reply is not SOCKS4 at all.
    Malformed(u8),
}

/// Inspect the reply bytes accumulated so far.
#[must_use]
pub fn parse_reply(buf: &[u8]) -> Reply {
    if buf.len() < REPLY_LEN {
        return Reply::Incomplete;
    }
    if buf[0] != 0x00 {
        return Reply::Malformed(buf[0]);
    }
    if buf[1] == GRANTED {
        Reply::Granted
    } else {
        Reply::Rejected(buf[1])
    }
}
