//! # Veil Tunnel
//!
//! A TCP/UDP port-forwarding tunnel that carries arbitrary stream endpoints
//! over a single authenticated, multiplexed, encrypted session nested inside
//! a WebSocket transport. Built to traverse firewalls, NATs and HTTP-only
//! egress paths where only outbound HTTPS is permitted.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                    Proxies                          │
//! │      (tcp / udp / stdio listeners, SOCKS5)          │
//! ├─────────────────────────────────────────────────────┤
//! │                    Tunnel                           │
//! │     (session latch, keepalive, inbound routing)     │
//! ├─────────────────────────────────────────────────────┤
//! │                    Session                          │
//! │   (Noise IK handshake, channels, request/reply)     │
//! ├─────────────────────────────────────────────────────┤
//! │                 WS–stream adapter                   │
//! │      (binary WebSocket frames ⇄ byte stream)        │
//! ├─────────────────────────────────────────────────────┤
//! │             HTTP/1.1 WebSocket upgrade              │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! Both ends of a connection are [`tunnel::Tunnel`]s: the client holds one
//! set of remotes, the server one set per connected client. Each remote maps
//! 1:1 to a proxy. Proxies listen locally, open a logical channel on the
//! current session, and the far end dials the target and pipes bytes back.

pub mod client;
pub mod config;
pub mod crypto;
pub mod meter;
pub mod pipe;
pub mod protocol;
pub mod remote;
pub mod server;
pub mod session;
pub mod transport;
pub mod tunnel;

/// Crate version, stamped into the binaries.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Protocol tag carried as the WebSocket subprotocol and inside the
/// forwarding config. Peers speaking a different tag are refused.
pub const PROTOCOL: &str = "veil-v1";

/// Default port the server listens on.
pub const DEFAULT_PORT: u16 = 8443;

/// Rejection text the server sends when a client key is not authorized.
/// The client maps it to the distinct auth-failure exit path.
pub const UNAUTHORIZED_MSG: &str = "unauthorized client key";

/// Maximum encrypted record size on the wire (limited by the u16 length
/// prefix and the Noise message size).
pub const MAX_RECORD_SIZE: usize = 65535;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Session error: {0}")]
    Session(#[from] session::SessionError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Invalid remote: {0}")]
    Remote(#[from] remote::RemoteError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timeout")]
    Timeout,
}

impl Error {
    /// Map an error to the process exit-code contract: 0 clean, 2 config,
    /// 3 auth (client side), 4 bind (server side), 1 anything else.
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::Config(_) | Error::Remote(_) => 2,
            Error::AuthenticationFailed => 3,
            Error::Tunnel(tunnel::TunnelError::Bind(_)) => 4,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(Error::Config("x".into()).exit_code(), 2);
        assert_eq!(Error::AuthenticationFailed.exit_code(), 3);
        assert_eq!(Error::Timeout.exit_code(), 1);
    }
}
