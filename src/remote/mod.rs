//! Forwarding remote specifications.
//!
//! A remote describes one forwarded endpoint pair in the mini-syntax shared
//! by the CLI, the config file and the wire:
//!
//! ```text
//! [R:][local-host:]local-port:remote-host:remote-port[/tcp|/udp]
//! stdio:remote-host:remote-port[/tcp|/udp]
//! ```
//!
//! Shorthands: `P` ⇒ `0.0.0.0:P:127.0.0.1:P`, `P:RP` ⇒ `0.0.0.0:P:127.0.0.1:RP`.
//! The keyword `socks` in place of the remote side routes connections into
//! the peer's embedded SOCKS5 server. The `R:` prefix flips the listener to
//! the server side (reverse mode).
//!
//! Remotes are parsed once and immutable afterwards; the canonical string
//! form produced by [`Remote::wire`] is what travels inside channel-open
//! payloads, and parsing it yields the same remote back.

use std::fmt;
use thiserror::Error;

/// Default local bind address for forward remotes.
const DEFAULT_BIND: &str = "0.0.0.0";
/// Default dial host when only ports are given.
const DEFAULT_HOST: &str = "127.0.0.1";
/// Conventional SOCKS port used when a bare `socks` remote is declared.
const DEFAULT_SOCKS_PORT: u16 = 1080;

/// Errors produced while parsing or validating a remote spec.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("empty remote")]
    Empty,

    #[error("invalid port: {0}")]
    InvalidPort(String),

    #[error("malformed remote: {0}")]
    Malformed(String),

    #[error("stdio remotes cannot be reverse")]
    StdioReverse,

    #[error("socks remotes must be tcp")]
    SocksProtocol,
}

/// Stream protocol of one side of a remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// The local side of a remote: a socket address to bind, or process stdio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalEndpoint {
    Addr { host: String, port: u16 },
    Stdio,
}

/// One forwarded endpoint pair with direction and protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Remote {
    pub local: LocalEndpoint,
    pub remote_host: String,
    pub remote_port: u16,
    pub protocol: Protocol,
    pub reverse: bool,
    pub socks: bool,
}

impl Remote {
    /// Parse a remote from its string form. See the module docs for the
    /// accepted grammar.
    pub fn parse(s: &str) -> Result<Self, RemoteError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(RemoteError::Empty);
        }

        let (s, reverse) = match s.strip_prefix("R:") {
            Some(rest) => (rest, true),
            None => (s, false),
        };

        let (s, protocol) = if let Some(rest) = s.strip_suffix("/udp") {
            (rest, Protocol::Udp)
        } else if let Some(rest) = s.strip_suffix("/tcp") {
            (rest, Protocol::Tcp)
        } else {
            (s, Protocol::Tcp)
        };

        let tokens = split_host_ports(s)?;
        let toks: Vec<&str> = tokens.iter().map(String::as_str).collect();

        let mut socks = false;
        let remote = match toks.as_slice() {
            ["socks"] => {
                socks = true;
                Remote {
                    local: addr(DEFAULT_HOST, DEFAULT_SOCKS_PORT),
                    remote_host: String::new(),
                    remote_port: 0,
                    protocol,
                    reverse,
                    socks,
                }
            }
            [p, "socks"] => {
                socks = true;
                Remote {
                    local: addr(DEFAULT_BIND, port(p)?),
                    remote_host: String::new(),
                    remote_port: 0,
                    protocol,
                    reverse,
                    socks,
                }
            }
            [h, p, "socks"] => {
                socks = true;
                Remote {
                    local: addr(h, port(p)?),
                    remote_host: String::new(),
                    remote_port: 0,
                    protocol,
                    reverse,
                    socks,
                }
            }
            [p] => {
                let p = port(p)?;
                Remote {
                    local: addr(DEFAULT_BIND, p),
                    remote_host: DEFAULT_HOST.to_string(),
                    remote_port: p,
                    protocol,
                    reverse,
                    socks,
                }
            }
            [p, rp] => Remote {
                local: addr(DEFAULT_BIND, port(p)?),
                remote_host: DEFAULT_HOST.to_string(),
                remote_port: port(rp)?,
                protocol,
                reverse,
                socks,
            },
            ["stdio", rh, rp] => Remote {
                local: LocalEndpoint::Stdio,
                remote_host: (*rh).to_string(),
                remote_port: port(rp)?,
                protocol,
                reverse,
                socks,
            },
            [p, rh, rp] => Remote {
                local: addr(DEFAULT_BIND, port(p)?),
                remote_host: (*rh).to_string(),
                remote_port: port(rp)?,
                protocol,
                reverse,
                socks,
            },
            [h, p, rh, rp] => Remote {
                local: addr(h, port(p)?),
                remote_host: (*rh).to_string(),
                remote_port: port(rp)?,
                protocol,
                reverse,
                socks,
            },
            _ => return Err(RemoteError::Malformed(s.to_string())),
        };

        remote.validate()?;
        Ok(remote)
    }

    fn validate(&self) -> Result<(), RemoteError> {
        if self.socks && self.protocol == Protocol::Udp {
            return Err(RemoteError::SocksProtocol);
        }
        if self.reverse && self.local == LocalEndpoint::Stdio {
            return Err(RemoteError::StdioReverse);
        }
        // The protocol field covers both sides; stdio takes the remote
        // protocol, so tcp↔tcp, udp↔udp and stdio→tcp|udp all reduce to a
        // single tag. Anything else never parses.
        Ok(())
    }

    /// Canonical wire form. `Remote::parse(r.wire())` reproduces `r`, and
    /// the string doubles as the channel-open payload.
    pub fn wire(&self) -> String {
        let mut out = String::new();
        if self.reverse {
            out.push_str("R:");
        }
        match &self.local {
            LocalEndpoint::Stdio => out.push_str("stdio"),
            LocalEndpoint::Addr { host, port } => {
                out.push_str(&format!("{}:{}", bracket(host), port))
            }
        }
        if self.socks {
            out.push_str(":socks");
        } else {
            out.push_str(&format!(":{}:{}", bracket(&self.remote_host), self.remote_port));
        }
        if self.protocol == Protocol::Udp {
            out.push_str("/udp");
        }
        out
    }

    /// The dial target on the channel-receiving side.
    pub fn target(&self) -> String {
        format!("{}:{}", bracket(&self.remote_host), self.remote_port)
    }

    /// The local bind address, when the local side is a socket.
    pub fn bind_addr(&self) -> Option<String> {
        match &self.local {
            LocalEndpoint::Addr { host, port } => Some(format!("{}:{}", bracket(host), port)),
            LocalEndpoint::Stdio => None,
        }
    }

    pub fn is_stdio(&self) -> bool {
        self.local == LocalEndpoint::Stdio
    }
}

impl fmt::Display for Remote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.wire())
    }
}

impl std::str::FromStr for Remote {
    type Err = RemoteError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Remote::parse(s)
    }
}

fn addr(host: &str, port: u16) -> LocalEndpoint {
    LocalEndpoint::Addr {
        host: host.trim_matches(&['[', ']'][..]).to_string(),
        port,
    }
}

fn port(s: &str) -> Result<u16, RemoteError> {
    // port 0 is legal on the local side (ephemeral bind)
    s.parse::<u16>()
        .map_err(|_| RemoteError::InvalidPort(s.to_string()))
}

/// Wrap bare IPv6 addresses in brackets so host:port stays parseable.
fn bracket(host: &str) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]", host)
    } else {
        host.to_string()
    }
}

/// Split on `:` while keeping `[bracketed-ipv6]` segments intact.
fn split_host_ports(s: &str) -> Result<Vec<String>, RemoteError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    for c in s.chars() {
        match c {
            '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            ':' if depth == 0 => {
                tokens.push(std::mem::take(&mut current));
                continue;
            }
            _ => {}
        }
        current.push(c);
    }
    tokens.push(current);
    if tokens.iter().any(String::is_empty) {
        return Err(RemoteError::Malformed(s.to_string()));
    }
    Ok(tokens
        .into_iter()
        .map(|t| t.trim_matches(&['[', ']'][..]).to_string())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full() {
        let r = Remote::parse("127.0.0.1:8080:example.com:80").unwrap();
        assert_eq!(r.local, LocalEndpoint::Addr { host: "127.0.0.1".into(), port: 8080 });
        assert_eq!(r.remote_host, "example.com");
        assert_eq!(r.remote_port, 80);
        assert_eq!(r.protocol, Protocol::Tcp);
        assert!(!r.reverse);
    }

    #[test]
    fn test_parse_shorthands() {
        let r = Remote::parse("3000").unwrap();
        assert_eq!(r.bind_addr().unwrap(), "0.0.0.0:3000");
        assert_eq!(r.target(), "127.0.0.1:3000");

        let r = Remote::parse("3000:4000").unwrap();
        assert_eq!(r.bind_addr().unwrap(), "0.0.0.0:3000");
        assert_eq!(r.target(), "127.0.0.1:4000");

        let r = Remote::parse("8080:example.com:80").unwrap();
        assert_eq!(r.bind_addr().unwrap(), "0.0.0.0:8080");
        assert_eq!(r.target(), "example.com:80");
    }

    #[test]
    fn test_parse_reverse() {
        let r = Remote::parse("R:127.0.0.1:8080:127.0.0.1:9000/tcp").unwrap();
        assert!(r.reverse);
        assert_eq!(r.wire(), "R:127.0.0.1:8080:127.0.0.1:9000");
    }

    #[test]
    fn test_parse_udp() {
        let r = Remote::parse("5353:8.8.8.8:53/udp").unwrap();
        assert_eq!(r.protocol, Protocol::Udp);
        assert_eq!(r.wire(), "0.0.0.0:5353:8.8.8.8:53/udp");
    }

    #[test]
    fn test_parse_stdio() {
        let r = Remote::parse("stdio:example.com:22").unwrap();
        assert!(r.is_stdio());
        assert_eq!(r.target(), "example.com:22");
        assert!(r.bind_addr().is_none());
    }

    #[test]
    fn test_parse_socks() {
        let r = Remote::parse("socks").unwrap();
        assert!(r.socks);
        assert_eq!(r.bind_addr().unwrap(), "127.0.0.1:1080");

        let r = Remote::parse("5000:socks").unwrap();
        assert!(r.socks);
        assert_eq!(r.bind_addr().unwrap(), "0.0.0.0:5000");

        let r = Remote::parse("R:socks").unwrap();
        assert!(r.reverse && r.socks);
    }

    #[test]
    fn test_parse_ipv6() {
        let r = Remote::parse("[::1]:8080:[::1]:9000").unwrap();
        assert_eq!(r.bind_addr().unwrap(), "[::1]:8080");
        assert_eq!(r.target(), "[::1]:9000");
    }

    #[test]
    fn test_wire_roundtrip() {
        for s in [
            "0.0.0.0:3000:127.0.0.1:3000",
            "R:127.0.0.1:8080:127.0.0.1:9000",
            "0.0.0.0:5353:8.8.8.8:53/udp",
            "stdio:example.com:22",
            "127.0.0.1:1080:socks",
        ] {
            let r = Remote::parse(s).unwrap();
            assert_eq!(r.wire(), s);
            assert_eq!(Remote::parse(&r.wire()).unwrap(), r);
        }
    }

    #[test]
    fn test_rejects() {
        assert_eq!(Remote::parse(""), Err(RemoteError::Empty));
        assert!(Remote::parse("host:notaport:h:80").is_err());
        assert!(Remote::parse("a:b:c:d:e").is_err());
        assert_eq!(Remote::parse("socks/udp"), Err(RemoteError::SocksProtocol));
        assert_eq!(
            Remote::parse("R:stdio:example.com:22"),
            Err(RemoteError::StdioReverse)
        );
    }
}
