//! Declarative forwarding configuration and its wire codec.
//!
//! After the secure handshake the initiator sends a `config` request whose
//! body is the framed [`ForwardingConfig`]: a 4-byte big-endian length
//! followed by the JSON-serialized config. The codec is symmetric and
//! strict: trailing bytes, truncation and version mismatches are errors
//! surfaced to the peer as human-readable rejection text.

use crate::remote::Remote;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced by the config codec.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("config too short")]
    Truncated,

    #[error("config has {0} trailing bytes")]
    TrailingBytes(usize),

    #[error("config body: {0}")]
    Body(String),

    #[error("protocol version mismatch: peer={0} ours={1}")]
    VersionMismatch(String, String),
}

/// The declarative set of remotes the initiator asks the responder to honor.
/// Immutable per session; re-sent from scratch on every reconnect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardingConfig {
    /// Protocol tag, compared against [`crate::PROTOCOL`] on receipt.
    pub version: String,
    /// Remotes in canonical wire form.
    pub remotes: Vec<String>,
}

impl ForwardingConfig {
    pub fn new(remotes: &[Remote]) -> Self {
        Self {
            version: crate::PROTOCOL.to_string(),
            remotes: remotes.iter().map(Remote::wire).collect(),
        }
    }

    /// Encode as a length-prefixed record.
    pub fn encode(&self) -> Bytes {
        let body = serde_json::to_vec(self).expect("config serialization cannot fail");
        let mut buf = BytesMut::with_capacity(4 + body.len());
        buf.put_u32(body.len() as u32);
        buf.extend_from_slice(&body);
        buf.freeze()
    }

    /// Decode a length-prefixed record. The buffer must contain exactly one
    /// config and nothing else.
    pub fn decode(mut buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < 4 {
            return Err(ProtocolError::Truncated);
        }
        let declared = buf.get_u32() as usize;
        if buf.len() < declared {
            return Err(ProtocolError::Truncated);
        }
        if buf.len() > declared {
            return Err(ProtocolError::TrailingBytes(buf.len() - declared));
        }
        serde_json::from_slice(buf).map_err(|e| ProtocolError::Body(e.to_string()))
    }

    /// Check the peer's version tag against ours.
    pub fn check_version(&self) -> Result<(), ProtocolError> {
        if self.version != crate::PROTOCOL {
            return Err(ProtocolError::VersionMismatch(
                self.version.clone(),
                crate::PROTOCOL.to_string(),
            ));
        }
        Ok(())
    }

    /// Parse the carried remotes back into structured form.
    pub fn parsed_remotes(&self) -> Result<Vec<Remote>, ProtocolError> {
        self.remotes
            .iter()
            .map(|s| Remote::parse(s).map_err(|e| ProtocolError::Body(e.to_string())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ForwardingConfig {
        ForwardingConfig::new(&[
            Remote::parse("8080:127.0.0.1:9000").unwrap(),
            Remote::parse("R:127.0.0.1:8081:127.0.0.1:9001").unwrap(),
            Remote::parse("5353:1.1.1.1:53/udp").unwrap(),
        ])
    }

    #[test]
    fn test_roundtrip() {
        let config = sample();
        let encoded = config.encode();
        let decoded = ForwardingConfig::decode(&encoded).unwrap();
        assert_eq!(decoded, config);
        // encode(decode(x)) = x
        assert_eq!(decoded.encode(), encoded);
    }

    #[test]
    fn test_parsed_remotes() {
        let remotes = sample().parsed_remotes().unwrap();
        assert_eq!(remotes.len(), 3);
        assert!(remotes[1].reverse);
    }

    #[test]
    fn test_truncated() {
        let encoded = sample().encode();
        assert!(matches!(
            ForwardingConfig::decode(&encoded[..3]),
            Err(ProtocolError::Truncated)
        ));
        assert!(matches!(
            ForwardingConfig::decode(&encoded[..encoded.len() - 1]),
            Err(ProtocolError::Truncated)
        ));
    }

    #[test]
    fn test_trailing_bytes() {
        let mut encoded = sample().encode().to_vec();
        encoded.push(0);
        assert!(matches!(
            ForwardingConfig::decode(&encoded),
            Err(ProtocolError::TrailingBytes(1))
        ));
    }

    #[test]
    fn test_version_mismatch() {
        let mut config = sample();
        config.version = "veil-v0".to_string();
        assert!(matches!(
            config.check_version(),
            Err(ProtocolError::VersionMismatch(_, _))
        ));
        assert!(sample().check_version().is_ok());
    }

    #[test]
    fn test_garbage_body() {
        let mut buf = BytesMut::new();
        buf.put_u32(4);
        buf.extend_from_slice(b"{{{{");
        assert!(matches!(
            ForwardingConfig::decode(&buf),
            Err(ProtocolError::Body(_))
        ));
    }
}
