//! Session frame codec.
//!
//! Every encrypted record on the wire carries exactly one frame:
//!
//! ```text
//! +--------+--------+--------+--------+--------+
//! |  Type  |              ID (4B BE)           |
//! +--------+--------+--------+--------+--------+
//! |                 Payload                    |
//! +--------------------------------------------+
//! ```
//!
//! Channel frames use the opener-assigned channel id (odd for the client,
//! even for the server); request/reply frames use a per-sender request id.

use super::SessionError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Frame header size in bytes
pub const FRAME_HEADER_SIZE: usize = 5;

/// Maximum frame payload: one encrypted record minus the AEAD tag and header.
pub const MAX_PAYLOAD_SIZE: usize =
    crate::MAX_RECORD_SIZE - crate::crypto::TAG_LEN - FRAME_HEADER_SIZE;

/// Frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Open a logical channel (payload: kind + opaque channel payload)
    OpenChannel = 0x01,
    /// Peer accepted a channel open
    AcceptChannel = 0x02,
    /// Peer rejected a channel open (payload: reason text)
    RejectChannel = 0x03,
    /// Channel data
    Data = 0x04,
    /// Channel close
    CloseChannel = 0x05,
    /// Named request (payload: name + want-reply flag + body)
    Request = 0x06,
    /// Reply to a request (payload: ok flag + body)
    Reply = 0x07,
}

impl TryFrom<u8> for FrameType {
    type Error = SessionError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(FrameType::OpenChannel),
            0x02 => Ok(FrameType::AcceptChannel),
            0x03 => Ok(FrameType::RejectChannel),
            0x04 => Ok(FrameType::Data),
            0x05 => Ok(FrameType::CloseChannel),
            0x06 => Ok(FrameType::Request),
            0x07 => Ok(FrameType::Reply),
            _ => Err(SessionError::Frame(format!("unknown frame type {value}"))),
        }
    }
}

/// A protocol frame
#[derive(Debug, Clone)]
pub struct Frame {
    pub frame_type: FrameType,
    pub id: u32,
    pub payload: Bytes,
}

impl Frame {
    pub fn open_channel(id: u32, kind: &str, payload: &[u8]) -> Self {
        let mut buf = BytesMut::with_capacity(1 + kind.len() + payload.len());
        buf.put_u8(kind.len() as u8);
        buf.extend_from_slice(kind.as_bytes());
        buf.extend_from_slice(payload);
        Self {
            frame_type: FrameType::OpenChannel,
            id,
            payload: buf.freeze(),
        }
    }

    pub fn accept_channel(id: u32) -> Self {
        Self {
            frame_type: FrameType::AcceptChannel,
            id,
            payload: Bytes::new(),
        }
    }

    pub fn reject_channel(id: u32, reason: &str) -> Self {
        Self {
            frame_type: FrameType::RejectChannel,
            id,
            payload: Bytes::copy_from_slice(reason.as_bytes()),
        }
    }

    pub fn data(id: u32, payload: Bytes) -> Self {
        Self {
            frame_type: FrameType::Data,
            id,
            payload,
        }
    }

    pub fn close_channel(id: u32) -> Self {
        Self {
            frame_type: FrameType::CloseChannel,
            id,
            payload: Bytes::new(),
        }
    }

    pub fn request(id: u32, name: &str, want_reply: bool, body: &[u8]) -> Self {
        let mut buf = BytesMut::with_capacity(2 + name.len() + body.len());
        buf.put_u8(name.len() as u8);
        buf.extend_from_slice(name.as_bytes());
        buf.put_u8(want_reply as u8);
        buf.extend_from_slice(body);
        Self {
            frame_type: FrameType::Request,
            id,
            payload: buf.freeze(),
        }
    }

    pub fn reply(id: u32, ok: bool, body: &[u8]) -> Self {
        let mut buf = BytesMut::with_capacity(1 + body.len());
        buf.put_u8(ok as u8);
        buf.extend_from_slice(body);
        Self {
            frame_type: FrameType::Reply,
            id,
            payload: buf.freeze(),
        }
    }

    /// Split an OpenChannel payload into (kind, channel payload).
    pub fn parse_open(&self) -> Result<(String, Bytes), SessionError> {
        let mut p = self.payload.clone();
        if p.is_empty() {
            return Err(SessionError::Frame("empty open payload".into()));
        }
        let kind_len = p.get_u8() as usize;
        if p.len() < kind_len {
            return Err(SessionError::Frame("truncated channel kind".into()));
        }
        let kind = String::from_utf8(p.split_to(kind_len).to_vec())
            .map_err(|_| SessionError::Frame("channel kind not utf-8".into()))?;
        Ok((kind, p))
    }

    /// Split a Request payload into (name, want_reply, body).
    pub fn parse_request(&self) -> Result<(String, bool, Bytes), SessionError> {
        let mut p = self.payload.clone();
        if p.is_empty() {
            return Err(SessionError::Frame("empty request payload".into()));
        }
        let name_len = p.get_u8() as usize;
        if p.len() < name_len + 1 {
            return Err(SessionError::Frame("truncated request".into()));
        }
        let name = String::from_utf8(p.split_to(name_len).to_vec())
            .map_err(|_| SessionError::Frame("request name not utf-8".into()))?;
        let want_reply = p.get_u8() != 0;
        Ok((name, want_reply, p))
    }

    /// Split a Reply payload into (ok, body).
    pub fn parse_reply(&self) -> Result<(bool, Bytes), SessionError> {
        let mut p = self.payload.clone();
        if p.is_empty() {
            return Err(SessionError::Frame("empty reply payload".into()));
        }
        let ok = p.get_u8() != 0;
        Ok((ok, p))
    }

    /// Encode into one plaintext record.
    pub fn encode(&self) -> Result<BytesMut, SessionError> {
        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(SessionError::FrameTooLarge(self.payload.len()));
        }
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + self.payload.len());
        buf.put_u8(self.frame_type as u8);
        buf.put_u32(self.id);
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }

    /// Decode one plaintext record. The record must contain exactly one frame.
    pub fn decode(buf: &[u8]) -> Result<Self, SessionError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Err(SessionError::Frame("short frame".into()));
        }
        let frame_type = FrameType::try_from(buf[0])?;
        let id = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        Ok(Self {
            frame_type,
            id,
            payload: Bytes::copy_from_slice(&buf[FRAME_HEADER_SIZE..]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_roundtrip() {
        let original = Frame::data(42, Bytes::from_static(b"Hello, World!"));
        let encoded = original.encode().unwrap();
        let decoded = Frame::decode(&encoded).unwrap();

        assert_eq!(decoded.frame_type, FrameType::Data);
        assert_eq!(decoded.id, 42);
        assert_eq!(decoded.payload, original.payload);
    }

    #[test]
    fn test_open_channel_roundtrip() {
        let frame = Frame::open_channel(7, "forward", b"0.0.0.0:80:example.com:80");
        let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();
        let (kind, payload) = decoded.parse_open().unwrap();
        assert_eq!(kind, "forward");
        assert_eq!(&payload[..], b"0.0.0.0:80:example.com:80");
    }

    #[test]
    fn test_request_roundtrip() {
        let frame = Frame::request(3, "ping", true, b"");
        let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();
        let (name, want_reply, body) = decoded.parse_request().unwrap();
        assert_eq!(name, "ping");
        assert!(want_reply);
        assert!(body.is_empty());
    }

    #[test]
    fn test_reply_roundtrip() {
        let frame = Frame::reply(3, false, b"denied");
        let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();
        let (ok, body) = decoded.parse_reply().unwrap();
        assert!(!ok);
        assert_eq!(&body[..], b"denied");
    }

    #[test]
    fn test_unknown_type_rejected() {
        let buf = [0xEEu8, 0, 0, 0, 1];
        assert!(Frame::decode(&buf).is_err());
    }

    #[test]
    fn test_oversize_payload_rejected() {
        let frame = Frame::data(1, Bytes::from(vec![0u8; MAX_PAYLOAD_SIZE + 1]));
        assert!(matches!(
            frame.encode(),
            Err(SessionError::FrameTooLarge(_))
        ));
    }
}
