//! Transport layer.
//!
//! The tunnel's outer transport is a WebSocket: every hop between the peers
//! is a discrete binary message. [`WsStream`] adapts that message framing
//! into the ordinary byte stream the secure channel runs over. [`stdio`]
//! provides the process stdin/stdout pair as a stream endpoint for
//! `stdio:` remotes.

mod stdio;
mod ws;

pub use stdio::{stdio, StdioStream};
pub use ws::{WsStream, DEFAULT_MAX_FRAME};

use thiserror::Error;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("connection closed")]
    Closed,

    #[error("timeout")]
    Timeout,
}
