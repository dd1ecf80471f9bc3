//! WebSocket ⇄ byte-stream adapter.
//!
//! Presents a message-framed WebSocket as `AsyncRead + AsyncWrite` so the
//! secure channel can treat it like any socket. Reads drain leftover bytes
//! from the previous binary message before polling the next one; writes are
//! cut into binary messages of at most `max_frame` bytes, in order. The
//! leftover buffer is bounded by the maximum message size configured on the
//! underlying WebSocket.

use bytes::{Buf, Bytes};
use futures_util::{Sink, Stream};
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;

/// Default cap on the payload of one outgoing binary message.
pub const DEFAULT_MAX_FRAME: usize = 32 * 1024;

/// A WebSocket adapted to stream semantics.
///
/// Reads and writes are serialized by `&mut self`; deadlines are applied by
/// callers with `tokio::time::timeout`.
pub struct WsStream<S> {
    inner: WebSocketStream<S>,
    leftover: Bytes,
    max_frame: usize,
}

impl<S> WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(inner: WebSocketStream<S>) -> Self {
        Self::with_max_frame(inner, DEFAULT_MAX_FRAME)
    }

    pub fn with_max_frame(inner: WebSocketStream<S>, max_frame: usize) -> Self {
        Self {
            inner,
            leftover: Bytes::new(),
            max_frame: max_frame.max(1),
        }
    }
}

fn ws_err(err: WsError) -> io::Error {
    match err {
        WsError::Io(e) => e,
        WsError::ConnectionClosed | WsError::AlreadyClosed => {
            io::Error::new(io::ErrorKind::BrokenPipe, "websocket closed")
        }
        other => io::Error::new(io::ErrorKind::Other, other),
    }
}

impl<S> AsyncRead for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.leftover.is_empty() {
                let n = buf.remaining().min(this.leftover.len());
                buf.put_slice(&this.leftover[..n]);
                this.leftover.advance(n);
                return Poll::Ready(Ok(()));
            }

            match ready!(Pin::new(&mut this.inner).poll_next(cx)) {
                Some(Ok(Message::Binary(data))) => {
                    this.leftover = Bytes::from(data);
                    // empty messages are legal; poll again
                }
                Some(Ok(Message::Close(_))) | None => return Poll::Ready(Ok(())),
                Some(Ok(_)) => {
                    // text/ping/pong carry no tunnel bytes
                }
                Some(Err(e)) => return Poll::Ready(Err(ws_err(e))),
            }
        }
    }
}

impl<S> AsyncWrite for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(Pin::new(&mut this.inner).poll_ready(cx)).map_err(ws_err)?;
        let n = buf.len().min(this.max_frame);
        Pin::new(&mut this.inner)
            .start_send(Message::Binary(buf[..n].to_vec()))
            .map_err(ws_err)?;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.inner).poll_flush(cx).map_err(ws_err)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_close(cx) {
            // a peer racing us to close is not a shutdown failure
            Poll::Ready(Err(WsError::ConnectionClosed)) | Poll::Ready(Err(WsError::AlreadyClosed)) => {
                Poll::Ready(Ok(()))
            }
            other => other.map_err(ws_err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_tungstenite::tungstenite::protocol::Role;

    /// Build a connected WS client/server pair over an in-memory duplex.
    async fn ws_pair() -> (
        WsStream<tokio::io::DuplexStream>,
        WsStream<tokio::io::DuplexStream>,
    ) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        let client = WebSocketStream::from_raw_socket(a, Role::Client, None).await;
        let server = WebSocketStream::from_raw_socket(b, Role::Server, None).await;
        (WsStream::new(client), WsStream::new(server))
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let (mut client, mut server) = ws_pair().await;

        client.write_all(b"hello over frames").await.unwrap();
        client.flush().await.unwrap();

        let mut buf = [0u8; 17];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello over frames");
    }

    #[tokio::test]
    async fn test_small_reads_drain_leftover() {
        let (mut client, mut server) = ws_pair().await;

        client.write_all(b"abcdefgh").await.unwrap();
        client.flush().await.unwrap();

        // read the one message through a 3-byte keyhole
        let mut out = Vec::new();
        let mut buf = [0u8; 3];
        while out.len() < 8 {
            let n = server.read(&mut buf).await.unwrap();
            assert!(n > 0);
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, b"abcdefgh");
    }

    #[tokio::test]
    async fn test_large_write_is_split() {
        let (a, b) = tokio::io::duplex(1024 * 1024);
        let client = WebSocketStream::from_raw_socket(a, Role::Client, None).await;
        let server = WebSocketStream::from_raw_socket(b, Role::Server, None).await;
        let mut client = WsStream::with_max_frame(client, 1024);
        let mut server = WsStream::new(server);

        let data: Vec<u8> = (0..10_000).map(|i| (i % 251) as u8).collect();
        let expected = data.clone();

        let writer = tokio::spawn(async move {
            client.write_all(&data).await.unwrap();
            client.flush().await.unwrap();
        });

        let mut got = vec![0u8; expected.len()];
        server.read_exact(&mut got).await.unwrap();
        writer.await.unwrap();
        assert_eq!(got, expected);
    }

    #[tokio::test]
    async fn test_close_is_clean_eof() {
        let (mut client, mut server) = ws_pair().await;
        client.shutdown().await.unwrap();

        let mut buf = [0u8; 8];
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }
}
