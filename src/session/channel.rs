//! Channel handles and incoming session events.
//!
//! A [`Channel`] is one logical bidirectional stream inside a session. It
//! implements `AsyncRead`/`AsyncWrite` so forwarded connections can be piped
//! with the same code that pipes sockets: reads drain frames delivered by
//! the session task, writes push bounded data commands back to it.

use super::Command;
use bytes::{Buf, Bytes};
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;

/// Largest data payload sent in one channel frame.
pub const CHANNEL_CHUNK: usize = 16 * 1024;

/// One logical stream inside the session.
pub struct Channel {
    id: u32,
    rx: mpsc::Receiver<Bytes>,
    leftover: Bytes,
    sender: PollSender<Command>,
    cmd: mpsc::Sender<Command>,
    write_closed: bool,
}

impl Channel {
    pub(crate) fn new(
        id: u32,
        rx: mpsc::Receiver<Bytes>,
        cmd: mpsc::Sender<Command>,
    ) -> Self {
        Self {
            id,
            rx,
            leftover: Bytes::new(),
            sender: PollSender::new(cmd.clone()),
            cmd,
            write_closed: false,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }
}

impl AsyncRead for Channel {
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
            match ready!(this.rx.poll_recv(cx)) {
                Some(data) => this.leftover = data,
                // sender dropped: peer closed the channel or the session died
                None => return Poll::Ready(Ok(())),
            }
        }
    }
}

impl AsyncWrite for Channel {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.write_closed {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        if ready!(this.sender.poll_reserve(cx)).is_err() {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        let n = buf.len().min(CHANNEL_CHUNK);
        let data = Bytes::copy_from_slice(&buf[..n]);
        if this
            .sender
            .send_item(Command::Data { id: this.id, data })
            .is_err()
        {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // the session task writes eagerly; nothing is buffered here
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.write_closed {
            return Poll::Ready(Ok(()));
        }
        if ready!(this.sender.poll_reserve(cx)).is_err() {
            // session already gone; nothing left to close
            this.write_closed = true;
            return Poll::Ready(Ok(()));
        }
        let _ = this.sender.send_item(Command::Close { id: this.id });
        this.write_closed = true;
        Poll::Ready(Ok(()))
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if !self.write_closed {
            let _ = self.cmd.try_send(Command::Close { id: self.id });
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel").field("id", &self.id).finish()
    }
}

/// An event delivered by the peer: a named request or a channel open.
#[derive(Debug)]
pub enum Incoming {
    Request(IncomingRequest),
    Channel(IncomingChannel),
}

/// A named request from the peer, optionally awaiting a reply.
#[derive(Debug)]
pub struct IncomingRequest {
    pub name: String,
    pub body: Bytes,
    pub(crate) replier: Option<Replier>,
}

impl IncomingRequest {
    pub fn wants_reply(&self) -> bool {
        self.replier.is_some()
    }

    /// Reply success with the given body. No-op if no reply was requested.
    pub async fn accept(mut self, body: &[u8]) {
        if let Some(replier) = self.replier.take() {
            replier.send(true, body).await;
        }
    }

    /// Reply failure with the given body. No-op if no reply was requested.
    pub async fn reject(mut self, body: &[u8]) {
        if let Some(replier) = self.replier.take() {
            replier.send(false, body).await;
        }
    }
}

#[derive(Debug)]
pub(crate) struct Replier {
    pub(crate) id: u32,
    pub(crate) cmd: mpsc::Sender<Command>,
}

impl Replier {
    async fn send(self, ok: bool, body: &[u8]) {
        let _ = self
            .cmd
            .send(Command::Reply {
                id: self.id,
                ok,
                body: Bytes::copy_from_slice(body),
            })
            .await;
    }
}

/// A channel-open from the peer, to be accepted or rejected.
#[derive(Debug)]
pub struct IncomingChannel {
    pub kind: String,
    pub payload: Bytes,
    pub(crate) id: u32,
    pub(crate) channel: Option<Channel>,
    pub(crate) cmd: mpsc::Sender<Command>,
}

impl IncomingChannel {
    /// Accept the channel and start exchanging bytes.
    pub async fn accept(mut self) -> Channel {
        let channel = self.channel.take().expect("channel already taken");
        let _ = self.cmd.send(Command::AcceptChannel { id: self.id }).await;
        channel
    }

    /// Reject the channel with a reason the opener will see.
    pub async fn reject(mut self, reason: &str) {
        // dropping the embedded handle must not race a Close after the Reject
        if let Some(mut channel) = self.channel.take() {
            channel.write_closed = true;
        }
        let _ = self
            .cmd
            .send(Command::RejectChannel {
                id: self.id,
                reason: reason.to_string(),
            })
            .await;
    }
}

impl Drop for IncomingChannel {
    fn drop(&mut self) {
        if let Some(channel) = self.channel.as_mut() {
            channel.write_closed = true;
            let _ = self.cmd.try_send(Command::RejectChannel {
                id: self.id,
                reason: "unhandled channel".to_string(),
            });
        }
    }
}
