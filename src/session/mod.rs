//! The authenticated, encrypted, multiplexed session.
//!
//! A session runs over any byte stream (in production: the WS–stream
//! adapter). Establishment performs the Noise IK handshake, then a
//! dedicated task multiplexes logical channels and named requests over
//! length-prefixed encrypted records:
//!
//! ```text
//! u16 BE ciphertext length | ciphertext (frame + AEAD tag)
//! ```
//!
//! The [`Session`] handle is cheap to clone and safe to use from any task;
//! all wire access is funneled through the session task. Incoming requests
//! and channel opens surface on the [`Incoming`] stream handed to the
//! binder.

mod channel;
mod frame;

pub use channel::{Channel, Incoming, IncomingChannel, IncomingRequest};
pub use frame::{Frame, FrameType, MAX_PAYLOAD_SIZE};

use crate::crypto::{KeyPair, NoiseHandshake, NoiseTransport, PublicKey, TAG_LEN};
use bytes::Bytes;
use channel::Replier;
use std::collections::HashMap;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Command queue depth from handles into the session task.
const CMD_BUFFER: usize = 256;
/// Grace period for a graceful shutdown before the hard cancel.
const CLOSE_GRACE: std::time::Duration = std::time::Duration::from_secs(3);
/// Per-channel inbound data queue depth.
const CHANNEL_BUFFER: usize = 64;
/// Raw record queue depth from the reader task.
const RECORD_BUFFER: usize = 32;

/// Session layer errors
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("crypto error: {0}")]
    Crypto(#[from] crate::crypto::CryptoError),

    #[error("malformed frame: {0}")]
    Frame(String),

    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("channel rejected: {0}")]
    ChannelRejected(String),

    #[error("request rejected: {0}")]
    RequestRejected(String),

    #[error("session closed")]
    Closed,
}

#[derive(Debug)]
pub(crate) enum Command {
    OpenChannel {
        kind: String,
        payload: Bytes,
        reply: oneshot::Sender<Result<Channel, SessionError>>,
    },
    Request {
        name: String,
        body: Bytes,
        reply: Option<oneshot::Sender<Result<Bytes, SessionError>>>,
    },
    AcceptChannel {
        id: u32,
    },
    RejectChannel {
        id: u32,
        reason: String,
    },
    Reply {
        id: u32,
        ok: bool,
        body: Bytes,
    },
    Data {
        id: u32,
        data: Bytes,
    },
    Close {
        id: u32,
    },
    Shutdown,
}

/// Handle to a live session. Cloneable; `open_channel` and `send_request`
/// may be called concurrently from any number of tasks.
#[derive(Clone)]
pub struct Session {
    cmd: mpsc::Sender<Command>,
    closed: CancellationToken,
}

impl Session {
    /// Open a logical channel of the given kind with an opaque payload.
    pub async fn open_channel(&self, kind: &str, payload: &[u8]) -> Result<Channel, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.cmd
            .send(Command::OpenChannel {
                kind: kind.to_string(),
                payload: Bytes::copy_from_slice(payload),
                reply: tx,
            })
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    /// Send a named request and wait for the reply body. A failure reply
    /// surfaces as [`SessionError::RequestRejected`].
    pub async fn send_request(&self, name: &str, body: &[u8]) -> Result<Bytes, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.cmd
            .send(Command::Request {
                name: name.to_string(),
                body: Bytes::copy_from_slice(body),
                reply: Some(tx),
            })
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    /// Send a named request without waiting for a reply.
    pub async fn notify(&self, name: &str, body: &[u8]) -> Result<(), SessionError> {
        self.cmd
            .send(Command::Request {
                name: name.to_string(),
                body: Bytes::copy_from_slice(body),
                reply: None,
            })
            .await
            .map_err(|_| SessionError::Closed)
    }

    /// Close the session. Idempotent and safe from any task.
    ///
    /// Queued frames (a pending reply, a close notification) are written
    /// before the shutdown command is processed; a wedged session is
    /// hard-cancelled after a short grace period.
    pub fn close(&self) {
        let cmd = self.cmd.clone();
        let closed = self.closed.clone();
        tokio::spawn(async move {
            let _ = tokio::time::timeout(CLOSE_GRACE, cmd.send(Command::Shutdown)).await;
            closed.cancel();
        });
    }

    /// Resolves when the session has fully shut down.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Client-side establishment: Noise IK initiator handshake, then the mux.
pub async fn connect<S>(
    stream: S,
    keypair: &KeyPair,
    server_key: &PublicKey,
) -> Result<(Session, mpsc::UnboundedReceiver<Incoming>), SessionError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);

    let mut handshake = NoiseHandshake::initiator(keypair, server_key)?;
    let mut msg = vec![0u8; crate::MAX_RECORD_SIZE];
    let mut payload = vec![0u8; crate::MAX_RECORD_SIZE];

    // -> e, es, s, ss
    let n = handshake.write_message(&[], &mut msg)?;
    write_record(&mut writer, &msg[..n]).await?;

    // <- e, ee, se
    let n = read_record(&mut reader, &mut msg).await?;
    handshake.read_message(&msg[..n], &mut payload)?;

    let transport = handshake.into_transport()?;
    Ok(spawn_mux(reader, writer, transport, true))
}

/// Server-side establishment: Noise IK responder handshake, then the mux.
/// Returns the client's static public key for authorization by the caller.
pub async fn accept<S>(
    stream: S,
    keypair: &KeyPair,
) -> Result<(Session, mpsc::UnboundedReceiver<Incoming>, PublicKey), SessionError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);

    let mut handshake = NoiseHandshake::responder(keypair)?;
    let mut msg = vec![0u8; crate::MAX_RECORD_SIZE];
    let mut payload = vec![0u8; crate::MAX_RECORD_SIZE];

    let n = read_record(&mut reader, &mut msg).await?;
    handshake.read_message(&msg[..n], &mut payload)?;

    let client_key = handshake
        .remote_static()
        .ok_or_else(|| SessionError::Frame("initiator static key missing".into()))?;

    let n = handshake.write_message(&[], &mut msg)?;
    write_record(&mut writer, &msg[..n]).await?;

    let transport = handshake.into_transport()?;
    let (session, incoming) = spawn_mux(reader, writer, transport, false);
    Ok((session, incoming, client_key))
}

async fn write_record<W: AsyncWrite + Unpin>(writer: &mut W, record: &[u8]) -> std::io::Result<()> {
    let mut buf = Vec::with_capacity(2 + record.len());
    buf.extend_from_slice(&(record.len() as u16).to_be_bytes());
    buf.extend_from_slice(record);
    writer.write_all(&buf).await?;
    writer.flush().await
}

async fn read_record<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut len_buf = [0u8; 2];
    reader.read_exact(&mut len_buf).await?;
    let len = u16::from_be_bytes(len_buf) as usize;
    reader.read_exact(&mut buf[..len]).await?;
    Ok(len)
}

fn spawn_mux<R, W>(
    reader: R,
    writer: W,
    transport: NoiseTransport,
    initiator: bool,
) -> (Session, mpsc::UnboundedReceiver<Incoming>)
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let (cmd_tx, cmd_rx) = mpsc::channel(CMD_BUFFER);
    let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
    let closed = CancellationToken::new();

    let session = Session {
        cmd: cmd_tx.clone(),
        closed: closed.clone(),
    };

    // dedicated reader: pulls length-prefixed records off the transport so
    // the mux select loop is never parked on a partial read
    let (record_tx, record_rx) = mpsc::channel::<std::io::Result<Vec<u8>>>(RECORD_BUFFER);
    let reader_closed = closed.clone();
    tokio::spawn(async move {
        let mut reader = reader;
        let mut buf = vec![0u8; crate::MAX_RECORD_SIZE];
        loop {
            tokio::select! {
                _ = reader_closed.cancelled() => break,
                res = read_record(&mut reader, &mut buf) => match res {
                    Ok(n) => {
                        if record_tx.send(Ok(buf[..n].to_vec())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = record_tx.send(Err(e)).await;
                        break;
                    }
                },
            }
        }
    });

    let mux = Mux {
        writer,
        transport,
        encrypt_buf: vec![0u8; crate::MAX_RECORD_SIZE + TAG_LEN],
        plain_buf: vec![0u8; crate::MAX_RECORD_SIZE],
        channels: HashMap::new(),
        pending_opens: HashMap::new(),
        pending_requests: HashMap::new(),
        next_channel_id: if initiator { 1 } else { 2 },
        next_request_id: 1,
        cmd_tx,
        incoming_tx,
        closed: closed.clone(),
    };
    tokio::spawn(mux.run(record_rx, cmd_rx));

    (session, incoming_rx)
}

struct PendingOpen {
    reply: oneshot::Sender<Result<Channel, SessionError>>,
    rx: Option<mpsc::Receiver<Bytes>>,
}

struct Mux<W> {
    writer: W,
    transport: NoiseTransport,
    encrypt_buf: Vec<u8>,
    plain_buf: Vec<u8>,
    channels: HashMap<u32, mpsc::Sender<Bytes>>,
    pending_opens: HashMap<u32, PendingOpen>,
    pending_requests: HashMap<u32, oneshot::Sender<Result<Bytes, SessionError>>>,
    next_channel_id: u32,
    next_request_id: u32,
    cmd_tx: mpsc::Sender<Command>,
    incoming_tx: mpsc::UnboundedSender<Incoming>,
    closed: CancellationToken,
}

impl<W: AsyncWrite + Send + Unpin + 'static> Mux<W> {
    async fn run(
        mut self,
        mut record_rx: mpsc::Receiver<std::io::Result<Vec<u8>>>,
        mut cmd_rx: mpsc::Receiver<Command>,
    ) {
        let reason = loop {
            tokio::select! {
                _ = self.closed.cancelled() => break None,
                record = record_rx.recv() => match record {
                    Some(Ok(record)) => {
                        if let Err(e) = self.handle_record(&record).await {
                            break Some(e);
                        }
                    }
                    Some(Err(e)) => break Some(SessionError::Io(e)),
                    None => break None,
                },
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Shutdown) | None => break None,
                    Some(cmd) => {
                        if let Err(e) = self.handle_command(cmd).await {
                            break Some(e);
                        }
                    }
                },
            }
        };

        if let Some(e) = reason {
            debug!("session ended: {}", e);
        } else {
            debug!("session closed");
        }

        // unblock every waiter before the handle observes the close
        for (_, pending) in self.pending_opens.drain() {
            let _ = pending.reply.send(Err(SessionError::Closed));
        }
        for (_, pending) in self.pending_requests.drain() {
            let _ = pending.send(Err(SessionError::Closed));
        }
        self.channels.clear();
        let _ = self.writer.shutdown().await;
        self.closed.cancel();
    }

    async fn handle_record(&mut self, record: &[u8]) -> Result<(), SessionError> {
        let n = self.transport.decrypt(record, &mut self.plain_buf)?;
        let frame = Frame::decode(&self.plain_buf[..n])?;
        trace!(
            frame_type = ?frame.frame_type,
            id = frame.id,
            len = frame.payload.len(),
            "frame in"
        );

        match frame.frame_type {
            FrameType::OpenChannel => {
                let (kind, payload) = frame.parse_open()?;
                let (data_tx, data_rx) = mpsc::channel(CHANNEL_BUFFER);
                self.channels.insert(frame.id, data_tx);
                let incoming = IncomingChannel {
                    kind,
                    payload,
                    id: frame.id,
                    channel: Some(Channel::new(frame.id, data_rx, self.cmd_tx.clone())),
                    cmd: self.cmd_tx.clone(),
                };
                if self.incoming_tx.send(Incoming::Channel(incoming)).is_err() {
                    // nobody is routing; refuse rather than black-hole
                    self.channels.remove(&frame.id);
                    self.write_frame(Frame::reject_channel(frame.id, "no handler"))
                        .await?;
                }
            }
            FrameType::AcceptChannel => {
                if let Some(mut pending) = self.pending_opens.remove(&frame.id) {
                    let rx = pending.rx.take().expect("pending open without receiver");
                    let channel = Channel::new(frame.id, rx, self.cmd_tx.clone());
                    let _ = pending.reply.send(Ok(channel));
                }
            }
            FrameType::RejectChannel => {
                self.channels.remove(&frame.id);
                if let Some(pending) = self.pending_opens.remove(&frame.id) {
                    let reason = String::from_utf8_lossy(&frame.payload).to_string();
                    let _ = pending.reply.send(Err(SessionError::ChannelRejected(reason)));
                }
            }
            FrameType::Data => {
                let gone = match self.channels.get(&frame.id) {
                    Some(tx) => tx.send(frame.payload).await.is_err(),
                    None => {
                        trace!(id = frame.id, "data for unknown channel");
                        false
                    }
                };
                if gone {
                    // local consumer went away; close our side
                    self.channels.remove(&frame.id);
                    self.write_frame(Frame::close_channel(frame.id)).await?;
                }
            }
            FrameType::CloseChannel => {
                self.channels.remove(&frame.id);
            }
            FrameType::Request => {
                let (name, want_reply, body) = frame.parse_request()?;
                let replier = want_reply.then(|| Replier {
                    id: frame.id,
                    cmd: self.cmd_tx.clone(),
                });
                let request = IncomingRequest {
                    name,
                    body,
                    replier,
                };
                if self.incoming_tx.send(Incoming::Request(request)).is_err() && want_reply {
                    self.write_frame(Frame::reply(frame.id, false, b"no handler"))
                        .await?;
                }
            }
            FrameType::Reply => {
                if let Some(pending) = self.pending_requests.remove(&frame.id) {
                    let (ok, body) = frame.parse_reply()?;
                    let result = if ok {
                        Ok(body)
                    } else {
                        Err(SessionError::RequestRejected(
                            String::from_utf8_lossy(&body).to_string(),
                        ))
                    };
                    let _ = pending.send(result);
                }
            }
        }
        Ok(())
    }

    async fn handle_command(&mut self, cmd: Command) -> Result<(), SessionError> {
        match cmd {
            Command::OpenChannel {
                kind,
                payload,
                reply,
            } => {
                let id = self.next_channel_id;
                self.next_channel_id = self.next_channel_id.wrapping_add(2);
                let (data_tx, data_rx) = mpsc::channel(CHANNEL_BUFFER);
                self.channels.insert(id, data_tx);
                self.pending_opens.insert(
                    id,
                    PendingOpen {
                        reply,
                        rx: Some(data_rx),
                    },
                );
                self.write_frame(Frame::open_channel(id, &kind, &payload))
                    .await?;
            }
            Command::Request { name, body, reply } => {
                let id = self.next_request_id;
                self.next_request_id = self.next_request_id.wrapping_add(1);
                let want_reply = reply.is_some();
                if let Some(reply) = reply {
                    self.pending_requests.insert(id, reply);
                }
                self.write_frame(Frame::request(id, &name, want_reply, &body))
                    .await?;
            }
            Command::AcceptChannel { id } => {
                self.write_frame(Frame::accept_channel(id)).await?;
            }
            Command::RejectChannel { id, reason } => {
                self.channels.remove(&id);
                self.write_frame(Frame::reject_channel(id, &reason)).await?;
            }
            Command::Reply { id, ok, body } => {
                self.write_frame(Frame::reply(id, ok, &body)).await?;
            }
            Command::Data { id, data } => {
                // drop writes for channels the peer already closed
                if self.channels.contains_key(&id) || self.pending_opens.contains_key(&id) {
                    self.write_frame(Frame::data(id, data)).await?;
                }
            }
            Command::Close { id } => {
                let known = self.channels.remove(&id).is_some()
                    | self.pending_opens.remove(&id).is_some();
                if known {
                    self.write_frame(Frame::close_channel(id)).await?;
                }
            }
            Command::Shutdown => unreachable!("handled in the select loop"),
        }
        Ok(())
    }

    async fn write_frame(&mut self, frame: Frame) -> Result<(), SessionError> {
        let plaintext = frame.encode()?;
        let n = self.transport.encrypt(&plaintext, &mut self.encrypt_buf)?;
        trace!(frame_type = ?frame.frame_type, id = frame.id, len = n, "frame out");

        let mut wire = Vec::with_capacity(2 + n);
        wire.extend_from_slice(&(n as u16).to_be_bytes());
        wire.extend_from_slice(&self.encrypt_buf[..n]);
        self.writer.write_all(&wire).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn session_pair() -> (
        Session,
        mpsc::UnboundedReceiver<Incoming>,
        Session,
        mpsc::UnboundedReceiver<Incoming>,
    ) {
        let server_kp = KeyPair::generate().unwrap();
        let client_kp = KeyPair::generate().unwrap();
        let server_pub = server_kp.public.clone();

        let (a, b) = tokio::io::duplex(256 * 1024);
        let server_task =
            tokio::spawn(async move { accept(b, &server_kp).await.unwrap() });
        let (client, client_in) = connect(a, &client_kp, &server_pub).await.unwrap();
        let (server, server_in, seen_key) = server_task.await.unwrap();
        assert_eq!(seen_key, client_kp.public);
        (client, client_in, server, server_in)
    }

    #[tokio::test]
    async fn test_request_reply() {
        let (client, _client_in, _server, mut server_in) = session_pair().await;

        let responder = tokio::spawn(async move {
            match server_in.recv().await.unwrap() {
                Incoming::Request(req) => {
                    assert_eq!(req.name, "ping");
                    req.accept(b"pong").await;
                }
                other => panic!("unexpected: {:?}", other),
            }
        });

        let reply = client.send_request("ping", b"").await.unwrap();
        assert_eq!(&reply[..], b"pong");
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_request_rejected() {
        let (client, _client_in, _server, mut server_in) = session_pair().await;

        tokio::spawn(async move {
            if let Some(Incoming::Request(req)) = server_in.recv().await {
                req.reject(b"nope").await;
            }
        });

        let err = client.send_request("bogus", b"").await.unwrap_err();
        assert!(matches!(err, SessionError::RequestRejected(r) if r == "nope"));
    }

    #[tokio::test]
    async fn test_channel_echo() {
        let (client, _client_in, _server, mut server_in) = session_pair().await;

        tokio::spawn(async move {
            if let Some(Incoming::Channel(open)) = server_in.recv().await {
                assert_eq!(open.kind, "forward");
                assert_eq!(&open.payload[..], b"spec");
                let mut channel = open.accept().await;
                let mut buf = [0u8; 5];
                channel.read_exact(&mut buf).await.unwrap();
                channel.write_all(&buf).await.unwrap();
                channel.shutdown().await.unwrap();
            }
        });

        let mut channel = client.open_channel("forward", b"spec").await.unwrap();
        channel.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        channel.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        // after the peer's shutdown the stream reads EOF
        let n = channel.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_channel_rejected() {
        let (client, _client_in, _server, mut server_in) = session_pair().await;

        tokio::spawn(async move {
            if let Some(Incoming::Channel(open)) = server_in.recv().await {
                open.reject("connection refused").await;
            }
        });

        let err = client.open_channel("forward", b"x").await.unwrap_err();
        assert!(matches!(err, SessionError::ChannelRejected(r) if r.contains("refused")));
    }

    #[tokio::test]
    async fn test_large_transfer_in_order() {
        let (client, _client_in, _server, mut server_in) = session_pair().await;

        let data: Vec<u8> = (0..200_000).map(|i| (i % 251) as u8).collect();
        let expected = data.clone();

        let receiver = tokio::spawn(async move {
            if let Some(Incoming::Channel(open)) = server_in.recv().await {
                let mut channel = open.accept().await;
                let mut got = Vec::new();
                channel.read_to_end(&mut got).await.unwrap();
                return got;
            }
            panic!("no channel");
        });

        let mut channel = client.open_channel("forward", b"bulk").await.unwrap();
        channel.write_all(&data).await.unwrap();
        channel.shutdown().await.unwrap();
        drop(channel);

        let got = receiver.await.unwrap();
        assert_eq!(got.len(), expected.len());
        assert_eq!(got, expected);
    }

    #[tokio::test]
    async fn test_close_unblocks_peer() {
        let (client, _client_in, server, mut server_in) = session_pair().await;

        let mut channel = client.open_channel("forward", b"x").await.unwrap();
        let open = match server_in.recv().await.unwrap() {
            Incoming::Channel(open) => open,
            other => panic!("unexpected: {:?}", other),
        };
        let mut server_chan = open.accept().await;

        client.close();
        client.closed().await;
        server.closed().await;

        let mut buf = [0u8; 4];
        assert_eq!(server_chan.read(&mut buf).await.unwrap(), 0);
        assert_eq!(channel.read(&mut buf).await.unwrap(), 0);
    }
}
