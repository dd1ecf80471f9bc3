//! UDP endpoints.
//!
//! A UDP listener shares the TCP proxy's contract: per-peer virtual
//! connections, slot-pool backpressure, one channel per peer. Datagrams
//! cross the channel as `u16 BE length + payload` records so boundaries
//! survive the byte stream. Virtual connections expire after an idle
//! period; overflowing queues drop datagrams, as UDP callers expect.

use super::{ProxyStats, SessionSource, TunnelError, CHANNEL_FORWARD};
use crate::remote::Remote;
use crate::session::Channel;
use bytes::Bytes;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Largest datagram carried over a channel.
const UDP_BUFFER: usize = 65536;
/// Idle period after which a virtual connection is torn down.
const UDP_IDLE: Duration = Duration::from_secs(60);
/// Queued datagrams per virtual connection.
const PEER_QUEUE: usize = 64;

/// Bind and connect a socket toward a dial target.
pub(crate) async fn dial(target: &str) -> io::Result<UdpSocket> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(target).await?;
    Ok(socket)
}

/// Relay between a connected UDP socket and a channel until close or idle.
pub(crate) async fn relay_connected(channel: Channel, socket: UdpSocket) {
    let socket = Arc::new(socket);
    let (mut chan_read, mut chan_write) = tokio::io::split(channel);
    let stop = CancellationToken::new();

    let inbound = {
        let socket = Arc::clone(&socket);
        let stop = stop.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; UDP_BUFFER];
            loop {
                let n = tokio::select! {
                    _ = stop.cancelled() => break,
                    read = read_datagram(&mut chan_read, &mut buf) => match read {
                        Ok(Some(n)) => n,
                        _ => break,
                    },
                };
                if socket.send(&buf[..n]).await.is_err() {
                    break;
                }
            }
            stop.cancel();
        })
    };

    let outbound = {
        let stop = stop.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; UDP_BUFFER];
            loop {
                let received = tokio::select! {
                    _ = stop.cancelled() => break,
                    received = tokio::time::timeout(UDP_IDLE, socket.recv(&mut buf)) => received,
                };
                match received {
                    Ok(Ok(n)) => {
                        if write_datagram(&mut chan_write, &buf[..n]).await.is_err() {
                            break;
                        }
                    }
                    // idle expiry or socket error
                    _ => break,
                }
            }
            let _ = chan_write.shutdown().await;
            stop.cancel();
        })
    };

    let _ = tokio::join!(inbound, outbound);
}

/// Accept loop for a local UDP listener: demux datagrams by source address
/// into per-peer virtual connections.
pub(crate) async fn run_listener(
    socket: UdpSocket,
    remote: Remote,
    source: Arc<dyn SessionSource>,
    slots: Arc<Semaphore>,
    stats: Arc<ProxyStats>,
    cancel: &CancellationToken,
) -> Result<(), TunnelError> {
    let socket = Arc::new(socket);
    let mut peers: HashMap<SocketAddr, mpsc::Sender<Bytes>> = HashMap::new();
    let (gone_tx, mut gone_rx) = mpsc::unbounded_channel::<SocketAddr>();
    let mut buf = vec![0u8; UDP_BUFFER];

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("udp listener closed");
                return Ok(());
            }
            Some(peer) = gone_rx.recv() => {
                peers.remove(&peer);
            }
            received = socket.recv_from(&mut buf) => {
                let (n, peer) = match received {
                    Ok(pair) => pair,
                    Err(e) => {
                        if cancel.is_cancelled() {
                            return Ok(());
                        }
                        return Err(e.into());
                    }
                };
                let datagram = Bytes::copy_from_slice(&buf[..n]);

                if let Some(tx) = peers.get(&peer) {
                    // full queue drops the datagram, like any UDP hop
                    let _ = tx.try_send(datagram);
                    continue;
                }

                let permit = match Arc::clone(&slots).try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        stats.rejected.fetch_add(1, Ordering::Relaxed);
                        debug!(%peer, "udp pool full, dropping");
                        continue;
                    }
                };
                stats.total.fetch_add(1, Ordering::Relaxed);

                let (tx, rx) = mpsc::channel(PEER_QUEUE);
                let _ = tx.try_send(datagram);
                peers.insert(peer, tx);

                let conn = PeerConn {
                    source: Arc::clone(&source),
                    remote: remote.clone(),
                    socket: Arc::clone(&socket),
                    peer,
                    stats: Arc::clone(&stats),
                    gone: gone_tx.clone(),
                    cancel: cancel.clone(),
                };
                tokio::spawn(conn.run(rx, permit));
            }
        }
    }
}

/// One virtual UDP connection: a peer address paired with a channel.
struct PeerConn {
    source: Arc<dyn SessionSource>,
    remote: Remote,
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    stats: Arc<ProxyStats>,
    gone: mpsc::UnboundedSender<SocketAddr>,
    cancel: CancellationToken,
}

impl PeerConn {
    async fn run(self, mut rx: mpsc::Receiver<Bytes>, permit: OwnedSemaphorePermit) {
        let _permit = permit;
        self.stats.active.fetch_add(1, Ordering::Relaxed);

        let channel = match self.open().await {
            Some(channel) => channel,
            None => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                self.stats.active.fetch_sub(1, Ordering::Relaxed);
                let _ = self.gone.send(self.peer);
                return;
            }
        };

        let (mut chan_read, mut chan_write) = tokio::io::split(channel);
        let stop = CancellationToken::new();

        let inbound = {
            let socket = Arc::clone(&self.socket);
            let peer = self.peer;
            let stop = stop.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; UDP_BUFFER];
                loop {
                    let n = tokio::select! {
                        _ = stop.cancelled() => break,
                        read = read_datagram(&mut chan_read, &mut buf) => match read {
                            Ok(Some(n)) => n,
                            _ => break,
                        },
                    };
                    if socket.send_to(&buf[..n], peer).await.is_err() {
                        break;
                    }
                }
                stop.cancel();
            })
        };

        let outbound = {
            let stop = stop.clone();
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                loop {
                    let received = tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = cancel.cancelled() => break,
                        received = tokio::time::timeout(UDP_IDLE, rx.recv()) => received,
                    };
                    match received {
                        Ok(Some(datagram)) => {
                            if write_datagram(&mut chan_write, &datagram).await.is_err() {
                                break;
                            }
                        }
                        // listener dropped us or the peer went idle
                        _ => break,
                    }
                }
                let _ = chan_write.shutdown().await;
                stop.cancel();
            })
        };

        let _ = tokio::join!(inbound, outbound);
        self.stats.active.fetch_sub(1, Ordering::Relaxed);
        let _ = self.gone.send(self.peer);
        debug!(peer = %self.peer, "udp connection expired");
    }

    async fn open(&self) -> Option<Channel> {
        let session = self.source.session(&self.cancel).await?;
        match session
            .open_channel(CHANNEL_FORWARD, self.remote.wire().as_bytes())
            .await
        {
            Ok(channel) => Some(channel),
            Err(e) => {
                debug!(peer = %self.peer, "udp channel open failed: {}", e);
                None
            }
        }
    }
}

/// Write one datagram as a length-prefixed record.
pub(crate) async fn write_datagram<W: AsyncWrite + Unpin>(
    writer: &mut W,
    data: &[u8],
) -> io::Result<()> {
    let mut buf = Vec::with_capacity(2 + data.len());
    buf.extend_from_slice(&(data.len() as u16).to_be_bytes());
    buf.extend_from_slice(data);
    writer.write_all(&buf).await?;
    writer.flush().await
}

/// Read one length-prefixed datagram. `Ok(None)` on clean EOF.
pub(crate) async fn read_datagram<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
) -> io::Result<Option<usize>> {
    let mut len_buf = [0u8; 2];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let n = u16::from_be_bytes(len_buf) as usize;
    reader.read_exact(&mut buf[..n]).await?;
    Ok(Some(n))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_datagram_framing_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(4096);

        write_datagram(&mut a, b"first").await.unwrap();
        write_datagram(&mut a, b"").await.unwrap();
        write_datagram(&mut a, b"second").await.unwrap();
        drop(a);

        let mut buf = vec![0u8; UDP_BUFFER];
        assert_eq!(read_datagram(&mut b, &mut buf).await.unwrap(), Some(5));
        assert_eq!(&buf[..5], b"first");
        assert_eq!(read_datagram(&mut b, &mut buf).await.unwrap(), Some(0));
        assert_eq!(read_datagram(&mut b, &mut buf).await.unwrap(), Some(6));
        assert_eq!(&buf[..6], b"second");
        assert_eq!(read_datagram(&mut b, &mut buf).await.unwrap(), None);
    }
}
