//! The inbound half of one remote: a local listener feeding the session.
//!
//! Per accepted connection: reserve a slot in the bounded pool (a full pool
//! drops the connection instead of queueing it), wait for an active session,
//! open a `forward` (or `socks`) channel carrying the remote's wire spec,
//! then pipe bytes until either side closes.

use super::{udp, SessionSource, TunnelError, CHANNEL_FORWARD, CHANNEL_SOCKS};
use crate::meter::{Meter, MeteredStream};
use crate::remote::{LocalEndpoint, Protocol, Remote};
use crate::session::Channel;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Default cap on in-flight forwarded connections per proxy.
pub const DEFAULT_CONNECTION_CAP: usize = 100;

/// Aggregate counters for one proxy.
#[derive(Debug, Default)]
pub struct ProxyStats {
    /// Connections accepted and handed a slot.
    pub total: AtomicU64,
    /// Connections currently in flight.
    pub active: AtomicU64,
    /// Connections dropped because the slot pool was full.
    pub rejected: AtomicU64,
    /// Connections that never reached a usable channel.
    pub failed: AtomicU64,
}

enum Listener {
    Tcp(TcpListener),
    Udp(UdpSocket),
    Stdio,
}

/// One local listener bound to one remote.
pub struct Proxy {
    id: usize,
    remote: Remote,
    source: Arc<dyn SessionSource>,
    listener: Listener,
    slots: Arc<Semaphore>,
    stats: Arc<ProxyStats>,
    meter: Arc<Meter>,
}

impl Proxy {
    /// Bind the local listener for `remote`. Bind failures are fatal to the
    /// whole `bind_remotes` call.
    pub async fn bind(
        source: Arc<dyn SessionSource>,
        index: usize,
        remote: Remote,
    ) -> Result<Self, TunnelError> {
        Self::bind_with_cap(source, index, remote, DEFAULT_CONNECTION_CAP).await
    }

    pub async fn bind_with_cap(
        source: Arc<dyn SessionSource>,
        index: usize,
        remote: Remote,
        cap: usize,
    ) -> Result<Self, TunnelError> {
        let listener = match (&remote.local, remote.protocol) {
            (LocalEndpoint::Stdio, _) => Listener::Stdio,
            (LocalEndpoint::Addr { .. }, Protocol::Tcp) => {
                let addr = remote.bind_addr().expect("addr endpoint");
                let listener = TcpListener::bind(&addr)
                    .await
                    .map_err(|e| TunnelError::Bind(format!("{}: {}", addr, e)))?;
                info!(proxy = index, remote = %remote, addr = %listener.local_addr()?, "listening");
                Listener::Tcp(listener)
            }
            (LocalEndpoint::Addr { .. }, Protocol::Udp) => {
                let addr = remote.bind_addr().expect("addr endpoint");
                let socket = UdpSocket::bind(&addr)
                    .await
                    .map_err(|e| TunnelError::Bind(format!("{}: {}", addr, e)))?;
                info!(proxy = index, remote = %remote, addr = %socket.local_addr()?, "listening");
                Listener::Udp(socket)
            }
        };

        Ok(Self {
            id: index,
            remote,
            source,
            listener,
            slots: Arc::new(Semaphore::new(cap)),
            stats: Arc::new(ProxyStats::default()),
            meter: Meter::new(format!("proxy#{}", index)),
        })
    }

    pub fn stats(&self) -> Arc<ProxyStats> {
        Arc::clone(&self.stats)
    }

    pub fn meter(&self) -> Arc<Meter> {
        Arc::clone(&self.meter)
    }

    /// The bound local address, for tcp/udp listeners.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.listener {
            Listener::Tcp(l) => l.local_addr().ok(),
            Listener::Udp(s) => s.local_addr().ok(),
            Listener::Stdio => None,
        }
    }

    /// Accept until cancellation or a listener failure. In-flight pipes are
    /// allowed to drain after cancellation.
    pub async fn run(self, cancel: &CancellationToken) -> Result<(), TunnelError> {
        let is_tcp = matches!(self.listener, Listener::Tcp(_));
        let is_udp = matches!(self.listener, Listener::Udp(_));
        if is_tcp {
            self.run_tcp(cancel).await
        } else if is_udp {
            self.run_udp(cancel).await
        } else {
            self.run_stdio(cancel).await
        }
    }

    async fn run_tcp(self, cancel: &CancellationToken) -> Result<(), TunnelError> {
        let listener = match &self.listener {
            Listener::Tcp(l) => l,
            _ => unreachable!(),
        };
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(proxy = self.id, "closed");
                    return Ok(());
                }
                accepted = listener.accept() => accepted,
            };
            let (stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    if cancel.is_cancelled() {
                        return Ok(());
                    }
                    info!(proxy = self.id, "accept error: {}", e);
                    return Err(e.into());
                }
            };

            let permit = match Arc::clone(&self.slots).try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    // full pool: drop immediately, never queue
                    self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                    debug!(proxy = self.id, %peer, "connection pool full, rejecting");
                    drop(stream);
                    continue;
                }
            };
            let _ = stream.set_nodelay(true);
            debug!(proxy = self.id, %peer, "open");

            let source = Arc::clone(&self.source);
            let remote = self.remote.clone();
            let stats = Arc::clone(&self.stats);
            let meter = Arc::clone(&self.meter);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                forward_conn(source, remote, stream, meter, stats, permit, cancel).await;
            });
        }
    }

    async fn run_udp(self, cancel: &CancellationToken) -> Result<(), TunnelError> {
        let socket = match self.listener {
            Listener::Udp(s) => s,
            _ => unreachable!(),
        };
        udp::run_listener(
            socket,
            self.remote,
            self.source,
            self.slots,
            self.stats,
            cancel,
        )
        .await
    }

    /// Stdio is a single logical connection, re-established per session so
    /// the pipe survives reconnects.
    async fn run_stdio(self, cancel: &CancellationToken) -> Result<(), TunnelError> {
        loop {
            if cancel.is_cancelled() {
                debug!(proxy = self.id, "closed");
                return Ok(());
            }
            let Some(session) = self.source.session(cancel).await else {
                continue;
            };
            let kind = if self.remote.socks {
                CHANNEL_SOCKS
            } else {
                CHANNEL_FORWARD
            };
            match session.open_channel(kind, self.remote.wire().as_bytes()).await {
                Ok(channel) => {
                    self.stats.total.fetch_add(1, Ordering::Relaxed);
                    let stdio = MeteredStream::new(crate::transport::stdio(), self.meter());
                    let (sent, received) = crate::pipe::pipe(stdio, channel).await;
                    debug!(proxy = self.id, sent, received, "stdio pipe closed");
                }
                Err(e) => {
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                    info!(proxy = self.id, "channel open failed: {}", e);
                }
            }
        }
    }
}

/// Pipe one accepted local stream over a fresh channel on the current
/// session, accounting traffic into the proxy's meter and stats.
async fn forward_conn<S>(
    source: Arc<dyn SessionSource>,
    remote: Remote,
    local: S,
    meter: Arc<Meter>,
    stats: Arc<ProxyStats>,
    permit: OwnedSemaphorePermit,
    cancel: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let _permit = permit;
    stats.total.fetch_add(1, Ordering::Relaxed);
    stats.active.fetch_add(1, Ordering::Relaxed);

    let result = async {
        let Some(session) = source.session(&cancel).await else {
            debug!("no session for forwarded connection");
            return Err(());
        };
        let kind = if remote.socks {
            CHANNEL_SOCKS
        } else {
            CHANNEL_FORWARD
        };
        let channel: Channel = session
            .open_channel(kind, remote.wire().as_bytes())
            .await
            .map_err(|e| {
                info!("channel open failed: {}", e);
            })?;
        let metered = MeteredStream::new(local, meter);
        let (sent, received) = crate::pipe::pipe(metered, channel).await;
        debug!(sent, received, "close");
        Ok(())
    }
    .await;

    if result.is_err() {
        stats.failed.fetch_add(1, Ordering::Relaxed);
    }
    stats.active.fetch_sub(1, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;
    use async_trait::async_trait;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;

    /// A source that never produces a session: callers stay parked on the
    /// latch until cancellation.
    struct NeverSource;

    #[async_trait]
    impl SessionSource for NeverSource {
        async fn session(&self, cancel: &CancellationToken) -> Option<Session> {
            cancel.cancelled().await;
            None
        }

        fn is_inbound(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn test_bind_and_local_addr() {
        let remote = Remote::parse("127.0.0.1:0:127.0.0.1:9000").unwrap();
        let proxy = Proxy::bind(Arc::new(NeverSource), 0, remote).await.unwrap();
        let addr = proxy.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn test_bind_conflict_is_fatal() {
        let remote = Remote::parse("127.0.0.1:0:127.0.0.1:9000").unwrap();
        let proxy = Proxy::bind(Arc::new(NeverSource), 0, remote).await.unwrap();
        let addr = proxy.local_addr().unwrap();

        let taken = Remote::parse(&format!("127.0.0.1:{}:127.0.0.1:9000", addr.port())).unwrap();
        let err = Proxy::bind(Arc::new(NeverSource), 1, taken).await;
        assert!(matches!(err, Err(TunnelError::Bind(_))));
    }

    #[tokio::test]
    async fn test_slot_pool_rejects_overflow() {
        let remote = Remote::parse("127.0.0.1:0:127.0.0.1:9000").unwrap();
        let proxy = Proxy::bind_with_cap(Arc::new(NeverSource), 0, remote, 2)
            .await
            .unwrap();
        let addr = proxy.local_addr().unwrap();
        let stats = proxy.stats();

        let cancel = CancellationToken::new();
        let run_cancel = cancel.clone();
        let runner = tokio::spawn(async move { proxy.run(&run_cancel).await });

        // the NeverSource keeps slot holders parked inside `session()`,
        // so connections beyond the cap get dropped on accept
        let mut held = Vec::new();
        for _ in 0..2 {
            held.push(TcpStream::connect(addr).await.unwrap());
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let mut extra = TcpStream::connect(addr).await.unwrap();
        // the rejected socket is closed by the proxy: writes eventually fail
        let mut dead = false;
        for _ in 0..50 {
            if extra.write_all(b"x").await.is_err() {
                dead = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(dead, "overflow connection was not dropped");
        assert_eq!(stats.rejected.load(Ordering::Relaxed), 1);
        assert_eq!(stats.total.load(Ordering::Relaxed), 2);

        cancel.cancel();
        runner.await.unwrap().unwrap();
    }
}
