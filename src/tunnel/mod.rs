//! The tunnel: owner of the active session and its proxies.
//!
//! Both the client and the server hold a [`Tunnel`]. The client has a single
//! set of remotes; the server builds one tunnel per connected client. Each
//! remote maps 1:1 to a [`Proxy`]; proxies listen locally and open logical
//! channels on whatever session is currently bound, and the peer's tunnel
//! routes those channel opens to the described targets.
//!
//! A tunnel is bound to at most one session at a time. While no session is
//! bound, [`SessionSource::session`] parks callers on a latch that re-arms
//! every time a session ends, so accepted connections ride out reconnects
//! up to a bounded wait.

mod proxy;
mod socks;
mod udp;

pub use proxy::{Proxy, ProxyStats};

use crate::config::env_duration;
use crate::remote::{Protocol, Remote};
use crate::session::{Incoming, IncomingChannel, IncomingRequest, Session};
use async_trait::async_trait;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Channel kind used for forwarded connections.
pub const CHANNEL_FORWARD: &str = "forward";
/// Channel kind routed into the SOCKS backend.
pub const CHANNEL_SOCKS: &str = "socks";
/// Request name for keepalive probes.
pub const REQUEST_PING: &str = "ping";
/// Request name carrying the forwarding config.
pub const REQUEST_CONFIG: &str = "config";

/// Keepalive jitter fraction: intervals land in `K·(1±j)`.
const KEEPALIVE_JITTER: f64 = 0.3;
/// Dial budget for targets of incoming forward channels.
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
/// Default bounded wait for a session to become active.
const DEFAULT_SESSION_WAIT: Duration = Duration::from_secs(35);

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("bind failed: {0}")]
    Bind(String),

    #[error("no remotes")]
    NoRemotes,

    #[error("inbound connections blocked")]
    InboundBlocked,

    #[error("session already bound")]
    AlreadyBound,

    #[error("session error: {0}")]
    Session(#[from] crate::session::SessionError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Static behavior switches for one tunnel.
#[derive(Debug, Clone)]
pub struct TunnelOptions {
    /// May bind local proxies (`bind_remotes`).
    pub inbound: bool,
    /// Accepts incoming forward channels and dials on the peer's behalf.
    pub outbound: bool,
    /// Routes `socks` channels into the embedded SOCKS5 backend.
    pub socks: bool,
    /// Keepalive interval; zero disables the ping loop.
    pub keepalive: Duration,
}

impl Default for TunnelOptions {
    fn default() -> Self {
        Self {
            inbound: true,
            outbound: true,
            socks: false,
            keepalive: Duration::ZERO,
        }
    }
}

/// Read-only view of a tunnel handed to proxies: the current session and
/// the inbound flag, nothing else.
#[async_trait]
pub trait SessionSource: Send + Sync {
    /// The active session, waiting up to the bounded latch timeout for one
    /// to appear. `None` after cancellation or timeout.
    async fn session(&self, cancel: &CancellationToken) -> Option<Session>;

    fn is_inbound(&self) -> bool;
}

/// Container of the current session and the proxies using it.
pub struct Tunnel {
    opts: TunnelOptions,
    current: watch::Sender<Option<Session>>,
    started: Instant,
    activity_ns: AtomicU64,
}

impl Tunnel {
    pub fn new(opts: TunnelOptions) -> Arc<Self> {
        let (current, _) = watch::channel(None);
        debug!(
            inbound = opts.inbound,
            outbound = opts.outbound,
            socks = opts.socks,
            "tunnel created"
        );
        Arc::new(Self {
            opts,
            current,
            started: Instant::now(),
            activity_ns: AtomicU64::new(0),
        })
    }

    fn touch(&self) {
        self.activity_ns
            .store(self.started.elapsed().as_nanos() as u64, Ordering::Relaxed);
    }

    /// Time since the peer last showed signs of life.
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_nanos(self.activity_ns.load(Ordering::Relaxed));
        self.started.elapsed().saturating_sub(last)
    }

    /// Bind an established session to this tunnel and block until it ends.
    ///
    /// Publishes the session to waiting proxies, starts the keepalive loop,
    /// and routes the session's incoming requests and channels. On return
    /// the stored session is cleared and the latch re-arms.
    pub async fn bind_session(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        session: Session,
        mut incoming: mpsc::UnboundedReceiver<Incoming>,
    ) -> Result<(), TunnelError> {
        if self.current.borrow().is_some() {
            return Err(TunnelError::AlreadyBound);
        }
        self.current.send_replace(Some(session.clone()));

        // cancellation closes the session, which unwinds everything below
        let watchdog = {
            let cancel = cancel.clone();
            let session = session.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("session cancelled");
                        session.close();
                    }
                    _ = session.closed() => {}
                }
            })
        };

        if !self.opts.keepalive.is_zero() {
            tokio::spawn(keepalive_loop(session.clone(), self.opts.keepalive));
        }

        debug!("session bound");
        while let Some(event) = incoming.recv().await {
            match event {
                Incoming::Request(request) => self.handle_request(request).await,
                Incoming::Channel(open) => {
                    let tunnel = Arc::clone(self);
                    tokio::spawn(async move { tunnel.handle_channel(open).await });
                }
            }
        }
        session.closed().await;

        self.current.send_replace(None);
        let _ = watchdog.await;
        debug!("session unbound");
        Ok(())
    }

    /// Convert remotes into proxies and block until cancellation or the
    /// first proxy error. Every listener binds before any proxy runs.
    pub async fn bind_remotes(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        remotes: &[Remote],
    ) -> Result<(), TunnelError> {
        if remotes.is_empty() {
            return Err(TunnelError::NoRemotes);
        }
        if !self.opts.inbound {
            return Err(TunnelError::InboundBlocked);
        }

        let mut proxies = Vec::with_capacity(remotes.len());
        for (index, remote) in remotes.iter().enumerate() {
            let source: Arc<dyn SessionSource> = Arc::clone(self) as _;
            proxies.push(Proxy::bind(source, index, remote.clone()).await?);
        }

        let scope = cancel.child_token();
        let mut set = JoinSet::new();
        for proxy in proxies {
            let scope = scope.clone();
            set.spawn(async move { proxy.run(&scope).await });
        }
        debug!("bound proxies");

        let mut first_err = None;
        while let Some(joined) = set.join_next().await {
            let result = match joined {
                Ok(result) => result,
                Err(e) => Err(TunnelError::Bind(format!("proxy task: {}", e))),
            };
            if let Err(e) = result {
                if first_err.is_none() {
                    first_err = Some(e);
                }
                // one failing proxy drains the rest
                scope.cancel();
            }
        }
        debug!("unbound proxies");
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn handle_request(&self, request: IncomingRequest) {
        match request.name.as_str() {
            REQUEST_PING => {
                self.touch();
                request.accept(b"pong").await;
            }
            other => {
                debug!(name = other, "unsupported request");
                request.reject(b"unsupported request").await;
            }
        }
    }

    async fn handle_channel(&self, open: IncomingChannel) {
        match open.kind.as_str() {
            CHANNEL_FORWARD if self.opts.outbound => {
                let spec = String::from_utf8_lossy(&open.payload).to_string();
                match Remote::parse(&spec) {
                    Ok(remote) => self.dial_forward(open, remote).await,
                    Err(e) => {
                        debug!(%spec, "bad forward spec: {}", e);
                        open.reject(&format!("bad remote spec: {}", e)).await;
                    }
                }
            }
            CHANNEL_FORWARD => {
                open.reject("outbound connections blocked").await;
            }
            CHANNEL_SOCKS if self.opts.socks => {
                let channel = open.accept().await;
                if let Err(e) = socks::serve(channel).await {
                    debug!("socks session ended: {}", e);
                }
            }
            CHANNEL_SOCKS => {
                open.reject("socks disabled").await;
            }
            other => {
                debug!(kind = other, "unknown channel type");
                open.reject("unknown channel type").await;
            }
        }
    }

    async fn dial_forward(&self, open: IncomingChannel, remote: Remote) {
        let target = remote.target();
        match remote.protocol {
            Protocol::Tcp => {
                let dial = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&target)).await;
                match dial {
                    Ok(Ok(stream)) => {
                        let _ = stream.set_nodelay(true);
                        debug!(%target, "forward target connected");
                        let channel = open.accept().await;
                        let (sent, received) = crate::pipe::pipe(channel, stream).await;
                        debug!(%target, sent, received, "forward closed");
                    }
                    Ok(Err(e)) => {
                        debug!(%target, "dial failed: {}", e);
                        open.reject(&e.to_string()).await;
                    }
                    Err(_) => {
                        debug!(%target, "dial timeout");
                        open.reject("dial timeout").await;
                    }
                }
            }
            Protocol::Udp => match udp::dial(&target).await {
                Ok(socket) => {
                    debug!(%target, "udp forward target bound");
                    let channel = open.accept().await;
                    udp::relay_connected(channel, socket).await;
                    debug!(%target, "udp forward closed");
                }
                Err(e) => {
                    debug!(%target, "udp dial failed: {}", e);
                    open.reject(&e.to_string()).await;
                }
            },
        }
    }
}

#[async_trait]
impl SessionSource for Tunnel {
    async fn session(&self, cancel: &CancellationToken) -> Option<Session> {
        if cancel.is_cancelled() {
            return None;
        }
        let mut rx = self.current.subscribe();
        let existing = rx.borrow().clone();
        if existing.is_some() {
            return existing;
        }

        let wait = env_duration("VEIL_SESSION_WAIT", DEFAULT_SESSION_WAIT);
        let deadline = tokio::time::sleep(wait);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = &mut deadline => return None,
                changed = rx.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                    let current = rx.borrow().clone();
                    if current.is_some() {
                        return current;
                    }
                }
            }
        }
    }

    fn is_inbound(&self) -> bool {
        self.opts.inbound
    }
}

/// Ping the peer at randomized intervals; close the session on the first
/// failed or malformed reply. The RNG is seeded per session, never shared.
async fn keepalive_loop(session: Session, interval: Duration) {
    let mut seed = [0u8; 32];
    crate::crypto::random_bytes(&mut seed);
    let mut rng = SmallRng::from_seed(seed);
    loop {
        let pause = jittered_interval(interval, &mut rng);
        tokio::select! {
            _ = session.closed() => return,
            _ = tokio::time::sleep(pause) => {}
        }
        let reply = tokio::select! {
            _ = session.closed() => return,
            reply = session.send_request(REQUEST_PING, b"") => reply,
        };
        match reply {
            Ok(body) if body.is_empty() || &body[..] == b"pong" => {}
            Ok(_) => {
                debug!("strange ping response");
                break;
            }
            Err(e) => {
                debug!("keepalive failed: {}", e);
                break;
            }
        }
    }
    warn!("keepalive lost, closing session");
    session.close();
}

/// One keepalive pause: `interval · (1 ± KEEPALIVE_JITTER)` with a lower
/// clamp of a tenth of the interval.
fn jittered_interval(interval: Duration, rng: &mut impl Rng) -> Duration {
    let base = interval.as_secs_f64();
    let jitter = (rng.gen::<f64>() * 2.0 - 1.0) * base * KEEPALIVE_JITTER;
    Duration::from_secs_f64((base + jitter).max(base * 0.1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jitter_bounds() {
        let mut rng = SmallRng::seed_from_u64(7);
        let base = Duration::from_secs(10);
        for _ in 0..10_000 {
            let d = jittered_interval(base, &mut rng);
            assert!(d >= Duration::from_secs_f64(10.0 * (1.0 - KEEPALIVE_JITTER) - 1e-9));
            assert!(d <= Duration::from_secs_f64(10.0 * (1.0 + KEEPALIVE_JITTER) + 1e-9));
            assert!(d >= Duration::from_secs(1));
        }
    }

    #[tokio::test]
    async fn test_session_source_times_out() {
        std::env::set_var("VEIL_SESSION_WAIT", "1");
        let tunnel = Tunnel::new(TunnelOptions::default());
        let cancel = CancellationToken::new();
        let started = std::time::Instant::now();
        assert!(tunnel.session(&cancel).await.is_none());
        assert!(started.elapsed() >= Duration::from_secs(1));
        std::env::remove_var("VEIL_SESSION_WAIT");
    }

    #[tokio::test]
    async fn test_session_source_cancelled() {
        let tunnel = Tunnel::new(TunnelOptions::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(tunnel.session(&cancel).await.is_none());
    }

    #[tokio::test]
    async fn test_bind_remotes_requires_inbound() {
        let tunnel = Tunnel::new(TunnelOptions {
            inbound: false,
            ..Default::default()
        });
        let cancel = CancellationToken::new();
        let remotes = vec![Remote::parse("127.0.0.1:1:127.0.0.1:1").unwrap()];
        assert!(matches!(
            tunnel.bind_remotes(&cancel, &remotes).await,
            Err(TunnelError::InboundBlocked)
        ));
        assert!(matches!(
            tunnel.bind_remotes(&cancel, &[]).await,
            Err(TunnelError::NoRemotes)
        ));
    }
}
