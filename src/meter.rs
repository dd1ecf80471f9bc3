//! In-path traffic metering.
//!
//! A [`Meter`] sits in the byte path of a proxy and counts sent/received
//! bytes with atomics. When debug logging is enabled it periodically emits
//! a throughput sample; the sampler is single-flighted so the hot path only
//! ever pays for a compare-and-swap.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::debug;

/// Sampling window for throughput reports.
const SAMPLE_WINDOW: Duration = Duration::from_secs(1);

/// Byte counters for one traffic path.
pub struct Meter {
    label: String,
    start: Instant,
    sent: AtomicU64,
    recv: AtomicU64,
    last_sent: AtomicU64,
    last_recv: AtomicU64,
    last_ns: AtomicU64,
    sampling: AtomicBool,
}

impl Meter {
    pub fn new(label: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            label: label.into(),
            start: Instant::now(),
            sent: AtomicU64::new(0),
            recv: AtomicU64::new(0),
            last_sent: AtomicU64::new(0),
            last_recv: AtomicU64::new(0),
            last_ns: AtomicU64::new(0),
            sampling: AtomicBool::new(false),
        })
    }

    pub fn add_sent(self: &Arc<Self>, n: u64) {
        self.sent.fetch_add(n, Ordering::Relaxed);
        self.sample();
    }

    pub fn add_recv(self: &Arc<Self>, n: u64) {
        self.recv.fetch_add(n, Ordering::Relaxed);
        self.sample();
    }

    /// Total (sent, received) bytes so far.
    pub fn totals(&self) -> (u64, u64) {
        (
            self.sent.load(Ordering::Relaxed),
            self.recv.load(Ordering::Relaxed),
        )
    }

    fn sample(self: &Arc<Self>) {
        if !tracing::enabled!(tracing::Level::DEBUG) {
            return;
        }
        // single-flight: move the report off the read/write path
        if self
            .sampling
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let meter = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(SAMPLE_WINDOW).await;
                meter.report();
                meter.sampling.store(false, Ordering::Release);
            });
        }
    }

    fn report(&self) {
        let sent = self.sent.load(Ordering::Relaxed);
        let recv = self.recv.load(Ordering::Relaxed);
        let now_ns = self.start.elapsed().as_nanos() as u64;
        let last_ns = self.last_ns.swap(now_ns, Ordering::Relaxed);
        let dt = Duration::from_nanos(now_ns.saturating_sub(last_ns));

        let dsent = sent - self.last_sent.swap(sent, Ordering::Relaxed);
        let drecv = recv - self.last_recv.swap(recv, Ordering::Relaxed);

        if last_ns > 0 && !dt.is_zero() && (dsent > 0 || drecv > 0) {
            let per_sec = |d: u64| (d as f64 / dt.as_secs_f64()) as u64;
            debug!(
                target: "veil_tunnel::meter",
                "{}: write {}/s read {}/s",
                self.label,
                human_bytes(per_sec(dsent)),
                human_bytes(per_sec(drecv)),
            );
        }
    }
}

fn human_bytes(n: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = n as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{}{}", n, UNITS[0])
    } else {
        format!("{:.1}{}", value, UNITS[unit])
    }
}

/// A stream wrapper feeding a [`Meter`]: reads count as received, writes as
/// sent.
pub struct MeteredStream<S> {
    inner: S,
    meter: Arc<Meter>,
}

impl<S> MeteredStream<S> {
    pub fn new(inner: S, meter: Arc<Meter>) -> Self {
        Self { inner, meter }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for MeteredStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let res = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = res {
            this.meter.add_recv((buf.filled().len() - before) as u64);
        }
        res
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for MeteredStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let res = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = res {
            this.meter.add_sent(n as u64);
        }
        res
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_human_bytes() {
        assert_eq!(human_bytes(512), "512B");
        assert_eq!(human_bytes(2048), "2.0KB");
        assert_eq!(human_bytes(3 * 1024 * 1024), "3.0MB");
    }

    #[tokio::test]
    async fn test_metered_stream_counts() {
        let meter = Meter::new("test");
        let (a, mut far) = tokio::io::duplex(1024);
        let mut metered = MeteredStream::new(a, Arc::clone(&meter));

        metered.write_all(b"12345").await.unwrap();
        far.write_all(b"abc").await.unwrap();

        let mut buf = [0u8; 3];
        metered.read_exact(&mut buf).await.unwrap();

        let (sent, recv) = meter.totals();
        assert_eq!(sent, 5);
        assert_eq!(recv, 3);
    }
}
