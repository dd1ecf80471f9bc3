//! Bidirectional byte pump.
//!
//! Copies bytes between two stream endpoints until either side ends, then
//! closes both so the opposite direction unblocks. Multiplexed channels must
//! not leak half-open states into local sockets, and neither endpoint is
//! privileged: whichever direction finishes first trips a shared once-latch.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_util::sync::CancellationToken;

const COPY_BUFFER: usize = 16 * 1024;

/// Copy bytes in both directions between `a` and `b` concurrently.
///
/// Returns `(a_to_b, b_to_a)` byte counts. On the first EOF or error in
/// either direction both endpoints are shut down (at most once) and the
/// call returns only after both copies have finished.
pub async fn pipe<A, B>(a: A, b: B) -> (u64, u64)
where
    A: AsyncRead + AsyncWrite + Send,
    B: AsyncRead + AsyncWrite + Send,
{
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);
    let stop = CancellationToken::new();

    tokio::join!(
        copy_direction(a_read, b_write, stop.clone()),
        copy_direction(b_read, a_write, stop.clone()),
    )
}

async fn copy_direction<R, W>(
    mut src: ReadHalf<R>,
    mut dst: WriteHalf<W>,
    stop: CancellationToken,
) -> u64
where
    R: AsyncRead + Send,
    W: AsyncWrite + Send,
{
    let mut buf = vec![0u8; COPY_BUFFER];
    let mut total: u64 = 0;

    loop {
        let n = tokio::select! {
            _ = stop.cancelled() => break,
            res = src.read(&mut buf) => match res {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            },
        };
        let written = tokio::select! {
            _ = stop.cancelled() => break,
            res = dst.write_all(&buf[..n]) => res.is_ok(),
        };
        if !written || dst.flush().await.is_err() {
            break;
        }
        total += n as u64;
    }

    let _ = dst.shutdown().await;
    stop.cancel();
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_pipe_both_directions() {
        // a <-> b piped; far ends drive the traffic
        let (a, mut a_far) = duplex(1024);
        let (b, mut b_far) = duplex(1024);

        let piper = tokio::spawn(pipe(a, b));

        a_far.write_all(b"ping->").await.unwrap();
        let mut buf = [0u8; 6];
        b_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping->");

        b_far.write_all(b"<-pong").await.unwrap();
        a_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"<-pong");

        // closing one far end unwinds the whole pipe
        drop(a_far);
        let (a_to_b, b_to_a) = piper.await.unwrap();
        assert_eq!(a_to_b, 6);
        assert_eq!(b_to_a, 6);
    }

    #[tokio::test]
    async fn test_pipe_close_propagates() {
        let (a, a_far) = duplex(1024);
        let (b, mut b_far) = duplex(1024);

        let piper = tokio::spawn(pipe(a, b));
        drop(a_far);

        // the b side observes EOF rather than hanging
        let mut buf = [0u8; 1];
        let n = b_far.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
        piper.await.unwrap();
    }

    #[tokio::test]
    async fn test_pipe_counts_large_transfer() {
        let (a, mut a_far) = duplex(64 * 1024);
        let (b, mut b_far) = duplex(64 * 1024);

        let piper = tokio::spawn(pipe(a, b));
        let payload: Vec<u8> = (0..100_000).map(|i| (i % 256) as u8).collect();
        let expected = payload.clone();

        let writer = tokio::spawn(async move {
            a_far.write_all(&payload).await.unwrap();
            a_far.shutdown().await.unwrap();
        });

        let mut got = Vec::new();
        b_far.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, expected);

        writer.await.unwrap();
        let (a_to_b, _) = piper.await.unwrap();
        assert_eq!(a_to_b, 100_000);
    }
}
