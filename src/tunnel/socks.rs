//! Minimal SOCKS5 backend served over accepted `socks` channels.
//!
//! Supports the no-auth method and the CONNECT command; that is what the
//! tunnel's own proxies emit. The backend never listens on a port of its
//! own, it only speaks over channels handed to it by the tunnel.

use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

const SOCKS_VERSION: u8 = 0x05;
const CMD_CONNECT: u8 = 0x01;
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

const REPLY_SUCCESS: u8 = 0x00;
const REPLY_HOST_UNREACHABLE: u8 = 0x04;
const REPLY_CMD_NOT_SUPPORTED: u8 = 0x07;
const REPLY_ADDR_NOT_SUPPORTED: u8 = 0x08;

/// Serve one SOCKS5 session over `stream`.
pub(crate) async fn serve<S>(mut stream: S) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let mut buf = [0u8; 262];

    // greeting: version + method list
    stream.read_exact(&mut buf[..2]).await?;
    if buf[0] != SOCKS_VERSION {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported socks version {}", buf[0]),
        ));
    }
    let nmethods = buf[1] as usize;
    stream.read_exact(&mut buf[..nmethods]).await?;
    stream.write_all(&[SOCKS_VERSION, 0x00]).await?;

    // request: version, command, reserved, address type
    stream.read_exact(&mut buf[..4]).await?;
    let cmd = buf[1];
    let addr_type = buf[3];
    if cmd != CMD_CONNECT {
        reply(&mut stream, REPLY_CMD_NOT_SUPPORTED).await?;
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported socks command {}", cmd),
        ));
    }

    let target = match addr_type {
        0x01 => {
            let mut ip = [0u8; 4];
            stream.read_exact(&mut ip).await?;
            let port = read_port(&mut stream).await?;
            format!("{}.{}.{}.{}:{}", ip[0], ip[1], ip[2], ip[3], port)
        }
        0x03 => {
            stream.read_exact(&mut buf[..1]).await?;
            let len = buf[0] as usize;
            stream.read_exact(&mut buf[..len]).await?;
            let domain = String::from_utf8_lossy(&buf[..len]).to_string();
            let port = read_port(&mut stream).await?;
            format!("{}:{}", domain, port)
        }
        0x04 => {
            let mut ip = [0u8; 16];
            stream.read_exact(&mut ip).await?;
            let port = read_port(&mut stream).await?;
            format!("[{}]:{}", std::net::Ipv6Addr::from(ip), port)
        }
        other => {
            reply(&mut stream, REPLY_ADDR_NOT_SUPPORTED).await?;
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported address type {}", other),
            ));
        }
    };

    debug!(%target, "socks connect");
    let dial = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&target)).await;
    let remote = match dial {
        Ok(Ok(remote)) => remote,
        Ok(Err(e)) => {
            reply(&mut stream, REPLY_HOST_UNREACHABLE).await?;
            return Err(e);
        }
        Err(_) => {
            reply(&mut stream, REPLY_HOST_UNREACHABLE).await?;
            return Err(io::ErrorKind::TimedOut.into());
        }
    };
    let _ = remote.set_nodelay(true);
    reply(&mut stream, REPLY_SUCCESS).await?;

    let (sent, received) = crate::pipe::pipe(stream, remote).await;
    debug!(%target, sent, received, "socks closed");
    Ok(())
}

async fn read_port<S: AsyncRead + Unpin>(stream: &mut S) -> io::Result<u16> {
    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    Ok(u16::from_be_bytes(port))
}

async fn reply<S: AsyncWrite + Unpin>(stream: &mut S, code: u8) -> io::Result<()> {
    stream
        .write_all(&[SOCKS_VERSION, code, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
        .await?;
    stream.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_socks_connect_roundtrip() {
        // target echo server
        let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut conn, _) = echo.accept().await.unwrap();
            let mut buf = [0u8; 4];
            conn.read_exact(&mut buf).await.unwrap();
            conn.write_all(&buf).await.unwrap();
        });

        let (client, backend) = tokio::io::duplex(4096);
        tokio::spawn(serve(backend));

        let mut client = client;
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut greeting = [0u8; 2];
        client.read_exact(&mut greeting).await.unwrap();
        assert_eq!(greeting, [0x05, 0x00]);

        // CONNECT 127.0.0.1:echo_port
        let mut request = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
        request.extend_from_slice(&echo_addr.port().to_be_bytes());
        client.write_all(&request).await.unwrap();

        let mut response = [0u8; 10];
        client.read_exact(&mut response).await.unwrap();
        assert_eq!(response[1], REPLY_SUCCESS);

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_socks_rejects_bind_command() {
        let (client, backend) = tokio::io::duplex(4096);
        let server = tokio::spawn(serve(backend));

        let mut client = client;
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut greeting = [0u8; 2];
        client.read_exact(&mut greeting).await.unwrap();

        // BIND is not supported
        client
            .write_all(&[0x05, 0x02, 0x00, 0x01, 0, 0, 0, 0, 0, 80])
            .await
            .unwrap();
        let mut response = [0u8; 10];
        client.read_exact(&mut response).await.unwrap();
        assert_eq!(response[1], REPLY_CMD_NOT_SUPPORTED);
        assert!(server.await.unwrap().is_err());
    }
}
