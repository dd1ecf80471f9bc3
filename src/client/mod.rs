//! Client supervisor: dial, handshake, bind, reconnect.
//!
//! The supervisor keeps one session alive against the server until the
//! retry budget runs out or the root token is cancelled. Local (forward)
//! proxies bind immediately and park on the session latch across
//! reconnects; reverse remotes travel to the server inside the forwarding
//! config and come back to us as channel opens.

mod backoff;

pub use backoff::Backoff;

use crate::config::{env_duration, env_size, ClientConfig, TlsClientConfig};
use crate::crypto::{KeyPair, PublicKey};
use crate::protocol::ForwardingConfig;
use crate::remote::Remote;
use crate::session::{self, SessionError};
use crate::transport::{WsStream, DEFAULT_MAX_FRAME};
use crate::tunnel::{Tunnel, TunnelOptions, REQUEST_CONFIG};
use crate::{Error, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{client_async_tls_with_config, connect_async_tls_with_config, Connector};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

/// Minimum Active time for a session to count as a real connection.
const STABILITY_THRESHOLD: Duration = Duration::from_secs(5);
/// Default budget for the WebSocket dial plus secure handshake.
const DEFAULT_WS_TIMEOUT: Duration = Duration::from_secs(45);

/// Headers the WebSocket library owns; user-supplied copies are stripped.
const RESERVED_HEADERS: [&str; 7] = [
    "host",
    "connection",
    "upgrade",
    "sec-websocket-key",
    "sec-websocket-version",
    "sec-websocket-protocol",
    "sec-websocket-extensions",
];

/// The tunnel client.
pub struct Client {
    config: ClientConfig,
    keypair: KeyPair,
    server_key: PublicKey,
    remotes: Vec<Remote>,
    server_url: Url,
    tunnel: Arc<Tunnel>,
}

impl Client {
    pub fn new(config: ClientConfig) -> Result<Self> {
        if config.remotes.is_empty() {
            return Err(Error::Config("no remotes configured".into()));
        }
        let remotes = config
            .remotes
            .iter()
            .map(|s| Remote::parse(s))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let keypair = KeyPair::from_base64(&config.private_key, &config.public_key)
            .map_err(|_| Error::Config("missing or invalid client keypair".into()))?;
        let server_key = PublicKey::from_base64(&config.server_public_key)
            .map_err(|_| Error::Config("missing or invalid server public key".into()))?;

        let server_url = parse_server_url(&config.server, &config.path)?;

        // reverse socks remotes make the server open `socks` channels at us
        let socks = remotes.iter().any(|r| r.reverse && r.socks);
        let tunnel = Tunnel::new(TunnelOptions {
            inbound: true,
            outbound: true,
            socks,
            keepalive: Duration::from_secs(config.keepalive_secs),
        });

        Ok(Self {
            config,
            keypair,
            server_key,
            remotes,
            server_url,
            tunnel,
        })
    }

    pub fn tunnel(&self) -> Arc<Tunnel> {
        Arc::clone(&self.tunnel)
    }

    /// Run until the retry budget is exhausted or `cancel` fires.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<()> {
        info!("connecting to {}", self.server_url);

        // forward-mode remotes listen locally from the start
        let local: Vec<Remote> = self.remotes.iter().filter(|r| !r.reverse).cloned().collect();
        let mut proxies = if local.is_empty() {
            None
        } else {
            let tunnel = Arc::clone(&self.tunnel);
            let scope = cancel.clone();
            Some(tokio::spawn(async move {
                tunnel.bind_remotes(&scope, &local).await
            }))
        };

        let max_retry = self.config.max_retry_count;
        let mut backoff = Backoff::new(Duration::from_secs(self.config.max_retry_interval_secs));
        let mut last_err: Option<Error> = None;

        loop {
            if cancel.is_cancelled() {
                break;
            }
            // a dead local listener is fatal, not retriable
            if let Some(task) = proxies.as_mut() {
                if task.is_finished() {
                    let result = task.await.map_err(|e| Error::Config(e.to_string()))?;
                    proxies = None;
                    result?;
                }
            }

            let (connected, result) = self.connect_once(cancel).await;
            if connected {
                backoff.success();
            } else {
                backoff.failure();
            }

            match result {
                Ok(()) => {
                    last_err = None;
                }
                Err(e) => {
                    if matches!(e, Error::Config(_) | Error::Remote(_)) {
                        // the config itself is bad; retrying cannot help
                        return Err(e);
                    }
                    let attempt = backoff.attempt();
                    let max_display = if max_retry < 0 {
                        "unlimited".to_string()
                    } else {
                        max_retry.to_string()
                    };
                    info!("connection error: {} (attempt {}/{})", e, attempt, max_display);
                    last_err = Some(e);
                }
            }

            if max_retry >= 0 && i64::from(backoff.attempt()) >= max_retry {
                info!("retry budget exhausted, giving up");
                return match last_err {
                    Some(e) => Err(e),
                    None => Ok(()),
                };
            }

            let pause = backoff.next_sleep();
            debug!("retrying in {:?}", pause);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        info!("cancelled");
        Ok(())
    }

    /// One connection attempt: dial, secure handshake, config exchange,
    /// then block inside `bind_session` until the session ends.
    ///
    /// The boolean reports whether the attempt counts as "connected": only
    /// Active time beyond the stability threshold resets the backoff, so
    /// flapping handshakes keep backing off.
    async fn connect_once(&self, cancel: &CancellationToken) -> (bool, Result<()>) {
        match self.connect_inner(cancel).await {
            Ok(active_for) => (active_for > STABILITY_THRESHOLD, Ok(())),
            Err((active_for, e)) => (
                active_for.map(|d| d > STABILITY_THRESHOLD).unwrap_or(false),
                Err(e),
            ),
        }
    }

    async fn connect_inner(
        &self,
        cancel: &CancellationToken,
    ) -> std::result::Result<Duration, (Option<Duration>, Error)> {
        let fail = |e: Error| (None, e);

        let ws_timeout = env_duration("VEIL_WS_TIMEOUT", DEFAULT_WS_TIMEOUT);
        let ws = tokio::time::timeout(ws_timeout, self.dial())
            .await
            .map_err(|_| fail(Error::Timeout))?
            .map_err(fail)?;
        let stream = WsStream::with_max_frame(ws, env_size("VEIL_WS_FRAME", DEFAULT_MAX_FRAME));

        debug!("handshaking");
        let t0 = Instant::now();
        let handshake = tokio::time::timeout(
            ws_timeout,
            session::connect(stream, &self.keypair, &self.server_key),
        )
        .await
        .map_err(|_| fail(Error::Timeout))?;
        let (session, incoming) = handshake.map_err(|e| {
            fail(match e {
                SessionError::Crypto(_) => {
                    info!("authentication failed");
                    Error::AuthenticationFailed
                }
                other => other.into(),
            })
        })?;

        debug!("sending config");
        let forwarding = ForwardingConfig::new(&self.remotes);
        match session.send_request(REQUEST_CONFIG, &forwarding.encode()).await {
            Ok(_) => {}
            Err(SessionError::RequestRejected(msg)) => {
                session.close();
                if msg == crate::UNAUTHORIZED_MSG {
                    info!("authentication failed");
                    return Err(fail(Error::AuthenticationFailed));
                }
                return Err(fail(Error::Config(msg)));
            }
            Err(e) => {
                info!("config verification failed");
                return Err(fail(e.into()));
            }
        }
        info!("connected (latency {:?})", t0.elapsed());

        let active_since = Instant::now();
        let bound = self.tunnel.bind_session(cancel, session, incoming).await;
        info!("disconnected");
        let active_for = active_since.elapsed();
        match bound {
            Ok(()) => Ok(active_for),
            Err(e) => Err((Some(active_for), e.into())),
        }
    }

    /// Dial the server: TCP (optionally through an HTTP CONNECT proxy),
    /// then TLS for `wss`, then the WebSocket upgrade presenting our
    /// subprotocol and headers.
    async fn dial(&self) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>> {
        let request = self.upgrade_request()?;
        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(4 * 1024 * 1024);
        ws_config.max_frame_size = Some(4 * 1024 * 1024);
        let connector = tls_connector(&self.config.tls, self.server_url.scheme() == "wss")?;

        let ws = match &self.config.proxy {
            Some(proxy) => {
                let stream = self.dial_via_proxy(proxy).await?;
                let (ws, _response) =
                    client_async_tls_with_config(request, stream, Some(ws_config), connector)
                        .await
                        .map_err(crate::transport::TransportError::from)?;
                ws
            }
            None => {
                let (ws, _response) =
                    connect_async_tls_with_config(request, Some(ws_config), true, connector)
                        .await
                        .map_err(crate::transport::TransportError::from)?;
                ws
            }
        };
        Ok(ws)
    }

    fn upgrade_request(&self) -> Result<Request> {
        let mut request = self
            .server_url
            .as_str()
            .into_client_request()
            .map_err(crate::transport::TransportError::from)?;
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_static(crate::PROTOCOL),
        );
        for (name, value) in &self.config.headers {
            if RESERVED_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
                continue;
            }
            let name: tokio_tungstenite::tungstenite::http::HeaderName = name
                .parse()
                .map_err(|_| Error::Config(format!("invalid header name: {}", name)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| Error::Config(format!("invalid header value for {}", name)))?;
            request.headers_mut().insert(name, value);
        }
        Ok(request)
    }

    /// HTTP CONNECT through the configured proxy toward the server.
    async fn dial_via_proxy(&self, proxy: &str) -> Result<TcpStream> {
        let proxy_url =
            Url::parse(proxy).map_err(|e| Error::Config(format!("invalid proxy url: {}", e)))?;
        let proxy_host = proxy_url
            .host_str()
            .ok_or_else(|| Error::Config("proxy url has no host".into()))?;
        let proxy_port = proxy_url.port_or_known_default().unwrap_or(80);

        let host = self
            .server_url
            .host_str()
            .ok_or_else(|| Error::Config("server url has no host".into()))?;
        let port = self
            .server_url
            .port_or_known_default()
            .unwrap_or(crate::DEFAULT_PORT);

        let mut stream = TcpStream::connect((proxy_host, proxy_port))
            .await
            .map_err(crate::transport::TransportError::Io)?;

        let mut connect = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n");
        if !proxy_url.username().is_empty() {
            use base64::Engine;
            let credentials = format!(
                "{}:{}",
                proxy_url.username(),
                proxy_url.password().unwrap_or("")
            );
            let encoded = base64::engine::general_purpose::STANDARD.encode(credentials);
            connect.push_str(&format!("Proxy-Authorization: Basic {}\r\n", encoded));
        }
        connect.push_str("\r\n");
        stream
            .write_all(connect.as_bytes())
            .await
            .map_err(crate::transport::TransportError::Io)?;

        // read the proxy's status line and headers
        let mut response = Vec::with_capacity(256);
        let mut byte = [0u8; 1];
        while !response.ends_with(b"\r\n\r\n") {
            if response.len() > 4096 {
                return Err(crate::transport::TransportError::ConnectionFailed(
                    "oversized proxy response".into(),
                )
                .into());
            }
            stream
                .read_exact(&mut byte)
                .await
                .map_err(crate::transport::TransportError::Io)?;
            response.push(byte[0]);
        }
        let status = String::from_utf8_lossy(&response);
        let ok = status
            .lines()
            .next()
            .map(|line| line.contains(" 200 ") || line.ends_with(" 200"))
            .unwrap_or(false);
        if !ok {
            return Err(crate::transport::TransportError::ConnectionFailed(format!(
                "proxy refused CONNECT: {}",
                status.lines().next().unwrap_or_default()
            ))
            .into());
        }
        Ok(stream)
    }
}

fn parse_server_url(server: &str, path: &str) -> Result<Url> {
    let mut url =
        Url::parse(server).map_err(|e| Error::Config(format!("invalid server url: {}", e)))?;
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => {
            return Err(Error::Config(format!(
                "unsupported server scheme: {}",
                other
            )))
        }
    };
    let _ = url.set_scheme(scheme);
    if url.path() == "/" && path != "/" {
        url.set_path(path);
    }
    Ok(url)
}

/// Build the TLS connector for `wss` servers: library roots by default, a
/// private CA bundle, or (for testing) no verification at all.
fn tls_connector(tls: &TlsClientConfig, is_tls: bool) -> Result<Option<Connector>> {
    if !is_tls {
        return Ok(Some(Connector::Plain));
    }
    if tls.skip_verify {
        let config = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier))
            .with_no_client_auth();
        return Ok(Some(Connector::Rustls(Arc::new(config))));
    }
    if let Some(ca_path) = &tls.ca {
        let mut roots = rustls::RootCertStore::empty();
        let mut reader = std::io::BufReader::new(
            std::fs::File::open(ca_path)
                .map_err(|e| Error::Config(format!("failed to open CA bundle: {}", e)))?,
        );
        for cert in rustls_pemfile::certs(&mut reader) {
            let cert = cert.map_err(|e| Error::Config(format!("bad CA bundle: {}", e)))?;
            roots
                .add(cert)
                .map_err(|e| Error::Config(format!("bad CA certificate: {}", e)))?;
        }
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        return Ok(Some(Connector::Rustls(Arc::new(config))));
    }
    // library default (webpki roots)
    Ok(None)
}

/// Certificate verifier that accepts anything. Guarded behind the
/// `skip_verify` switch; the Noise layer still authenticates the peer.
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        use rustls::SignatureScheme::*;
        vec![
            RSA_PKCS1_SHA256,
            RSA_PKCS1_SHA384,
            RSA_PKCS1_SHA512,
            ECDSA_NISTP256_SHA256,
            ECDSA_NISTP384_SHA384,
            RSA_PSS_SHA256,
            RSA_PSS_SHA384,
            RSA_PSS_SHA512,
            ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> ClientConfig {
        let keypair = KeyPair::generate().unwrap();
        let server = KeyPair::generate().unwrap();
        ClientConfig {
            server: "ws://127.0.0.1:9999".into(),
            server_public_key: server.public.to_base64(),
            private_key: keypair.private.to_base64(),
            public_key: keypair.public.to_base64(),
            remotes: vec!["8080:127.0.0.1:80".into()],
            ..Default::default()
        }
    }

    #[test]
    fn test_new_requires_remotes() {
        let mut config = base_config();
        config.remotes.clear();
        assert!(matches!(Client::new(config), Err(Error::Config(_))));
    }

    #[test]
    fn test_new_rejects_bad_remote() {
        let mut config = base_config();
        config.remotes = vec!["no:such:thing:at:all:9".into()];
        assert!(matches!(Client::new(config), Err(Error::Remote(_))));
    }

    #[test]
    fn test_server_url_scheme_mapping() {
        assert_eq!(
            parse_server_url("https://example.com", "/").unwrap().scheme(),
            "wss"
        );
        assert_eq!(
            parse_server_url("http://example.com", "/").unwrap().scheme(),
            "ws"
        );
        assert!(parse_server_url("ftp://example.com", "/").is_err());
    }

    #[test]
    fn test_server_url_path() {
        let url = parse_server_url("wss://example.com", "/tunnel").unwrap();
        assert_eq!(url.path(), "/tunnel");
        // explicit path in the URL wins
        let url = parse_server_url("wss://example.com/x", "/tunnel").unwrap();
        assert_eq!(url.path(), "/x");
    }

    #[test]
    fn test_upgrade_request_headers() {
        let mut config = base_config();
        config
            .headers
            .insert("X-Custom".into(), "yes".into());
        config
            .headers
            .insert("Connection".into(), "smuggled".into());
        let client = Client::new(config).unwrap();
        let request = client.upgrade_request().unwrap();

        assert_eq!(
            request.headers().get("Sec-WebSocket-Protocol").unwrap(),
            crate::PROTOCOL
        );
        assert_eq!(request.headers().get("X-Custom").unwrap(), "yes");
        // the library owns Connection; the user copy is dropped
        assert!(request
            .headers()
            .get("Connection")
            .map(|v| v != "smuggled")
            .unwrap_or(true));
    }
}
