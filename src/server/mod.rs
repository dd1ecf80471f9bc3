//! Server front end.
//!
//! Accepts TCP connections (optionally TLS-wrapped), upgrades them to
//! WebSocket when the path and the `veil-v1` subprotocol match, performs
//! the secure handshake, validates the client's forwarding config, and
//! hands the session to a per-client tunnel. Reverse remotes from the
//! config are bound as server-side proxies for the lifetime of the
//! session. Non-upgrade requests get an explicit HTTP error rather than a
//! silent drop.

use crate::config::{env_duration, env_size, ServerConfig};
use crate::crypto::{KeyPair, PublicKey};
use crate::protocol::ForwardingConfig;
use crate::remote::Remote;
use crate::session::{self, Incoming, IncomingRequest};
use crate::transport::{WsStream, DEFAULT_MAX_FRAME};
use crate::tunnel::{Tunnel, TunnelOptions, REQUEST_CONFIG};
use crate::{Error, Result};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Semaphore};
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default wait for the client's config request after the handshake.
const DEFAULT_CONFIG_WAIT: Duration = Duration::from_secs(10);
/// Default budget for the secure handshake after the upgrade.
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(45);

/// The tunnel server.
pub struct Server {
    config: ServerConfig,
    keypair: KeyPair,
    allowed: HashSet<String>,
    tls: Option<TlsAcceptor>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Result<Arc<Self>> {
        let keypair = KeyPair::from_base64(&config.private_key, &config.public_key)
            .map_err(|_| Error::Config("missing or invalid server keypair".into()))?;

        let allowed: HashSet<String> = config
            .allowed_clients
            .iter()
            .map(|k| k.trim().to_string())
            .collect();
        if allowed.is_empty() {
            warn!("no allowed_clients configured; all clients will be rejected");
        }

        let tls = match (&config.tls_cert, &config.tls_key) {
            (Some(cert_path), Some(key_path)) => {
                let certs = load_certs(cert_path)?;
                let key = load_private_key(key_path)?;
                let tls_config = rustls::ServerConfig::builder()
                    .with_no_client_auth()
                    .with_single_cert(certs, key)
                    .map_err(|e| Error::Config(format!("bad TLS configuration: {}", e)))?;
                info!("TLS enabled with cert {}", cert_path);
                Some(TlsAcceptor::from(Arc::new(tls_config)))
            }
            (None, None) => None,
            _ => {
                return Err(Error::Config(
                    "tls_cert and tls_key must be set together".into(),
                ))
            }
        };

        Ok(Arc::new(Self {
            config,
            keypair,
            allowed,
            tls,
        }))
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.keypair.public
    }

    /// Bind the configured listen address. Bind failure is fatal.
    pub async fn bind(&self) -> Result<TcpListener> {
        let listener = TcpListener::bind(&self.config.listen)
            .await
            .map_err(|e| crate::tunnel::TunnelError::Bind(format!("{}: {}", self.config.listen, e)))?;
        Ok(listener)
    }

    /// Bind and accept connections until cancellation.
    pub async fn run(self: &Arc<Self>, cancel: &CancellationToken) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener, cancel).await
    }

    /// Accept connections on an already-bound listener until cancellation.
    pub async fn serve(
        self: &Arc<Self>,
        listener: TcpListener,
        cancel: &CancellationToken,
    ) -> Result<()> {
        info!("listening on {}", listener.local_addr()?);
        info!("server public key: {}", self.keypair.public);

        let conn_limit = Arc::new(Semaphore::new(self.config.max_connections));
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => accepted,
            };
            let (stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("accept error: {}", e);
                    continue;
                }
            };
            let Ok(permit) = Arc::clone(&conn_limit).try_acquire_owned() else {
                debug!(%peer, "connection limit reached, dropping");
                continue;
            };

            let server = Arc::clone(self);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let _permit = permit;
                if let Err(e) = server.handle(stream, peer, &cancel).await {
                    debug!(%peer, "connection ended: {}", e);
                }
            });
        }
    }

    async fn handle(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let _ = stream.set_nodelay(true);
        debug!(%peer, "new connection");

        match &self.tls {
            Some(acceptor) => {
                let tls_stream = acceptor
                    .accept(stream)
                    .await
                    .map_err(crate::transport::TransportError::Io)?;
                self.upgrade(tls_stream, peer, cancel).await
            }
            None => self.upgrade(stream, peer, cancel).await,
        }
    }

    /// Gate the WebSocket upgrade on path and subprotocol, then run the
    /// session.
    async fn upgrade<S>(&self, stream: S, peer: SocketAddr, cancel: &CancellationToken) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let expected_path = self.config.path.clone();
        let callback = move |request: &Request, mut response: Response| {
            if request.uri().path() != expected_path {
                debug!(path = %request.uri().path(), "not found");
                return Err(error_response(404, "not found"));
            }
            let offered = request
                .headers()
                .get("Sec-WebSocket-Protocol")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            let matched = offered
                .split(',')
                .map(str::trim)
                .any(|p| p == crate::PROTOCOL);
            if !matched {
                debug!(offered, "unsupported subprotocol");
                return Err(error_response(400, "unsupported websocket subprotocol"));
            }
            response.headers_mut().insert(
                "Sec-WebSocket-Protocol",
                crate::PROTOCOL.parse().expect("static header value"),
            );
            Ok(response)
        };

        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(4 * 1024 * 1024);
        ws_config.max_frame_size = Some(4 * 1024 * 1024);
        let ws = tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(ws_config))
            .await
            .map_err(crate::transport::TransportError::from)?;
        let stream = WsStream::with_max_frame(ws, env_size("VEIL_WS_FRAME", DEFAULT_MAX_FRAME));

        let handshake_timeout = env_duration("VEIL_WS_TIMEOUT", DEFAULT_HANDSHAKE_TIMEOUT);
        let accepted = tokio::time::timeout(handshake_timeout, session::accept(stream, &self.keypair))
            .await
            .map_err(|_| Error::Timeout)?;
        let (session, mut incoming, client_key) = accepted?;

        let authorized = self.allowed.contains(&client_key.to_base64());
        if !authorized {
            warn!(%peer, client = %client_key, "unauthorized client");
        } else {
            info!(%peer, client = %client_key, "client authenticated");
        }

        // the config request arrives first on every conforming client;
        // unauthorized clients get their rejection there, so the failure is
        // attributable on their side
        let config_wait = env_duration("VEIL_CONFIG_WAIT", DEFAULT_CONFIG_WAIT);
        let request = match tokio::time::timeout(config_wait, first_request(&mut incoming)).await {
            Ok(Some(request)) => request,
            Ok(None) => {
                session.close();
                return Err(Error::ConnectionClosed);
            }
            Err(_) => {
                session.close();
                return Err(Error::Timeout);
            }
        };
        if request.name != REQUEST_CONFIG {
            request.reject(b"config expected").await;
            session.close();
            return Err(Error::Config("peer did not send config".into()));
        }
        if !authorized {
            request.reject(crate::UNAUTHORIZED_MSG.as_bytes()).await;
            session.close();
            return Err(Error::AuthenticationFailed);
        }

        let remotes = match self.validate_config(&request.body) {
            Ok(remotes) => {
                request.accept(b"").await;
                remotes
            }
            Err(message) => {
                info!(%peer, "config rejected: {}", message);
                request.reject(message.as_bytes()).await;
                session.close();
                return Err(Error::Config(message));
            }
        };

        // one tunnel per client; reverse remotes bind on our side
        let tunnel = Tunnel::new(TunnelOptions {
            inbound: self.config.reverse,
            outbound: true,
            socks: self.config.socks5,
            keepalive: Duration::from_secs(self.config.keepalive_secs),
        });
        let scope = cancel.child_token();
        let reverse: Vec<Remote> = remotes.iter().filter(|r| r.reverse).cloned().collect();
        let binder = if reverse.is_empty() {
            None
        } else {
            let tunnel = Arc::clone(&tunnel);
            let scope = scope.clone();
            let session = session.clone();
            Some(tokio::spawn(async move {
                if let Err(e) = tunnel.bind_remotes(&scope, &reverse).await {
                    warn!("reverse binding failed: {}", e);
                    session.close();
                }
            }))
        };

        let result = tunnel.bind_session(&scope, session, incoming).await;
        scope.cancel();
        if let Some(binder) = binder {
            let _ = binder.await;
        }
        debug!(%peer, "session ended");
        result.map_err(Into::into)
    }

    /// Decode and police the client's forwarding config. Returns the error
    /// text to send back on rejection.
    fn validate_config(&self, body: &[u8]) -> std::result::Result<Vec<Remote>, String> {
        let config =
            ForwardingConfig::decode(body).map_err(|e| format!("invalid config: {}", e))?;
        config.check_version().map_err(|e| e.to_string())?;
        let remotes = config
            .parsed_remotes()
            .map_err(|e| format!("invalid remote: {}", e))?;

        for remote in &remotes {
            if remote.reverse && !self.config.reverse {
                return Err("reverse port forwarding is not enabled on this server".into());
            }
            if remote.socks && !remote.reverse && !self.config.socks5 {
                return Err("socks is not enabled on this server".into());
            }
            // the ACL covers targets this server will dial
            if !remote.reverse && !remote.socks && !self.target_allowed(&remote.target()) {
                return Err(format!("target not allowed: {}", remote.target()));
            }
        }
        Ok(remotes)
    }

    fn target_allowed(&self, target: &str) -> bool {
        if self.config.acl.is_empty() {
            return true;
        }
        self.config.acl.iter().any(|p| glob_match(p, target))
    }
}

async fn first_request(
    incoming: &mut mpsc::UnboundedReceiver<Incoming>,
) -> Option<IncomingRequest> {
    loop {
        match incoming.recv().await? {
            Incoming::Request(request) => return Some(request),
            Incoming::Channel(open) => {
                // no channels before the config is accepted
                open.reject("config not accepted yet").await;
            }
        }
    }
}

fn error_response(status: u16, message: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(message.to_string()));
    *response.status_mut() =
        tokio_tungstenite::tungstenite::http::StatusCode::from_u16(status).expect("static status");
    response
}

/// Match `pattern` against `value` with `*` wildcards.
fn glob_match(pattern: &str, value: &str) -> bool {
    fn inner(p: &[u8], v: &[u8]) -> bool {
        match (p.first(), v.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                inner(&p[1..], v) || (!v.is_empty() && inner(p, &v[1..]))
            }
            (Some(pc), Some(vc)) if pc == vc => inner(&p[1..], &v[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), value.as_bytes())
}

fn load_certs(path: &str) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let mut reader = std::io::BufReader::new(
        std::fs::File::open(path)
            .map_err(|e| Error::Config(format!("failed to open cert file {}: {}", path, e)))?,
    );
    let certs: Vec<_> = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Config(format!("failed to parse certificates: {}", e)))?;
    if certs.is_empty() {
        return Err(Error::Config(format!("no certificates found in {}", path)));
    }
    Ok(certs)
}

fn load_private_key(path: &str) -> Result<rustls::pki_types::PrivateKeyDer<'static>> {
    let mut reader = std::io::BufReader::new(
        std::fs::File::open(path)
            .map_err(|e| Error::Config(format!("failed to open key file {}: {}", path, e)))?,
    );
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| Error::Config(format!("failed to parse private key: {}", e)))?
        .ok_or_else(|| Error::Config(format!("no private key found in {}", path)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_match() {
        assert!(glob_match("*", "anything:80"));
        assert!(glob_match("127.0.0.1:*", "127.0.0.1:9000"));
        assert!(glob_match("*.internal:443", "db.internal:443"));
        assert!(!glob_match("127.0.0.1:*", "10.0.0.1:9000"));
        assert!(!glob_match("*.internal:443", "db.external:443"));
    }

    fn server_with(config: ServerConfig) -> Arc<Server> {
        let keypair = KeyPair::generate().unwrap();
        let config = ServerConfig {
            private_key: keypair.private.to_base64(),
            public_key: keypair.public.to_base64(),
            ..config
        };
        Server::new(config).unwrap()
    }

    fn encoded(remotes: &[&str]) -> Vec<u8> {
        let remotes: Vec<Remote> = remotes.iter().map(|s| Remote::parse(s).unwrap()).collect();
        ForwardingConfig::new(&remotes).encode().to_vec()
    }

    #[test]
    fn test_validate_config_accepts_forward() {
        let server = server_with(ServerConfig::default());
        let remotes = server
            .validate_config(&encoded(&["8080:127.0.0.1:80"]))
            .unwrap();
        assert_eq!(remotes.len(), 1);
    }

    #[test]
    fn test_validate_config_rejects_reverse_when_disabled() {
        let server = server_with(ServerConfig::default());
        let err = server
            .validate_config(&encoded(&["R:8080:127.0.0.1:80"]))
            .unwrap_err();
        assert!(err.contains("reverse"));
    }

    #[test]
    fn test_validate_config_acl() {
        let server = server_with(ServerConfig {
            acl: vec!["127.0.0.1:*".into()],
            ..Default::default()
        });
        assert!(server.validate_config(&encoded(&["8080:127.0.0.1:80"])).is_ok());
        let err = server
            .validate_config(&encoded(&["8080:10.1.1.1:80"]))
            .unwrap_err();
        assert!(err.contains("not allowed"));
    }

    #[test]
    fn test_validate_config_version() {
        let server = server_with(ServerConfig::default());
        let mut config = ForwardingConfig::new(&[Remote::parse("80:127.0.0.1:80").unwrap()]);
        config.version = "veil-v0".into();
        let err = server.validate_config(&config.encode()).unwrap_err();
        assert!(err.contains("version"));
    }

    #[test]
    fn test_new_requires_keypair() {
        assert!(Server::new(ServerConfig::default()).is_err());
    }
}
