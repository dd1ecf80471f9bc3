//! Configuration management.
//!
//! Both binaries read a TOML file with `[client]` / `[server]` / `[logging]`
//! sections; CLI flags override individual fields. A handful of tuning knobs
//! come from `VEIL_*` environment variables instead of the file, so deployed
//! processes can be adjusted without touching configs.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: Option<ServerConfig>,
    /// Client configuration
    pub client: Option<ClientConfig>,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("failed to read config: {}", e)))?;
        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("failed to serialize config: {}", e)))?;
        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("failed to write config: {}", e)))
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server URL (`ws://host:port` or `wss://host:port`)
    pub server: String,
    /// Server public key (base64)
    pub server_public_key: String,
    /// Client private key (base64)
    #[serde(default)]
    pub private_key: String,
    /// Client public key (base64), shared with the server admin
    #[serde(default)]
    pub public_key: String,
    /// Remotes in mini-syntax form
    #[serde(default)]
    pub remotes: Vec<String>,
    /// Keepalive interval in seconds (0 disables)
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u64,
    /// Maximum reconnect attempts; negative means unlimited
    #[serde(default = "default_max_retry")]
    pub max_retry_count: i64,
    /// Cap on the exponential backoff base, in seconds
    #[serde(default = "default_retry_interval")]
    pub max_retry_interval_secs: u64,
    /// Extra headers for the upgrade request
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Optional HTTP CONNECT proxy URL
    pub proxy: Option<String>,
    /// Path component of the upgrade request
    #[serde(default = "default_path")]
    pub path: String,
    /// TLS settings for wss:// servers
    #[serde(default)]
    pub tls: TlsClientConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: format!("ws://127.0.0.1:{}", crate::DEFAULT_PORT),
            server_public_key: String::new(),
            private_key: String::new(),
            public_key: String::new(),
            remotes: Vec::new(),
            keepalive_secs: default_keepalive(),
            max_retry_count: default_max_retry(),
            max_retry_interval_secs: default_retry_interval(),
            headers: BTreeMap::new(),
            proxy: None,
            path: default_path(),
            tls: TlsClientConfig::default(),
        }
    }
}

/// Client-side TLS settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsClientConfig {
    /// Extra root CA bundle (PEM path)
    pub ca: Option<String>,
    /// Skip certificate verification (testing only)
    #[serde(default)]
    pub skip_verify: bool,
    /// Override the SNI/verification name
    pub server_name: Option<String>,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Server private key (base64)
    #[serde(default)]
    pub private_key: String,
    /// Server public key (base64)
    #[serde(default)]
    pub public_key: String,
    /// Allowed client public keys (base64); empty rejects everyone
    #[serde(default)]
    pub allowed_clients: Vec<String>,
    /// Allow clients to declare reverse remotes
    #[serde(default)]
    pub reverse: bool,
    /// Enable the embedded SOCKS5 backend
    #[serde(default)]
    pub socks5: bool,
    /// Keepalive interval in seconds (0 disables)
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u64,
    /// Path the upgrade endpoint is mounted on
    #[serde(default = "default_path")]
    pub path: String,
    /// Optional target ACL: `host:port` patterns clients may forward to
    /// (`*` wildcards allowed). Empty allows everything.
    #[serde(default)]
    pub acl: Vec<String>,
    /// TLS certificate path (PEM)
    pub tls_cert: Option<String>,
    /// TLS key path (PEM)
    pub tls_key: Option<String>,
    /// Maximum concurrent client connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            private_key: String::new(),
            public_key: String::new(),
            allowed_clients: Vec::new(),
            reverse: false,
            socks5: false,
            keepalive_secs: default_keepalive(),
            path: default_path(),
            acl: Vec::new(),
            tls_cert: None,
            tls_key: None,
            max_connections: default_max_connections(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, json)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

fn default_keepalive() -> u64 {
    25
}

fn default_max_retry() -> i64 {
    -1
}

fn default_retry_interval() -> u64 {
    300
}

fn default_path() -> String {
    "/".to_string()
}

fn default_listen() -> String {
    format!("0.0.0.0:{}", crate::DEFAULT_PORT)
}

fn default_max_connections() -> usize {
    1000
}

/// Duration override from the environment, in seconds.
pub fn env_duration(name: &str, default: Duration) -> Duration {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

/// Size override from the environment, in bytes.
pub fn env_size(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|&v| v > 0)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_client() {
        let config: Config = toml::from_str(
            r#"
            [client]
            server = "wss://example.com:443"
            server_public_key = "AAAA"
            remotes = ["8080:127.0.0.1:80", "R:9000:127.0.0.1:9001"]
            "#,
        )
        .unwrap();
        let client = config.client.unwrap();
        assert_eq!(client.server, "wss://example.com:443");
        assert_eq!(client.remotes.len(), 2);
        assert_eq!(client.keepalive_secs, 25);
        assert_eq!(client.max_retry_count, -1);
        assert_eq!(client.path, "/");
    }

    #[test]
    fn test_parse_server_defaults() {
        let config: Config = toml::from_str("[server]\n").unwrap();
        let server = config.server.unwrap();
        assert_eq!(server.listen, format!("0.0.0.0:{}", crate::DEFAULT_PORT));
        assert!(!server.reverse);
        assert_eq!(server.max_connections, 1000);
    }

    #[test]
    fn test_roundtrip() {
        let mut config = Config::default();
        config.client = Some(ClientConfig::default());
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert!(parsed.client.is_some());
    }

    #[test]
    fn test_env_duration() {
        std::env::set_var("VEIL_TEST_DURATION_X", "7");
        assert_eq!(
            env_duration("VEIL_TEST_DURATION_X", Duration::from_secs(1)),
            Duration::from_secs(7)
        );
        assert_eq!(
            env_duration("VEIL_TEST_DURATION_MISSING", Duration::from_secs(1)),
            Duration::from_secs(1)
        );
    }
}
