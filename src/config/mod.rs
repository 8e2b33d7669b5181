//! Configuration management

use crate::crypto::CipherKind;
use crate::tunnel::MAX_FRAME_PAYLOAD;
use serde::{Deserialize, Serialize};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Reactor tuning shared by both processes
    #[serde(default)]
    pub reactor: ReactorConfig,
    /// Tunnel cipher
    #[serde(default)]
    pub crypto: CryptoConfig,
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
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }

    /// Check value ranges and cross-field requirements
    pub fn validate(&self) -> Result<(), crate::Error> {
        self.reactor.validate()?;
        self.crypto.validate()?;
        if let Some(client) = &self.client {
            client.validate()?;
        }
        if let Some(server) = &self.server {
            server.validate()?;
        }
        Ok(())
    }
}

/// Worker pool, socket and buffer settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReactorConfig {
    /// Listen backlog
    pub backlog: u32,
    /// Number of worker threads (1..=16)
    pub workers: usize,
    /// Disable Nagle's algorithm on every socket
    pub tcp_nodelay: bool,
    /// Enable TCP keep-alive on every socket
    pub tcp_keepalive: bool,
    /// Size of one socket read
    pub read_buffer_size: usize,
    /// Pooled read buffers
    pub read_pool_size: usize,
    /// Pooled write buffers
    pub write_pool_size: usize,
    /// Pooled frame reassembly buffers
    pub frame_pool_size: usize,
}

/// Upper bound on worker threads
pub const MAX_WORKERS: usize = 16;

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            backlog: 1024,
            workers: 3,
            tcp_nodelay: true,
            tcp_keepalive: true,
            read_buffer_size: 16 * 1024,
            read_pool_size: 512,
            write_pool_size: 512,
            frame_pool_size: 256,
        }
    }
}

impl ReactorConfig {
    pub fn validate(&self) -> Result<(), crate::Error> {
        if !(1..=MAX_WORKERS).contains(&self.workers) {
            return Err(crate::Error::Config(format!(
                "workers must be between 1 and {}, got {}",
                MAX_WORKERS, self.workers
            )));
        }
        if self.backlog == 0 || self.backlog > i32::MAX as u32 {
            return Err(crate::Error::Config(format!(
                "invalid backlog {}",
                self.backlog
            )));
        }
        if self.read_buffer_size == 0 || self.read_buffer_size > MAX_FRAME_PAYLOAD {
            return Err(crate::Error::Config(format!(
                "read_buffer_size must be between 1 and {}, got {}",
                MAX_FRAME_PAYLOAD, self.read_buffer_size
            )));
        }
        for (name, size) in [
            ("read_pool_size", self.read_pool_size),
            ("write_pool_size", self.write_pool_size),
            ("frame_pool_size", self.frame_pool_size),
        ] {
            if size == 0 {
                return Err(crate::Error::Config(format!("{} must not be zero", name)));
            }
        }
        Ok(())
    }
}

/// Tunnel cipher configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// Stream cipher: "chacha20" or "none"
    pub cipher: String,
    /// Shared secret both processes derive keystreams from
    pub secret: String,
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            cipher: "chacha20".to_string(),
            secret: String::new(),
        }
    }
}

impl CryptoConfig {
    pub fn cipher_kind(&self) -> Result<CipherKind, crate::Error> {
        Ok(self.cipher.parse::<CipherKind>()?)
    }

    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.cipher_kind()? != CipherKind::None && self.secret.is_empty() {
            return Err(crate::Error::Config(
                "a secret is required when a cipher is enabled".to_string(),
            ));
        }
        Ok(())
    }
}

/// Server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address
    pub listen: String,
    /// Keys whose tokens are accepted
    #[serde(default)]
    pub keys: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: format!("0.0.0.0:{}", crate::DEFAULT_SERVER_PORT),
            keys: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn listen_addr(&self) -> Result<SocketAddr, crate::Error> {
        parse_socket_addr("server.listen", &self.listen)
    }

    pub fn validate(&self) -> Result<(), crate::Error> {
        self.listen_addr()?;
        Ok(())
    }
}

/// Client configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Local SOCKS5 listen address
    pub listen: String,
    /// Tunnel server address (host:port)
    pub server: String,
    /// Key the auth token is derived from
    pub key: String,
    /// Resolve SOCKS domain names locally before tunnelling
    #[serde(default)]
    pub local_dns_resolve: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            listen: format!("127.0.0.1:{}", crate::DEFAULT_SOCKS_PORT),
            server: format!("127.0.0.1:{}", crate::DEFAULT_SERVER_PORT),
            key: String::new(),
            local_dns_resolve: false,
        }
    }
}

impl ClientConfig {
    pub fn listen_addr(&self) -> Result<SocketAddr, crate::Error> {
        parse_socket_addr("client.listen", &self.listen)
    }

    /// Resolve the tunnel server address
    pub fn server_addr(&self) -> Result<SocketAddr, crate::Error> {
        self.server
            .to_socket_addrs()
            .map_err(|e| crate::Error::Config(format!("client.server {}: {}", self.server, e)))?
            .next()
            .ok_or_else(|| {
                crate::Error::Config(format!("client.server {} did not resolve", self.server))
            })
    }

    pub fn validate(&self) -> Result<(), crate::Error> {
        self.listen_addr()?;
        if self.server.is_empty() {
            return Err(crate::Error::Config("client.server is empty".to_string()));
        }
        if self.key.is_empty() {
            return Err(crate::Error::Config("client.key is empty".to_string()));
        }
        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (full, compact, pretty)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "full".to_string(),
        }
    }
}

fn parse_socket_addr(field: &str, value: &str) -> Result<SocketAddr, crate::Error> {
    value
        .parse()
        .map_err(|e| crate::Error::Config(format!("{} {:?}: {}", field, value, e)))
}

/// Generate example configuration
pub fn generate_example_config() -> Config {
    Config {
        reactor: ReactorConfig::default(),
        crypto: CryptoConfig {
            secret: "change-me".to_string(),
            ..CryptoConfig::default()
        },
        server: Some(ServerConfig {
            keys: vec!["client-key".to_string()],
            ..ServerConfig::default()
        }),
        client: Some(ClientConfig {
            key: "client-key".to_string(),
            ..ClientConfig::default()
        }),
        logging: LoggingConfig::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_example_config_roundtrip() {
        let config = generate_example_config();
        config.validate().unwrap();

        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.reactor, config.reactor);
        assert_eq!(parsed.crypto, config.crypto);
        assert_eq!(parsed.client, config.client);
        assert_eq!(parsed.server, config.server);
    }

    #[test]
    fn test_defaults_fill_missing_sections() {
        let parsed: Config = toml::from_str(
            r#"
            [crypto]
            secret = "s"

            [server]
            listen = "127.0.0.1:9000"
            "#,
        )
        .unwrap();
        assert_eq!(parsed.reactor, ReactorConfig::default());
        assert!(parsed.client.is_none());
        assert!(parsed.server.as_ref().unwrap().keys.is_empty());
        parsed.validate().unwrap();
    }

    #[test]
    fn test_worker_range() {
        let mut reactor = ReactorConfig::default();
        reactor.workers = 0;
        assert!(reactor.validate().is_err());
        reactor.workers = 17;
        assert!(reactor.validate().is_err());
        reactor.workers = 16;
        assert!(reactor.validate().is_ok());
    }

    #[test]
    fn test_buffer_sizes() {
        let mut reactor = ReactorConfig::default();
        reactor.read_buffer_size = MAX_FRAME_PAYLOAD + 1;
        assert!(reactor.validate().is_err());

        let mut reactor = ReactorConfig::default();
        reactor.frame_pool_size = 0;
        assert!(reactor.validate().is_err());
    }

    #[test]
    fn test_secret_required_with_cipher() {
        let crypto = CryptoConfig::default();
        assert!(crypto.validate().is_err());

        let crypto = CryptoConfig {
            cipher: "none".to_string(),
            secret: String::new(),
        };
        assert!(crypto.validate().is_ok());

        let crypto = CryptoConfig {
            cipher: "rc4".to_string(),
            secret: "s".to_string(),
        };
        assert!(crypto.validate().is_err());
    }

    #[test]
    fn test_client_requires_key() {
        let client = ClientConfig::default();
        assert!(client.validate().is_err());

        let client = ClientConfig {
            key: "k".to_string(),
            ..ClientConfig::default()
        };
        assert!(client.validate().is_ok());
        assert_eq!(client.server_addr().unwrap().port(), crate::DEFAULT_SERVER_PORT);
    }
}
