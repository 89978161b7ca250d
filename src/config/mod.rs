//! Configuration management

use crate::crypto::Method;
use crate::proxy::Credentials;
use serde::{Deserialize, Serialize};
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
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        Self::parse(&content)
    }

    /// Parse and validate configuration text
    pub fn parse(content: &str) -> Result<Self, crate::Error> {
        let config: Config = toml::from_str(content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }

    /// Reject settings that cannot work at runtime
    pub fn validate(&self) -> Result<(), crate::Error> {
        if let Some(server) = &self.server {
            check_secret("server", &server.password, &server.method)?;
            if server.tls_cert.is_some() != server.tls_key.is_some() {
                return Err(crate::Error::Config(
                    "server: tls_cert and tls_key must be set together".into(),
                ));
            }
            if server.max_connections == 0 {
                return Err(crate::Error::Config(
                    "server: max_connections must be positive".into(),
                ));
            }
        }
        if let Some(client) = &self.client {
            check_secret("client", &client.password, &client.method)?;
            if client.socks5_listen.is_none() && client.http_listen.is_none() {
                return Err(crate::Error::Config(
                    "client: at least one of socks5_listen and http_listen is required".into(),
                ));
            }
        }
        Ok(())
    }
}

fn check_secret(section: &str, password: &str, method: &str) -> Result<(), crate::Error> {
    if password.is_empty() {
        return Err(crate::Error::Config(format!("{}: password is empty", section)));
    }
    method
        .parse::<Method>()
        .map_err(|e| crate::Error::Config(format!("{}: {}", section, e)))?;
    Ok(())
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address
    pub listen: String,
    /// Shared secret
    pub password: String,
    /// AEAD method: aes-256-gcm or chacha20-poly1305
    pub method: String,
    /// TLS certificate path
    pub tls_cert: Option<String>,
    /// TLS key path
    pub tls_key: Option<String>,
    /// Maximum concurrent connections
    pub max_connections: usize,
    /// Seconds to wait for the next session on an idle connection
    pub idle_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:443".to_string(),
            password: String::new(),
            method: Method::default().as_str().to_string(),
            tls_cert: None,
            tls_key: None,
            max_connections: 1000,
            idle_timeout_secs: crate::protocol::SESSION_IDLE_TIMEOUT.as_secs(),
        }
    }
}

impl ServerConfig {
    /// Parsed AEAD method
    pub fn method(&self) -> Result<Method, crate::Error> {
        self.method
            .parse()
            .map_err(|e| crate::Error::Config(format!("server: {}", e)))
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server address
    pub server: String,
    /// Shared secret
    pub password: String,
    /// AEAD method: aes-256-gcm or chacha20-poly1305
    pub method: String,
    /// Local SOCKS5 proxy address
    pub socks5_listen: Option<String>,
    /// Local HTTP proxy address
    pub http_listen: Option<String>,
    /// Wrap transport connections in TLS with this SNI
    pub tls_sni: Option<String>,
    /// Extra CA certificate trusted for the TLS transport
    pub tls_ca: Option<String>,
    /// Maximum idle transport connections kept for reuse
    pub pool_size: usize,
    /// Transport connect timeout in seconds
    pub connect_timeout_secs: u64,
    /// Credentials required from local proxy clients
    pub proxy_auth: Option<ProxyAuthConfig>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: "127.0.0.1:443".to_string(),
            password: String::new(),
            method: Method::default().as_str().to_string(),
            socks5_listen: Some("127.0.0.1:1080".to_string()),
            http_listen: Some("127.0.0.1:8080".to_string()),
            tls_sni: None,
            tls_ca: None,
            pool_size: 16,
            connect_timeout_secs: 10,
            proxy_auth: None,
        }
    }
}

impl ClientConfig {
    /// Parsed AEAD method
    pub fn method(&self) -> Result<Method, crate::Error> {
        self.method
            .parse()
            .map_err(|e| crate::Error::Config(format!("client: {}", e)))
    }

    pub fn credentials(&self) -> Option<Credentials> {
        self.proxy_auth
            .as_ref()
            .map(|auth| Credentials::new(auth.username.clone(), auth.password.clone()))
    }
}

/// Local proxy authentication
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyAuthConfig {
    pub username: String,
    pub password: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, json, compact)
    pub format: String,
    /// Log file path (optional)
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file: None,
        }
    }
}

/// Generate example configuration
pub fn generate_example_config() -> Config {
    Config {
        server: Some(ServerConfig {
            password: "change-me".to_string(),
            ..ServerConfig::default()
        }),
        client: Some(ClientConfig {
            password: "change-me".to_string(),
            ..ClientConfig::default()
        }),
        logging: LoggingConfig::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_client_config() {
        let config = Config::parse(
            r#"
            [client]
            server = "203.0.113.5:443"
            password = "hunter2"
            method = "chacha20-poly1305"
            socks5_listen = "127.0.0.1:1080"
            pool_size = 4

            [client.proxy_auth]
            username = "alice"
            password = "secret"

            [logging]
            level = "debug"
            format = "json"
            "#,
        )
        .unwrap();

        let client = config.client.unwrap();
        assert_eq!(client.method().unwrap(), Method::ChaCha20Poly1305);
        assert_eq!(client.pool_size, 4);
        assert_eq!(client.connect_timeout_secs, 10);
        assert_eq!(
            client.credentials(),
            Some(Credentials::new("alice", "secret"))
        );
        assert_eq!(config.logging.format, "json");
        assert!(config.server.is_none());
    }

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config = Config::parse("[server]\npassword = \"pw\"\n").unwrap();
        let server = config.server.unwrap();
        assert_eq!(server.method().unwrap(), Method::Aes256Gcm);
        assert_eq!(server.idle_timeout(), crate::protocol::SESSION_IDLE_TIMEOUT);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_validation_errors() {
        assert!(Config::parse("[server]\npassword = \"\"\n").is_err());
        assert!(Config::parse("[server]\npassword = \"pw\"\nmethod = \"rc4-md5\"\n").is_err());
        assert!(Config::parse("[server]\npassword = \"pw\"\ntls_cert = \"cert.pem\"\n").is_err());
        assert!(Config::parse(
            "[client]\npassword = \"pw\"\nsocks5_listen = \"127.0.0.1:1080\"\n"
        )
        .is_ok());
    }

    #[test]
    fn test_example_config_round_trips() {
        let example = generate_example_config();
        let text = toml::to_string_pretty(&example).unwrap();
        let parsed = Config::parse(&text).unwrap();
        assert_eq!(parsed.client.unwrap().server, "127.0.0.1:443");
    }

    #[test]
    fn test_save_then_load() {
        let path = std::env::temp_dir().join(format!("mirage-config-{}.toml", std::process::id()));
        generate_example_config().save(&path).unwrap();
        let loaded = Config::load(&path).unwrap();
        std::fs::remove_file(&path).ok();

        let server = loaded.server.unwrap();
        assert_eq!(server.listen, "0.0.0.0:443");
        assert!(Config::load(&path).is_err());
    }
}
