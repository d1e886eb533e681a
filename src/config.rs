//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration file (config/default.toml, config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub actor: ActorConfig,
    pub federation: FederationConfig,
    pub queue: QueueConfig,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 8080)
    pub port: u16,
    /// Public domain (e.g., "social.example.com")
    pub domain: String,
    /// Protocol ("http" or "https")
    pub protocol: String,
}

impl ServerConfig {
    /// Get the base URL for the instance
    ///
    /// # Returns
    /// Full URL like "https://social.example.com"
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.protocol, self.domain)
    }
}

/// Database configuration (SQLite only)
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    pub path: PathBuf,
}

/// Local actor whose key signs outbound deliveries
#[derive(Debug, Clone, Deserialize)]
pub struct ActorConfig {
    /// Local username, served at /users/{username}
    pub username: String,
    /// PEM file holding the RSA private key (PKCS#8 or PKCS#1)
    pub private_key_path: PathBuf,
}

/// Federation configuration
#[derive(Debug, Clone, Deserialize)]
pub struct FederationConfig {
    /// User-Agent sent (and signed) on outbound requests
    pub user_agent: String,
    /// Accepted clock skew for inbound Date headers, in seconds
    pub signature_window_seconds: u64,
    /// How long a fetched public key stays cached
    pub key_cache_ttl_seconds: u64,
    /// Timeout for a single actor document fetch
    pub key_fetch_timeout_seconds: u64,
    /// Fetch attempts per key resolution (with doubling backoff)
    pub key_fetch_attempts: u32,
    /// Allow key fetches from loopback/private hosts (development only)
    #[serde(default)]
    pub allow_private_hosts: bool,
}

impl FederationConfig {
    pub fn signature_window(&self) -> Duration {
        Duration::from_secs(self.signature_window_seconds)
    }

    pub fn key_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.key_cache_ttl_seconds)
    }

    pub fn key_fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.key_fetch_timeout_seconds)
    }
}

/// Inbox queue configuration
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Number of partitions, one worker each
    pub partitions: usize,
    /// Pending jobs per partition before enqueue is refused
    pub capacity: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (DRIFTWOOD__*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            // Start with default values
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("server.protocol", "https")?
            .set_default("database.path", "data/driftwood.db")?
            .set_default("actor.private_key_path", "config/private_key.pem")?
            .set_default("federation.user_agent", "Driftwood/0.1.0")?
            .set_default("federation.signature_window_seconds", 300)?
            .set_default("federation.key_cache_ttl_seconds", 3600)?
            .set_default("federation.key_fetch_timeout_seconds", 10)?
            .set_default("federation.key_fetch_attempts", 2)?
            .set_default("federation.allow_private_hosts", false)?
            .set_default("queue.partitions", 4)?
            .set_default("queue.capacity", 256)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::with_prefix("DRIFTWOOD")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    /// Canonical id of the local actor
    pub fn actor_id(&self) -> String {
        format!("{}/users/{}", self.server.base_url(), self.actor.username)
    }

    /// Read the local actor's private key
    ///
    /// Missing key material is a startup failure.
    pub fn load_private_key_pem(&self) -> Result<String, crate::error::AppError> {
        let pem = std::fs::read_to_string(&self.actor.private_key_path).map_err(|e| {
            crate::error::AppError::Config(format!(
                "cannot read actor.private_key_path {}: {}",
                self.actor.private_key_path.display(),
                e
            ))
        })?;

        if pem.trim().is_empty() {
            return Err(crate::error::AppError::Config(
                "actor.private_key_path points to an empty file".to_string(),
            ));
        }

        Ok(pem)
    }

    pub(crate) fn validate(&self) -> Result<(), crate::error::AppError> {
        use crate::error::AppError;

        if self.actor.username.trim().is_empty() {
            return Err(AppError::Config("actor.username must not be empty".to_string()));
        }

        if self.federation.user_agent.trim().is_empty() {
            return Err(AppError::Config(
                "federation.user_agent must not be empty".to_string(),
            ));
        }

        if self.federation.signature_window_seconds == 0 {
            return Err(AppError::Config(
                "federation.signature_window_seconds must be greater than 0".to_string(),
            ));
        }

        if self.federation.key_fetch_attempts == 0 {
            return Err(AppError::Config(
                "federation.key_fetch_attempts must be at least 1".to_string(),
            ));
        }

        if self.queue.partitions == 0 || self.queue.capacity == 0 {
            return Err(AppError::Config(
                "queue.partitions and queue.capacity must be greater than 0".to_string(),
            ));
        }

        if !matches!(self.server.protocol.as_str(), "http" | "https") {
            return Err(AppError::Config(format!(
                "server.protocol must be http or https, got {}",
                self.server.protocol
            )));
        }

        if self.federation.allow_private_hosts {
            tracing::warn!("Key fetches from private hosts are enabled");
        }

        Ok(())
    }
}
