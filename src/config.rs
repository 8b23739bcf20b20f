//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration files (config/default.toml, config/local.toml)
//! 3. Environment variables (override, `BOARDFED__SECTION__KEY`)

use serde::Deserialize;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub federation: FederationConfig,
    pub boards: BoardsConfig,
    pub logging: LoggingConfig,
    #[serde(default)]
    pub admin: AdminConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 8080)
    pub port: u16,
    /// Public domain (e.g., "boards.example.com"), may carry a port
    pub domain: String,
    /// Protocol ("http" or "https")
    pub protocol: String,
}

impl ServerConfig {
    /// Get the base URL for the instance
    ///
    /// # Returns
    /// Full URL like "https://boards.example.com", which is also the main actor id
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

/// Federation engine configuration
#[derive(Debug, Clone, Deserialize)]
pub struct FederationConfig {
    /// Directory holding `<name>-public.pem` / `<name>-private.pem`
    pub keys_dir: PathBuf,
    /// RSA modulus size for newly generated actor keys
    pub key_bits: usize,
    /// SOCKS proxy used for `.onion` peers, e.g. "socks5h://127.0.0.1:9050"
    pub tor_proxy: Option<String>,
    /// Per-request timeout for outbound calls
    pub request_timeout_seconds: u64,
    /// Attempts per recipient before a delivery is dropped
    pub max_delivery_attempts: u32,
    /// Attempt `n` waits `n * retry_step_seconds` before sending
    pub retry_step_seconds: u64,
    /// Delay between dispatching successive recipients of one fan-out
    pub pacing_millis: u64,
    /// Accepted clock skew for the signed `date` header
    pub signature_max_skew_seconds: i64,
    /// Pending fan-out jobs before `enqueue` reports backpressure
    pub delivery_queue_capacity: usize,
    /// Failed deliveries kept for inspection
    pub dead_letter_capacity: usize,
    /// Time allowed for in-flight deliveries on shutdown
    pub shutdown_grace_seconds: u64,
}

impl FederationConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    pub fn retry_step(&self) -> Duration {
        Duration::from_secs(self.retry_step_seconds)
    }

    pub fn pacing(&self) -> Duration {
        Duration::from_millis(self.pacing_millis)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }
}

/// Board defaults
#[derive(Debug, Clone, Deserialize)]
pub struct BoardsConfig {
    /// Preferred username of the instance root actor
    #[serde(default = "default_main_preferred_username")]
    pub main_preferred_username: String,
    /// Summary of the instance root actor
    #[serde(default)]
    pub main_summary: String,
    /// Active threads kept per board before older ones are archived
    pub archive_window: usize,
    /// Maximum number of remote actors held in memory
    pub actor_cache_capacity: u64,
}

fn default_main_preferred_username() -> String {
    "main".to_string()
}

/// Admin API access
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AdminConfig {
    /// Bearer token for `/admin`; the admin API refuses every request when unset
    pub token: Option<String>,
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
    /// 4. Environment variables (BOARDFED__*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("server.protocol", "http")?
            .set_default("database.path", "data/boardfed.db")?
            .set_default("federation.keys_dir", "pem/board")?
            .set_default("federation.key_bits", 4096)?
            .set_default("federation.request_timeout_seconds", 30)?
            .set_default("federation.max_delivery_attempts", 5)?
            .set_default("federation.retry_step_seconds", 60)?
            .set_default("federation.pacing_millis", 150)?
            .set_default("federation.signature_max_skew_seconds", 75)?
            .set_default("federation.delivery_queue_capacity", 1024)?
            .set_default("federation.dead_letter_capacity", 256)?
            .set_default("federation.shutdown_grace_seconds", 10)?
            .set_default("boards.archive_window", 165)?
            .set_default("boards.actor_cache_capacity", 10_000)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::with_prefix("BOARDFED")
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

    pub(crate) fn validate(&self) -> Result<(), crate::error::AppError> {
        use crate::error::AppError;

        if self.server.domain.trim().is_empty() {
            return Err(AppError::Config("server.domain must be set".to_string()));
        }

        let federation = &self.federation;
        if federation.max_delivery_attempts == 0 {
            return Err(AppError::Config(
                "federation.max_delivery_attempts must be greater than 0".to_string(),
            ));
        }
        if federation.delivery_queue_capacity == 0 || federation.dead_letter_capacity == 0 {
            return Err(AppError::Config(
                "federation queue capacities must be greater than 0".to_string(),
            ));
        }
        if federation.signature_max_skew_seconds <= 0 {
            return Err(AppError::Config(
                "federation.signature_max_skew_seconds must be greater than 0".to_string(),
            ));
        }
        if let Some(proxy) = &federation.tor_proxy {
            url::Url::parse(proxy).map_err(|e| {
                AppError::Config(format!("federation.tor_proxy is not a valid URL: {}", e))
            })?;
        }

        if self
            .admin
            .token
            .as_deref()
            .is_some_and(|token| token.trim().len() < 16)
        {
            return Err(AppError::Config(
                "admin.token must be at least 16 characters".to_string(),
            ));
        }

        if self.boards.archive_window == 0 {
            return Err(AppError::Config(
                "boards.archive_window must be greater than 0".to_string(),
            ));
        }

        if !self.server.protocol.eq_ignore_ascii_case("https")
            && !is_local_server_domain(&self.server.domain)
            && !self.server.domain.ends_with(".onion")
        {
            return Err(AppError::Config(
                "server.protocol must be https for public, non-onion domains".to_string(),
            ));
        }

        Ok(())
    }
}

fn normalized_server_host(domain: &str) -> String {
    let trimmed = domain.trim();
    let parsed_host = url::Url::parse(&format!("http://{trimmed}"))
        .ok()
        .and_then(|url| url.host_str().map(|host| host.to_string()));
    let host = parsed_host.unwrap_or_else(|| trimmed.to_string());
    host.trim_end_matches('.').to_ascii_lowercase()
}

fn is_local_server_domain(domain: &str) -> bool {
    let host = normalized_server_host(domain);
    if host == "localhost" || host.ends_with(".localhost") {
        return true;
    }

    if let Ok(ip) = host.trim_matches(['[', ']']).parse::<IpAddr>() {
        return ip.is_loopback() || ip.is_unspecified();
    }

    false
}
