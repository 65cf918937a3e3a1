use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use url::Url;

use crate::domain::DurationUnit;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub trading: TradingConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    /// WebSocket endpoint (without the app_id query)
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    /// Registered application id
    pub app_id: String,
    /// API token used for `authorize`
    #[serde(default)]
    pub api_token: Option<String>,
    /// Bounded wait for the transport to open
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Heartbeat period while idle
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u64,
    /// Reconnect and re-authorize after an unexpected drop
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
    #[serde(default = "default_reconnect_base")]
    pub reconnect_base_ms: u64,
    #[serde(default = "default_reconnect_cap")]
    pub reconnect_cap_ms: u64,
    /// Retry budget before giving up
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
}

fn default_ws_url() -> String {
    "wss://ws.binaryws.com/websockets/v3".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_keepalive() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_reconnect_base() -> u64 {
    1_000
}

fn default_reconnect_cap() -> u64 {
    30_000
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

impl ConnectionConfig {
    pub fn new(app_id: &str) -> Self {
        Self {
            ws_url: default_ws_url(),
            app_id: app_id.to_string(),
            api_token: None,
            connect_timeout_secs: default_connect_timeout(),
            keepalive_secs: default_keepalive(),
            auto_reconnect: true,
            reconnect_base_ms: default_reconnect_base(),
            reconnect_cap_ms: default_reconnect_cap(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
        }
    }

    /// Full endpoint including the `app_id` query parameter
    pub fn endpoint(&self) -> Result<Url, url::ParseError> {
        let mut url = Url::parse(&self.ws_url)?;
        url.query_pairs_mut().append_pair("app_id", &self.app_id);
        Ok(url)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn keepalive_period(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Per-request deadline
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Upper bound on concurrently outstanding requests
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

fn default_request_timeout() -> u64 {
    15
}

fn default_max_in_flight() -> usize {
    64
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout(),
            max_in_flight: default_max_in_flight(),
        }
    }
}

impl SessionConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TradingConfig {
    /// Account currency used for proposals
    #[serde(default = "default_currency")]
    pub currency: String,
    /// Validity window for the active-symbol and contracts_for caches
    #[serde(default = "default_symbol_ttl")]
    pub symbol_cache_ttl_secs: u64,
    /// Duration units accepted by `place_order`
    #[serde(default = "default_units")]
    pub allowed_duration_units: Vec<DurationUnit>,
}

fn default_currency() -> String {
    "USD".to_string()
}

fn default_symbol_ttl() -> u64 {
    30
}

fn default_units() -> Vec<DurationUnit> {
    DurationUnit::ALL.to_vec()
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            currency: default_currency(),
            symbol_cache_ttl_secs: default_symbol_ttl(),
            allowed_duration_units: default_units(),
        }
    }
}

impl TradingConfig {
    pub fn symbol_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.symbol_cache_ttl_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .set_default("connection.ws_url", default_ws_url())?
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Environment-specific file (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("DERIV_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // DERIV_CONNECTION__APP_ID, DERIV_CONNECTION__API_TOKEN, ...
            .add_source(
                Environment::with_prefix("DERIV")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Configuration for CLI usage when no files are present
    pub fn default_config(app_id: &str, api_token: Option<String>) -> Self {
        let mut connection = ConnectionConfig::new(app_id);
        connection.api_token = api_token;
        Self {
            connection,
            session: SessionConfig::default(),
            trading: TradingConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.connection.app_id.trim().is_empty() {
            errors.push("connection.app_id must be set".to_string());
        }

        if let Err(e) = self.connection.endpoint() {
            errors.push(format!("connection.ws_url is invalid: {e}"));
        }

        if self.connection.keepalive_secs == 0 {
            errors.push("connection.keepalive_secs must be positive".to_string());
        }

        if self.connection.reconnect_base_ms > self.connection.reconnect_cap_ms {
            errors.push("reconnect_base_ms must not exceed reconnect_cap_ms".to_string());
        }

        if self.session.request_timeout_secs == 0 {
            errors.push("session.request_timeout_secs must be positive".to_string());
        }

        if self.session.max_in_flight == 0 {
            errors.push("session.max_in_flight must be positive".to_string());
        }

        if self.trading.allowed_duration_units.is_empty() {
            errors.push("trading.allowed_duration_units must not be empty".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
