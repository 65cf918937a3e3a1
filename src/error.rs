use thiserror::Error;

use crate::domain::ConnectionState;

/// Main error type for the trading client
#[derive(Error, Debug)]
pub enum DerivError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Connection lifecycle errors
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Authorization rejected: {code} - {message}")]
    Auth { code: String, message: String },

    #[error("Connection lost while request was in flight")]
    ConnectionLost,

    #[error("Not ready: connection is {state}")]
    NotReady { state: ConnectionState },

    // Request/response errors
    #[error("Request timeout: {kind} (req_id {req_id}) after {timeout_ms}ms")]
    RequestTimeout {
        kind: String,
        req_id: u64,
        timeout_ms: u64,
    },

    #[error("Server error: {code} - {message}")]
    Server { code: String, message: String },

    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Trading errors
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Invalid symbol: {0}")]
    InvalidSymbol(String),

    #[error("Market closed: {0}")]
    MarketClosed(String),

    #[error("Contract not found: {0}")]
    ContractNotFound(String),

    // State machine errors
    #[error("Invalid state transition: from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for DerivError
pub type Result<T> = std::result::Result<T, DerivError>;

/// Server error codes meaning the underlying market is not tradable right now.
const MARKET_CLOSED_CODES: &[&str] = &["MarketIsClosed", "MarketIsClosedTryVolatility"];

impl DerivError {
    /// Build from the `error` object of a response frame.
    pub fn server(code: impl Into<String>, message: impl Into<String>) -> Self {
        DerivError::Server {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Server-side error code, if this error came from the broker.
    pub fn server_code(&self) -> Option<&str> {
        match self {
            DerivError::Server { code, .. } | DerivError::Auth { code, .. } => Some(code),
            _ => None,
        }
    }

    /// True when the broker refused because the market is closed.
    pub fn is_market_closed(&self) -> bool {
        match self {
            DerivError::MarketClosed(_) => true,
            DerivError::Server { code, .. } => MARKET_CLOSED_CODES.contains(&code.as_str()),
            _ => false,
        }
    }

    /// Transport-level failures that a reconnect may cure.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DerivError::Connection(_)
                | DerivError::WebSocket(_)
                | DerivError::ConnectionLost
                | DerivError::RequestTimeout { .. }
        )
    }
}
