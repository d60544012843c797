//! Error types for the order book tracker

use thiserror::Error;

/// Order book tracker errors
#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("WebSocket connection error: {0}")]
    WebSocketConnection(String),

    #[error("WebSocket message error: {0}")]
    WebSocketMessage(String),

    #[error("Failed to parse message: {0}")]
    ParseError(String),

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("REST API error: {0}")]
    RestApiError(String),

    #[error("REST request timed out after {0} seconds")]
    RestTimeout(u64),

    #[error("Unknown exchange symbol: {0}")]
    UnknownSymbol(String),

    #[error("Unknown trading pair: {0}")]
    UnknownTradingPair(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Connection timeout")]
    ConnectionTimeout,

    #[error("Output channel closed")]
    ChannelClosed,

    #[error("Metrics error: {0}")]
    MetricsError(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for TrackerError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        TrackerError::WebSocketConnection(err.to_string())
    }
}

impl From<serde_json::Error> for TrackerError {
    fn from(err: serde_json::Error) -> Self {
        TrackerError::ParseError(err.to_string())
    }
}

impl From<reqwest::Error> for TrackerError {
    fn from(err: reqwest::Error) -> Self {
        TrackerError::RestApiError(err.to_string())
    }
}

impl From<rust_decimal::Error> for TrackerError {
    fn from(err: rust_decimal::Error) -> Self {
        TrackerError::MalformedPayload(err.to_string())
    }
}

impl From<prometheus::Error> for TrackerError {
    fn from(err: prometheus::Error) -> Self {
        TrackerError::MetricsError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TrackerError>;
