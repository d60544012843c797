//! Configuration module for the order book tracker

use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, TrackerError};
use crate::symbols::validate_trading_pair;

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Canonical trading pairs to track (e.g., ["BTC-USDT", "ETH-USDT"])
    pub trading_pairs: Vec<String>,

    /// WebSocket endpoint of the exchange
    pub ws_endpoint: String,

    /// REST API endpoint for snapshots and instrument listings
    pub rest_endpoint: String,

    /// Depth requested for REST snapshots
    pub snapshot_depth: usize,

    /// Idle read time before a ping is sent
    pub ws_read_timeout_secs: u64,

    /// Time allowed for the exchange to answer a ping
    pub ws_pong_timeout_secs: u64,

    /// Fixed delay before a failed listener reconnects
    pub reconnect_delay_secs: u64,

    /// Period between full REST snapshot refreshes
    pub snapshot_interval_secs: u64,

    /// Pause after a failed per-pair snapshot fetch
    pub snapshot_throttle_secs: u64,

    /// Timeout of a single REST request
    pub rest_timeout_secs: u64,

    /// Diffs retained per pair for replay after a snapshot
    pub replay_window_capacity: usize,

    /// Port of the health/status HTTP server
    pub status_port: u16,
}

impl Config {
    /// Load configuration from environment variables
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = Self::default();

        let trading_pairs = match env::var("TRADING_PAIRS") {
            Ok(raw) => parse_trading_pairs(&raw)?,
            Err(_) => defaults.trading_pairs,
        };

        Ok(Self {
            trading_pairs,
            ws_endpoint: env::var("WS_ENDPOINT").unwrap_or(defaults.ws_endpoint),
            rest_endpoint: env::var("REST_ENDPOINT").unwrap_or(defaults.rest_endpoint),
            snapshot_depth: env_or("SNAPSHOT_DEPTH", defaults.snapshot_depth)?,
            ws_read_timeout_secs: env_or("WS_READ_TIMEOUT_SECS", defaults.ws_read_timeout_secs)?,
            ws_pong_timeout_secs: env_or("WS_PONG_TIMEOUT_SECS", defaults.ws_pong_timeout_secs)?,
            reconnect_delay_secs: env_or("RECONNECT_DELAY_SECS", defaults.reconnect_delay_secs)?,
            snapshot_interval_secs: env_or(
                "SNAPSHOT_INTERVAL_SECS",
                defaults.snapshot_interval_secs,
            )?,
            snapshot_throttle_secs: env_or(
                "SNAPSHOT_THROTTLE_SECS",
                defaults.snapshot_throttle_secs,
            )?,
            rest_timeout_secs: env_or("REST_TIMEOUT_SECS", defaults.rest_timeout_secs)?,
            replay_window_capacity: env_or(
                "REPLAY_WINDOW_CAPACITY",
                defaults.replay_window_capacity,
            )?,
            status_port: env_or("STATUS_PORT", defaults.status_port)?,
        })
    }

    pub fn ws_read_timeout(&self) -> Duration {
        Duration::from_secs(self.ws_read_timeout_secs)
    }

    pub fn ws_pong_timeout(&self) -> Duration {
        Duration::from_secs(self.ws_pong_timeout_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_secs)
    }

    pub fn snapshot_throttle(&self) -> Duration {
        Duration::from_secs(self.snapshot_throttle_secs)
    }

    pub fn rest_timeout(&self) -> Duration {
        Duration::from_secs(self.rest_timeout_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            trading_pairs: vec!["BTC-USDT".to_string(), "ETH-USDT".to_string()],
            ws_endpoint: "wss://stream.binance.com:9443".to_string(),
            rest_endpoint: "https://api.binance.com/api/v3".to_string(),
            snapshot_depth: 1000,
            ws_read_timeout_secs: 30,
            ws_pong_timeout_secs: 10,
            reconnect_delay_secs: 30,
            snapshot_interval_secs: 300,
            snapshot_throttle_secs: 5,
            rest_timeout_secs: 10,
            replay_window_capacity: 1000,
            status_port: 9090,
        }
    }
}

/// Parse a comma-separated list of canonical pairs, uppercasing each entry
pub fn parse_trading_pairs(raw: &str) -> Result<Vec<String>> {
    let pairs: Vec<String> = raw
        .split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect();

    if pairs.is_empty() {
        return Err(TrackerError::ConfigError(
            "TRADING_PAIRS must name at least one pair".to_string(),
        ));
    }

    for pair in &pairs {
        validate_trading_pair(pair)
            .map_err(|e| TrackerError::ConfigError(format!("TRADING_PAIRS: {}", e)))?;
    }

    Ok(pairs)
}

fn env_or<T: FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| TrackerError::ConfigError(format!("invalid value for {}: {}", key, raw))),
        Err(_) => Ok(default),
    }
}
