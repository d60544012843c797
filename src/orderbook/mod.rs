//! Order book module
//!
//! In-memory limit order books, the diff replay window and the read-only
//! registry handed to consumers.

mod book;
mod manager;
mod metrics;
mod window;

pub use book::OrderBook;
pub use manager::{OrderBookHandle, OrderBookManager};
pub(crate) use manager::SharedOrderBook;
pub use metrics::OrderBookMetrics;
pub use window::{ReplayWindow, DEFAULT_REPLAY_WINDOW_CAPACITY};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Side of the order book
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Bid,
    Ask,
}

/// A single level in the order book
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Level {
    pub price: Decimal,
    pub quantity: Decimal,
}

/// Order book summary exposed by the status endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBookStatus {
    pub trading_pair: String,
    pub snapshot_uid: u64,
    pub last_diff_uid: u64,
    pub last_trade_price: Option<Decimal>,
    pub last_applied_update: Option<f64>,
    pub bids: Vec<Level>,
    pub asks: Vec<Level>,
    pub metrics: OrderBookMetrics,
}
