//! Book Tracker - Order Book Tracking Library
//!
//! Keeps local limit order books in sync with an exchange's public market
//! data streams. Exchange adapters normalize snapshots, diffs and trades into
//! one message type; the tracker applies them per trading pair, replaying
//! buffered diffs whenever a snapshot lands.

pub mod binance;
pub mod config;
pub mod data_source;
pub mod error;
pub mod message;
pub mod orderbook;
pub mod retry;
pub mod symbols;
pub mod tracker;
pub mod websocket;

pub use binance::BinanceDataSource;
pub use config::Config;
pub use data_source::{MessageMetadata, MessageSender, OrderBookMessageFactory, OrderBookTrackerDataSource};
pub use error::{Result, TrackerError};
pub use message::{OrderBookMessage, OrderBookMessageType, OrderBookRow, TradeFields, TradeType};
pub use orderbook::{OrderBook, OrderBookHandle, OrderBookMetrics, OrderBookStatus, ReplayWindow};
pub use tracker::{OrderBookTracker, TrackerSettings, TrackingState};
