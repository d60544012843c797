//! Normalized order book messages
//!
//! Every exchange adapter translates its native payloads into these types so
//! the tracker and the book never see exchange-specific formats.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicU64, Ordering};

/// A single price level change: `(price, amount, update_id)`.
///
/// An amount of zero in a diff removes the level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBookRow {
    pub price: Decimal,
    pub amount: Decimal,
    pub update_id: u64,
}

impl OrderBookRow {
    pub fn new(price: Decimal, amount: Decimal, update_id: u64) -> Self {
        Self {
            price,
            amount,
            update_id,
        }
    }
}

/// Kind of order book message.
///
/// The declaration order is the tie-break used when two messages share an
/// update id: snapshots sort before diffs, diffs before trades.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OrderBookMessageType {
    Snapshot,
    Diff,
    Trade,
}

/// Aggressor side of a trade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeType {
    Buy,
    Sell,
}

/// Trade payload carried by `OrderBookMessageType::Trade` messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeFields {
    pub price: Decimal,
    pub amount: Decimal,
    pub trade_type: TradeType,
    pub trade_id: String,
}

/// Exchange-agnostic order book message.
///
/// Messages are totally ordered by `(update_id, message_type)`. Equality
/// follows the same key so that `Ord` and `Eq` agree; payloads are not
/// compared.
#[derive(Debug, Clone, Serialize)]
pub struct OrderBookMessage {
    pub message_type: OrderBookMessageType,
    /// Canonical `BASE-QUOTE` trading pair
    pub trading_pair: String,
    pub update_id: u64,
    /// First sequence number covered by a batched diff, when the exchange reports it
    pub first_update_id: Option<u64>,
    /// Seconds since epoch; diagnostics only, never used for ordering
    pub timestamp: f64,
    pub bids: Vec<OrderBookRow>,
    pub asks: Vec<OrderBookRow>,
    pub trade: Option<TradeFields>,
}

impl OrderBookMessage {
    pub fn snapshot(
        trading_pair: impl Into<String>,
        update_id: u64,
        timestamp: f64,
        bids: Vec<OrderBookRow>,
        asks: Vec<OrderBookRow>,
    ) -> Self {
        Self {
            message_type: OrderBookMessageType::Snapshot,
            trading_pair: trading_pair.into(),
            update_id,
            first_update_id: None,
            timestamp,
            bids,
            asks,
            trade: None,
        }
    }

    pub fn diff(
        trading_pair: impl Into<String>,
        update_id: u64,
        timestamp: f64,
        bids: Vec<OrderBookRow>,
        asks: Vec<OrderBookRow>,
    ) -> Self {
        Self {
            message_type: OrderBookMessageType::Diff,
            trading_pair: trading_pair.into(),
            update_id,
            first_update_id: None,
            timestamp,
            bids,
            asks,
            trade: None,
        }
    }

    pub fn trade(
        trading_pair: impl Into<String>,
        update_id: u64,
        timestamp: f64,
        trade: TradeFields,
    ) -> Self {
        Self {
            message_type: OrderBookMessageType::Trade,
            trading_pair: trading_pair.into(),
            update_id,
            first_update_id: None,
            timestamp,
            bids: Vec::new(),
            asks: Vec::new(),
            trade: Some(trade),
        }
    }

    pub fn with_first_update_id(mut self, first_update_id: u64) -> Self {
        self.first_update_id = Some(first_update_id);
        self
    }

    pub fn is_snapshot(&self) -> bool {
        self.message_type == OrderBookMessageType::Snapshot
    }

    pub fn is_diff(&self) -> bool {
        self.message_type == OrderBookMessageType::Diff
    }

    pub fn is_trade(&self) -> bool {
        self.message_type == OrderBookMessageType::Trade
    }

    fn sort_key(&self) -> (u64, OrderBookMessageType) {
        (self.update_id, self.message_type)
    }
}

impl PartialEq for OrderBookMessage {
    fn eq(&self, other: &Self) -> bool {
        self.sort_key() == other.sort_key()
    }
}

impl Eq for OrderBookMessage {}

impl PartialOrd for OrderBookMessage {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderBookMessage {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.sort_key().cmp(&other.sort_key())
    }
}

static LAST_FALLBACK_UPDATE_ID: AtomicU64 = AtomicU64::new(0);

/// Synthesize an update id for exchanges that do not publish a sequence number.
///
/// Based on the wall clock in milliseconds, but strictly increasing within the
/// process: two calls in the same millisecond (or across a clock step back)
/// still yield ordered ids.
pub fn next_fallback_update_id() -> u64 {
    let now_ms = chrono::Utc::now().timestamp_millis().max(0) as u64;
    let previous = LAST_FALLBACK_UPDATE_ID
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
            Some(now_ms.max(last + 1))
        })
        .unwrap_or_else(|last| last);
    now_ms.max(previous + 1)
}

/// Current wall-clock time in seconds since epoch
pub fn now_timestamp() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1_000.0
}
