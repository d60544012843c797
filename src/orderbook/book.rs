//! Core order book implementation
//!
//! Uses BTreeMap for efficient sorted price level management.

use rust_decimal::Decimal;
use std::cmp::Reverse;
use std::collections::BTreeMap;

use super::{Level, OrderBookMetrics, OrderBookStatus, Side};
use crate::message::{now_timestamp, OrderBookRow, TradeFields};

/// Limit order book for a single trading pair.
///
/// The book trusts its input: rows are validated by the adapters before they
/// become messages. Diffs are fenced by update id, so a diff that is not newer
/// than the last applied snapshot or diff is ignored.
#[derive(Debug, Default, Clone)]
pub struct OrderBook {
    /// Bids sorted by price descending (highest first)
    bids: BTreeMap<Reverse<Decimal>, Decimal>,
    /// Asks sorted by price ascending (lowest first)
    asks: BTreeMap<Decimal, Decimal>,
    /// Update id of the last applied snapshot
    snapshot_uid: u64,
    /// Update id of the last applied diff, zero until a diff lands after the snapshot
    last_diff_uid: u64,
    /// Whether a snapshot has ever been applied
    initialized: bool,
    last_trade_price: Option<Decimal>,
    last_applied_trade: Option<f64>,
    last_applied_update: Option<f64>,
}

impl OrderBook {
    /// Create a new empty order book
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace both sides with the snapshot contents.
    ///
    /// The snapshot becomes the new fence base: `last_diff_uid` is reset, so
    /// any diff newer than `update_id` can be replayed on top of it.
    pub fn apply_snapshot(&mut self, bids: &[OrderBookRow], asks: &[OrderBookRow], update_id: u64) {
        self.bids.clear();
        self.asks.clear();

        for row in bids {
            if row.amount > Decimal::ZERO {
                self.bids.insert(Reverse(row.price), row.amount);
            }
        }

        for row in asks {
            if row.amount > Decimal::ZERO {
                self.asks.insert(row.price, row.amount);
            }
        }

        self.snapshot_uid = update_id;
        self.last_diff_uid = 0;
        self.initialized = true;
        self.last_applied_update = Some(now_timestamp());
    }

    /// Apply a diff if it is newer than everything applied so far.
    ///
    /// Returns true if the diff was applied. A stale diff is not an error:
    /// exchanges routinely deliver updates out of order.
    pub fn apply_diffs(&mut self, bids: &[OrderBookRow], asks: &[OrderBookRow], update_id: u64) -> bool {
        if update_id <= self.fence() {
            return false;
        }

        for row in bids {
            self.update_side(Side::Bid, row);
        }

        for row in asks {
            self.update_side(Side::Ask, row);
        }

        self.last_diff_uid = update_id;
        self.last_applied_update = Some(now_timestamp());

        true
    }

    /// Record a public trade
    pub fn apply_trade(&mut self, trade: &TradeFields, timestamp: f64) {
        self.last_trade_price = Some(trade.price);
        self.last_applied_trade = Some(timestamp);
    }

    /// Update a single price level
    fn update_side(&mut self, side: Side, row: &OrderBookRow) {
        match side {
            Side::Bid => {
                if row.amount == Decimal::ZERO {
                    self.bids.remove(&Reverse(row.price));
                } else {
                    self.bids.insert(Reverse(row.price), row.amount);
                }
            }
            Side::Ask => {
                if row.amount == Decimal::ZERO {
                    self.asks.remove(&row.price);
                } else {
                    self.asks.insert(row.price, row.amount);
                }
            }
        }
    }

    /// Highest update id applied to the book, snapshot or diff
    pub fn fence(&self) -> u64 {
        self.snapshot_uid.max(self.last_diff_uid)
    }

    pub fn snapshot_uid(&self) -> u64 {
        self.snapshot_uid
    }

    pub fn last_diff_uid(&self) -> u64 {
        self.last_diff_uid
    }

    /// Check if a snapshot has been applied
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn last_trade_price(&self) -> Option<Decimal> {
        self.last_trade_price
    }

    /// Wall-clock seconds of the last recorded trade
    pub fn last_applied_trade(&self) -> Option<f64> {
        self.last_applied_trade
    }

    /// Wall-clock seconds of the last snapshot or diff applied
    pub fn last_applied_update(&self) -> Option<f64> {
        self.last_applied_update
    }

    /// Bid levels as `(price, amount)`, best first
    pub fn bids(&self) -> impl Iterator<Item = (Decimal, Decimal)> + '_ {
        self.bids.iter().map(|(Reverse(p), q)| (*p, *q))
    }

    /// Ask levels as `(price, amount)`, best first
    pub fn asks(&self) -> impl Iterator<Item = (Decimal, Decimal)> + '_ {
        self.asks.iter().map(|(p, q)| (*p, *q))
    }

    pub fn bid_amount(&self, price: Decimal) -> Option<Decimal> {
        self.bids.get(&Reverse(price)).copied()
    }

    pub fn ask_amount(&self, price: Decimal) -> Option<Decimal> {
        self.asks.get(&price).copied()
    }

    pub fn bid_levels(&self) -> usize {
        self.bids.len()
    }

    pub fn ask_levels(&self) -> usize {
        self.asks.len()
    }

    /// Current book contents as snapshot rows stamped with the fence id
    pub fn snapshot_rows(&self) -> (Vec<OrderBookRow>, Vec<OrderBookRow>) {
        let uid = self.fence();
        let bids = self.bids().map(|(p, q)| OrderBookRow::new(p, q, uid)).collect();
        let asks = self.asks().map(|(p, q)| OrderBookRow::new(p, q, uid)).collect();
        (bids, asks)
    }

    /// Get best bid price
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.first_key_value().map(|(Reverse(p), _)| *p)
    }

    /// Get best ask price
    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first_key_value().map(|(p, _)| *p)
    }

    /// Get mid price
    pub fn mid_price(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some((bid + ask) / Decimal::from(2)),
            _ => None,
        }
    }

    /// Get spread in basis points
    pub fn spread_bps(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask(), self.mid_price()) {
            (Some(bid), Some(ask), Some(mid)) if mid > Decimal::ZERO => {
                Some((ask - bid) / mid * Decimal::from(10000))
            }
            _ => None,
        }
    }

    /// Calculate order book imbalance at top N levels
    pub fn imbalance(&self, levels: usize) -> Option<Decimal> {
        let bid_volume: Decimal = self.bids.iter().take(levels).map(|(_, q)| q).sum();
        let ask_volume: Decimal = self.asks.iter().take(levels).map(|(_, q)| q).sum();

        let total = bid_volume + ask_volume;
        if total > Decimal::ZERO {
            Some((bid_volume - ask_volume) / total)
        } else {
            None
        }
    }

    /// Summary for status output, with the top `depth` levels per side
    pub fn status(&self, trading_pair: &str, depth: usize) -> OrderBookStatus {
        OrderBookStatus {
            trading_pair: trading_pair.to_string(),
            snapshot_uid: self.snapshot_uid,
            last_diff_uid: self.last_diff_uid,
            last_trade_price: self.last_trade_price,
            last_applied_update: self.last_applied_update,
            bids: self
                .bids()
                .take(depth)
                .map(|(price, quantity)| Level { price, quantity })
                .collect(),
            asks: self
                .asks()
                .take(depth)
                .map(|(price, quantity)| Level { price, quantity })
                .collect(),
            metrics: self.calculate_metrics(),
        }
    }

    /// Calculate order book metrics
    fn calculate_metrics(&self) -> OrderBookMetrics {
        OrderBookMetrics {
            mid_price: self.mid_price(),
            spread_bps: self.spread_bps(),
            imbalance: self.imbalance(5),
            bid_depth: self.bids.values().copied().sum(),
            ask_depth: self.asks.values().copied().sum(),
            bid_levels: self.bids.len(),
            ask_levels: self.asks.len(),
        }
    }
}
