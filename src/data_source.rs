//! Exchange adapter contract
//!
//! An exchange plugs into the tracker by implementing
//! [`OrderBookTrackerDataSource`] (network side) and
//! [`OrderBookMessageFactory`] (payload translation). Neither the tracker nor
//! the book ever see exchange-specific symbols or payloads.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::mpsc::UnboundedSender;

use crate::error::{Result, TrackerError};
use crate::message::OrderBookMessage;
use crate::orderbook::OrderBook;

/// Output queue shared by a listener and the tracker
pub type MessageSender = UnboundedSender<OrderBookMessage>;

/// Context handed to the message factories
#[derive(Debug, Clone, Default)]
pub struct MessageMetadata {
    /// Canonical pair the payload belongs to, already resolved by the adapter
    pub trading_pair: Option<String>,
    /// Stamp snapshots and diffs with synthesized ids instead of the
    /// exchange sequence, for venues whose snapshots carry no sequence
    pub synthesize_update_ids: bool,
}

impl MessageMetadata {
    pub fn for_pair(trading_pair: impl Into<String>) -> Self {
        Self {
            trading_pair: Some(trading_pair.into()),
            synthesize_update_ids: false,
        }
    }

    pub fn with_synthesized_update_ids(mut self, synthesize: bool) -> Self {
        self.synthesize_update_ids = synthesize;
        self
    }

    /// The resolved trading pair, required by every factory
    pub fn trading_pair(&self) -> Result<&str> {
        self.trading_pair.as_deref().ok_or_else(|| {
            TrackerError::MalformedPayload("metadata is missing trading_pair".to_string())
        })
    }
}

/// Pure translation from exchange payloads to normalized messages.
///
/// Implementations must not perform I/O and must be deterministic for a given
/// payload, except for synthesized update ids. Snapshots and diffs of one pair
/// must share an id scale: either both carry the exchange sequence or both are
/// synthesized (see [`MessageMetadata::synthesize_update_ids`]).
pub trait OrderBookMessageFactory {
    fn snapshot_message_from_exchange(
        raw: &Value,
        timestamp: f64,
        metadata: &MessageMetadata,
    ) -> Result<OrderBookMessage>;

    fn diff_message_from_exchange(
        raw: &Value,
        timestamp: f64,
        metadata: &MessageMetadata,
    ) -> Result<OrderBookMessage>;

    fn trade_message_from_exchange(raw: &Value, metadata: &MessageMetadata) -> Result<OrderBookMessage>;
}

/// Network side of an exchange adapter.
///
/// The three `listen_for_*` methods run until cancelled. Connection loss and
/// malformed payloads are handled inside them (logged, reconnected, skipped);
/// they return only once their output queue has been closed.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OrderBookTrackerDataSource: Send + Sync {
    /// Short exchange name used in logs
    fn exchange_name(&self) -> &'static str;

    /// Canonical pairs this data source currently subscribes to
    async fn trading_pairs(&self) -> Vec<String>;

    /// Add a pair to the live subscriptions and the snapshot rotation.
    ///
    /// Returns `false` if the pair was already subscribed. Fails for pairs the
    /// exchange does not serve.
    async fn subscribe_to_trading_pair(&self, trading_pair: &str) -> Result<bool>;

    /// Drop a pair from the live subscriptions and the snapshot rotation.
    ///
    /// Returns `false` if the pair was not subscribed.
    async fn unsubscribe_from_trading_pair(&self, trading_pair: &str) -> Result<bool>;

    /// Last traded price per pair, from a one-shot REST query
    async fn get_last_traded_prices(&self, trading_pairs: &[String]) -> Result<HashMap<String, Decimal>>;

    /// Fetch a REST snapshot and materialize it as a ready-to-use book
    async fn get_new_order_book(&self, trading_pair: &str) -> Result<OrderBook>;

    /// Push a trade message for every public trade
    async fn listen_for_trades(&self, output: MessageSender);

    /// Push a diff message for every incremental book update
    async fn listen_for_order_book_diffs(&self, output: MessageSender);

    /// Periodically push full snapshots so the tracker can resynchronize
    async fn listen_for_order_book_snapshots(&self, output: MessageSender);
}

/// Push a message to a listener output, failing once the receiver is gone
pub fn send_message(output: &MessageSender, message: OrderBookMessage) -> Result<()> {
    output.send(message).map_err(|_| TrackerError::ChannelClosed)
}
