//! Binance message factories
//!
//! Translate validated Binance payloads into normalized order book messages.

use serde::Deserialize;
use serde_json::Value;

use super::parser::{DepthUpdate, OrderBookSnapshot, PriceLevel, Trade};
use crate::data_source::{MessageMetadata, OrderBookMessageFactory};
use crate::error::{Result, TrackerError};
use crate::message::{
    next_fallback_update_id, OrderBookMessage, OrderBookRow, TradeFields, TradeType,
};

pub struct BinanceOrderBook;

impl OrderBookMessageFactory for BinanceOrderBook {
    fn snapshot_message_from_exchange(
        raw: &Value,
        timestamp: f64,
        metadata: &MessageMetadata,
    ) -> Result<OrderBookMessage> {
        let trading_pair = metadata.trading_pair()?;
        let snapshot = OrderBookSnapshot::deserialize(raw).map_err(malformed)?;
        let update_id = if metadata.synthesize_update_ids {
            next_fallback_update_id()
        } else {
            snapshot.last_update_id.ok_or_else(|| {
                TrackerError::MalformedPayload("snapshot without lastUpdateId".to_string())
            })?
        };

        Ok(OrderBookMessage::snapshot(
            trading_pair,
            update_id,
            timestamp,
            to_rows(&snapshot.bids, update_id),
            to_rows(&snapshot.asks, update_id),
        ))
    }

    fn diff_message_from_exchange(
        raw: &Value,
        timestamp: f64,
        metadata: &MessageMetadata,
    ) -> Result<OrderBookMessage> {
        let trading_pair = metadata.trading_pair()?;
        let update = DepthUpdate::deserialize(raw).map_err(malformed)?;
        if metadata.synthesize_update_ids {
            let update_id = next_fallback_update_id();
            return Ok(OrderBookMessage::diff(
                trading_pair,
                update_id,
                timestamp,
                to_rows(&update.bids, update_id),
                to_rows(&update.asks, update_id),
            ));
        }

        let update_id = update.final_update_id;
        Ok(OrderBookMessage::diff(
            trading_pair,
            update_id,
            timestamp,
            to_rows(&update.bids, update_id),
            to_rows(&update.asks, update_id),
        )
        .with_first_update_id(update.first_update_id))
    }

    fn trade_message_from_exchange(raw: &Value, metadata: &MessageMetadata) -> Result<OrderBookMessage> {
        let trading_pair = metadata.trading_pair()?;
        let trade = Trade::deserialize(raw).map_err(malformed)?;

        // The buyer being the maker means the seller crossed the spread
        let trade_type = if trade.is_buyer_maker {
            TradeType::Sell
        } else {
            TradeType::Buy
        };

        Ok(OrderBookMessage::trade(
            trading_pair,
            trade.trade_id,
            trade.trade_time as f64 / 1_000.0,
            TradeFields {
                price: trade.price,
                amount: trade.quantity,
                trade_type,
                trade_id: trade.trade_id.to_string(),
            },
        ))
    }
}

fn to_rows(levels: &[PriceLevel], update_id: u64) -> Vec<OrderBookRow> {
    levels
        .iter()
        .map(|level| OrderBookRow::new(level.price, level.quantity, update_id))
        .collect()
}

fn malformed(err: serde_json::Error) -> TrackerError {
    TrackerError::MalformedPayload(err.to_string())
}
