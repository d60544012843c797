//! Parser module for Binance payloads
//!
//! Handles deserialization of depth updates, trades, REST snapshots and the
//! instrument listing. Price levels are validated here, before they can reach
//! an order book.

use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::str::FromStr;

/// Binance depth update message
#[derive(Debug, Clone, Deserialize)]
pub struct DepthUpdate {
    /// Event time (milliseconds)
    #[serde(rename = "E")]
    pub event_time: u64,

    /// Symbol
    #[serde(rename = "s")]
    pub symbol: String,

    /// First update ID in event
    #[serde(rename = "U")]
    pub first_update_id: u64,

    /// Final update ID in event
    #[serde(rename = "u")]
    pub final_update_id: u64,

    /// Bids to update
    #[serde(rename = "b", deserialize_with = "deserialize_price_levels")]
    pub bids: Vec<PriceLevel>,

    /// Asks to update
    #[serde(rename = "a", deserialize_with = "deserialize_price_levels")]
    pub asks: Vec<PriceLevel>,
}

/// Binance trade message
#[derive(Debug, Clone, Deserialize)]
pub struct Trade {
    /// Event time
    #[serde(rename = "E")]
    pub event_time: u64,

    /// Symbol
    #[serde(rename = "s")]
    pub symbol: String,

    /// Trade ID
    #[serde(rename = "t")]
    pub trade_id: u64,

    /// Price
    #[serde(rename = "p", deserialize_with = "deserialize_price")]
    pub price: Decimal,

    /// Quantity
    #[serde(rename = "q", deserialize_with = "deserialize_amount")]
    pub quantity: Decimal,

    /// Trade time
    #[serde(rename = "T")]
    pub trade_time: u64,

    /// Is buyer maker
    #[serde(rename = "m")]
    pub is_buyer_maker: bool,
}

/// Price level (price, quantity pair)
#[derive(Debug, Clone, PartialEq)]
pub struct PriceLevel {
    pub price: Decimal,
    pub quantity: Decimal,
}

/// Order book snapshot from REST API
#[derive(Debug, Clone, Deserialize)]
pub struct OrderBookSnapshot {
    /// Last update ID; absent on some Binance-compatible venues
    #[serde(rename = "lastUpdateId", default)]
    pub last_update_id: Option<u64>,

    /// Bids
    #[serde(deserialize_with = "deserialize_price_levels")]
    pub bids: Vec<PriceLevel>,

    /// Asks
    #[serde(deserialize_with = "deserialize_price_levels")]
    pub asks: Vec<PriceLevel>,
}

/// `GET /exchangeInfo` response, reduced to what the symbol map needs
#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeInfo {
    pub symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolInfo {
    pub symbol: String,
    pub status: String,
    pub base_asset: String,
    pub quote_asset: String,
}

impl SymbolInfo {
    pub fn is_trading(&self) -> bool {
        self.status == "TRADING"
    }
}

/// `GET /ticker/price` response
#[derive(Debug, Clone, Deserialize)]
pub struct TickerPrice {
    pub symbol: String,
    #[serde(deserialize_with = "deserialize_price")]
    pub price: Decimal,
}

/// Combined stream message wrapper
#[derive(Debug, Clone, Deserialize)]
pub struct StreamMessage {
    /// Stream name
    pub stream: String,

    /// Data payload
    pub data: Value,
}

/// Classified WebSocket frame
#[derive(Debug, Clone)]
pub enum StreamEvent {
    DepthUpdate(Value),
    Trade(Value),
    /// Reply to a SUBSCRIBE/UNSUBSCRIBE request
    Response { id: Option<u64> },
    Unknown(String),
}

impl StreamEvent {
    /// Parse a raw WebSocket message
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(raw)?;

        // Combined streams wrap the event in {"stream": ..., "data": ...}
        if value.get("stream").is_some() && value.get("data").is_some() {
            let stream_msg: StreamMessage = serde_json::from_value(value)?;
            return Ok(Self::classify(stream_msg.data));
        }

        if value.get("result").is_some() && value.get("id").is_some() {
            return Ok(StreamEvent::Response {
                id: value.get("id").and_then(Value::as_u64),
            });
        }

        Ok(Self::classify(value))
    }

    fn classify(data: Value) -> Self {
        match data.get("e").and_then(Value::as_str) {
            Some("depthUpdate") => StreamEvent::DepthUpdate(data),
            Some("trade") => StreamEvent::Trade(data),
            _ => StreamEvent::Unknown(data.to_string()),
        }
    }
}

fn parse_decimal(raw: &str) -> Result<Decimal, rust_decimal::Error> {
    Decimal::from_str(raw).or_else(|_| Decimal::from_scientific(raw))
}

/// Strictly positive decimal from string
fn deserialize_price<'de, D>(deserializer: D) -> Result<Decimal, D::Error>
where
    D: Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    let price = parse_decimal(&s).map_err(serde::de::Error::custom)?;
    if price <= Decimal::ZERO {
        return Err(serde::de::Error::custom(format!("non-positive price {}", s)));
    }
    Ok(price)
}

/// Non-negative decimal from string
fn deserialize_amount<'de, D>(deserializer: D) -> Result<Decimal, D::Error>
where
    D: Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    let amount = parse_decimal(&s).map_err(serde::de::Error::custom)?;
    if amount < Decimal::ZERO {
        return Err(serde::de::Error::custom(format!("negative amount {}", s)));
    }
    Ok(amount)
}

/// Custom deserializer for price levels from array of string pairs
fn deserialize_price_levels<'de, D>(deserializer: D) -> Result<Vec<PriceLevel>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Vec<Vec<String>> = Deserialize::deserialize(deserializer)?;
    raw.into_iter()
        .map(|pair| {
            if pair.len() != 2 {
                return Err(serde::de::Error::custom("Invalid price level format"));
            }
            let price = parse_decimal(&pair[0]).map_err(serde::de::Error::custom)?;
            let quantity = parse_decimal(&pair[1]).map_err(serde::de::Error::custom)?;
            if price <= Decimal::ZERO {
                return Err(serde::de::Error::custom(format!("non-positive price {}", pair[0])));
            }
            if quantity < Decimal::ZERO {
                return Err(serde::de::Error::custom(format!("negative amount {}", pair[1])));
            }
            Ok(PriceLevel { price, quantity })
        })
        .collect()
}
