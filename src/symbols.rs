//! Trading pair notation
//!
//! The tracker works with canonical `BASE-QUOTE` pairs only. Each adapter owns
//! a [`SymbolMap`] translating between that form and the exchange's native
//! symbols (`BTCUSDT`, `BTC/USDT`, `btc_usdt`, ...).

use std::collections::HashMap;

use crate::error::{Result, TrackerError};

/// Build a canonical pair from its assets
pub fn combine_to_trading_pair(base: &str, quote: &str) -> String {
    format!("{}-{}", base.to_uppercase(), quote.to_uppercase())
}

/// Split a canonical pair into `(base, quote)`
pub fn split_trading_pair(trading_pair: &str) -> Result<(&str, &str)> {
    validate_trading_pair(trading_pair)?;
    trading_pair
        .split_once('-')
        .ok_or_else(|| TrackerError::UnknownTradingPair(trading_pair.to_string()))
}

/// Check the `BASE-QUOTE` uppercase ASCII form
pub fn validate_trading_pair(trading_pair: &str) -> Result<()> {
    let valid_asset = |asset: &str| {
        !asset.is_empty()
            && asset
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
    };

    match trading_pair.split_once('-') {
        Some((base, quote)) if valid_asset(base) && valid_asset(quote) => Ok(()),
        _ => Err(TrackerError::UnknownTradingPair(format!(
            "{} is not in BASE-QUOTE form",
            trading_pair
        ))),
    }
}

/// Bidirectional map between exchange symbols and canonical trading pairs
#[derive(Debug, Clone, Default)]
pub struct SymbolMap {
    to_pair: HashMap<String, String>,
    to_symbol: HashMap<String, String>,
}

impl SymbolMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate an exchange symbol with a canonical pair.
    ///
    /// A later association for either side replaces the earlier one in both
    /// directions, keeping the map one-to-one.
    pub fn insert(&mut self, exchange_symbol: &str, trading_pair: &str) -> Result<()> {
        validate_trading_pair(trading_pair)?;

        if let Some(old_pair) = self.to_pair.remove(exchange_symbol) {
            self.to_symbol.remove(&old_pair);
        }
        if let Some(old_symbol) = self.to_symbol.remove(trading_pair) {
            self.to_pair.remove(&old_symbol);
        }

        self.to_pair
            .insert(exchange_symbol.to_string(), trading_pair.to_string());
        self.to_symbol
            .insert(trading_pair.to_string(), exchange_symbol.to_string());
        Ok(())
    }

    /// Translate an exchange symbol to the canonical pair
    pub fn trading_pair(&self, exchange_symbol: &str) -> Result<&str> {
        self.to_pair
            .get(exchange_symbol)
            .map(String::as_str)
            .ok_or_else(|| TrackerError::UnknownSymbol(exchange_symbol.to_string()))
    }

    /// Translate a canonical pair to the exchange symbol
    pub fn exchange_symbol(&self, trading_pair: &str) -> Result<&str> {
        self.to_symbol
            .get(trading_pair)
            .map(String::as_str)
            .ok_or_else(|| TrackerError::UnknownTradingPair(trading_pair.to_string()))
    }

    pub fn contains_pair(&self, trading_pair: &str) -> bool {
        self.to_symbol.contains_key(trading_pair)
    }

    /// All known canonical pairs
    pub fn trading_pairs(&self) -> Vec<String> {
        self.to_symbol.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.to_pair.len()
    }

    pub fn is_empty(&self) -> bool {
        self.to_pair.is_empty()
    }
}
