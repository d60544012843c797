//! Binance spot adapter
//!
//! Reference implementation of the data source contract.

mod data_source;
mod order_book;
pub mod parser;

pub use data_source::{BinanceDataSource, StreamKind};
pub use order_book::BinanceOrderBook;
