//! Order book manager
//!
//! Registry of the books owned by the tracker. Consumers only ever receive
//! read handles; the per-pair tracking task keeps the writable reference.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{RwLock, RwLockReadGuard};

use super::{OrderBook, OrderBookStatus};

pub(crate) type SharedOrderBook = Arc<RwLock<OrderBook>>;

/// Read-only view of one tracked order book
#[derive(Debug, Clone)]
pub struct OrderBookHandle {
    book: SharedOrderBook,
}

impl OrderBookHandle {
    pub(crate) fn new(book: SharedOrderBook) -> Self {
        Self { book }
    }

    /// Lock the book for reading
    pub async fn read(&self) -> RwLockReadGuard<'_, OrderBook> {
        self.book.read().await
    }

    pub async fn snapshot_uid(&self) -> u64 {
        self.book.read().await.snapshot_uid()
    }

    pub async fn status(&self, trading_pair: &str, depth: usize) -> OrderBookStatus {
        self.book.read().await.status(trading_pair, depth)
    }
}

/// Manages order books for multiple trading pairs
#[derive(Debug, Default)]
pub struct OrderBookManager {
    books: HashMap<String, SharedOrderBook>,
}

impl OrderBookManager {
    /// Create a new order book manager
    pub fn new() -> Self {
        Self {
            books: HashMap::new(),
        }
    }

    /// Register an empty book for a trading pair, returning the writable reference.
    ///
    /// If the pair is already registered the existing book is returned.
    pub(crate) fn create_book(&mut self, trading_pair: &str) -> SharedOrderBook {
        self.books
            .entry(trading_pair.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(OrderBook::new())))
            .clone()
    }

    /// Drop the book of a trading pair
    pub(crate) fn remove_book(&mut self, trading_pair: &str) -> bool {
        self.books.remove(trading_pair).is_some()
    }

    /// Get a read handle for a trading pair
    pub fn get(&self, trading_pair: &str) -> Option<OrderBookHandle> {
        self.books.get(trading_pair).cloned().map(OrderBookHandle::new)
    }

    /// Read handles for every tracked pair
    pub fn handles(&self) -> Vec<(String, OrderBookHandle)> {
        self.books
            .iter()
            .map(|(pair, book)| (pair.clone(), OrderBookHandle::new(book.clone())))
            .collect()
    }

    /// Get list of trading pairs being tracked
    pub fn trading_pairs(&self) -> Vec<String> {
        self.books.keys().cloned().collect()
    }

    /// Check if a trading pair exists
    pub fn has_pair(&self, trading_pair: &str) -> bool {
        self.books.contains_key(trading_pair)
    }

    pub fn len(&self) -> usize {
        self.books.len()
    }

    pub fn is_empty(&self) -> bool {
        self.books.is_empty()
    }
}
