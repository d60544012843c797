//! Per-pair tracking task
//!
//! One [`PairTracker`] owns the writable reference to a single book. It is
//! the only writer of that book, so every snapshot, diff and trade for the
//! pair goes through its queue in arrival order.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, trace};

use super::metrics::TrackerMetrics;
use crate::message::{OrderBookMessage, OrderBookMessageType};
use crate::orderbook::{OrderBook, ReplayWindow, SharedOrderBook};

/// Synchronization state of a trading pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingState {
    /// Not tracked; diffs routed for it are saved for a later start
    Uninitialized,
    /// Empty book exists, diffs are buffered until a snapshot lands
    AwaitingSnapshot,
    /// A snapshot has been applied; diffs apply directly
    Synchronized,
}

/// Work item on a tracking task's queue
#[derive(Debug)]
pub(crate) enum PairEvent {
    Message(OrderBookMessage),
    /// Book fetched over REST when tracking started
    InitialBook(OrderBook),
}

pub(crate) struct PairTracker {
    trading_pair: String,
    book: SharedOrderBook,
    window: ReplayWindow,
    state: watch::Sender<TrackingState>,
    trade_events: broadcast::Sender<OrderBookMessage>,
    metrics: Arc<TrackerMetrics>,
}

impl PairTracker {
    pub(crate) fn new(
        trading_pair: String,
        book: SharedOrderBook,
        window: ReplayWindow,
        state: watch::Sender<TrackingState>,
        trade_events: broadcast::Sender<OrderBookMessage>,
        metrics: Arc<TrackerMetrics>,
    ) -> Self {
        state.send_replace(TrackingState::AwaitingSnapshot);
        Self {
            trading_pair,
            book,
            window,
            state,
            trade_events,
            metrics,
        }
    }

    pub(crate) async fn run(mut self, mut events: UnboundedReceiver<PairEvent>) {
        info!(buffered = self.window.len(), "Tracking order book");
        while let Some(event) = events.recv().await {
            self.handle(event).await;
        }
        debug!("Tracking queue closed");
    }

    pub(crate) async fn handle(&mut self, event: PairEvent) {
        match event {
            PairEvent::InitialBook(book) => self.install_book(book).await,
            PairEvent::Message(message) => match message.message_type {
                OrderBookMessageType::Snapshot => self.apply_snapshot(message).await,
                OrderBookMessageType::Diff => self.apply_diff(message).await,
                OrderBookMessageType::Trade => self.apply_trade(message).await,
            },
        }
    }

    fn is_synchronized(&self) -> bool {
        *self.state.borrow() == TrackingState::Synchronized
    }

    async fn apply_diff(&mut self, diff: OrderBookMessage) {
        if self.is_synchronized() {
            let mut book = self.book.write().await;
            if diff.update_id <= book.snapshot_uid() {
                self.metrics.diffs_rejected.inc();
                trace!(update_id = diff.update_id, "Diff older than snapshot");
                return;
            }
            if book.apply_diffs(&diff.bids, &diff.asks, diff.update_id) {
                self.metrics.diffs_applied.inc();
            } else {
                self.metrics.diffs_rejected.inc();
            }
        } else {
            self.metrics.diffs_buffered.inc();
        }
        self.window.push(diff);
    }

    async fn apply_snapshot(&mut self, snapshot: OrderBookMessage) {
        let replayed = {
            let mut book = self.book.write().await;
            book.apply_snapshot(&snapshot.bids, &snapshot.asks, snapshot.update_id);
            replay(&mut book, &self.window, snapshot.update_id)
        };
        self.metrics.snapshots_applied.inc();
        self.metrics.diffs_replayed.inc_by(replayed);
        self.mark_synchronized(snapshot.update_id, replayed);
    }

    /// Install the REST book fetched at start, unless a newer snapshot won the race
    async fn install_book(&mut self, fetched: OrderBook) {
        let update_id = fetched.snapshot_uid();
        let replayed = {
            let mut book = self.book.write().await;
            if self.is_synchronized() && update_id <= book.fence() {
                debug!(update_id, fence = book.fence(), "Initial book is stale, skipping");
                return;
            }
            let (bids, asks) = fetched.snapshot_rows();
            book.apply_snapshot(&bids, &asks, update_id);
            replay(&mut book, &self.window, update_id)
        };
        self.metrics.snapshots_applied.inc();
        self.metrics.diffs_replayed.inc_by(replayed);
        self.mark_synchronized(update_id, replayed);
    }

    async fn apply_trade(&mut self, trade: OrderBookMessage) {
        if let Some(fields) = &trade.trade {
            self.book.write().await.apply_trade(fields, trade.timestamp);
        }
        // No subscribers is not an error
        if self.trade_events.send(trade).is_ok() {
            self.metrics.trades_republished.inc();
        }
    }

    fn mark_synchronized(&self, update_id: u64, replayed: u64) {
        let previous = self.state.send_replace(TrackingState::Synchronized);
        if previous != TrackingState::Synchronized {
            info!(
                trading_pair = %self.trading_pair,
                update_id,
                replayed,
                "Order book synchronized"
            );
        } else {
            debug!(update_id, replayed, "Order book resynchronized");
        }
    }
}

/// Replay the window suffix newer than `update_id`, returning how many diffs applied
fn replay(book: &mut OrderBook, window: &ReplayWindow, update_id: u64) -> u64 {
    let mut replayed = 0;
    for diff in window.newer_than(update_id) {
        if book.apply_diffs(&diff.bids, &diff.asks, diff.update_id) {
            replayed += 1;
        }
    }
    replayed
}
