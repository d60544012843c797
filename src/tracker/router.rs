//! Routers draining the listener queues
//!
//! Each listener pushes into one shared queue; the routers here dispatch its
//! messages to the per-pair tracking tasks.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Instant;
use tracing::{debug, info, trace};

use super::pair::PairEvent;
use super::Shared;
use crate::message::OrderBookMessage;
use crate::orderbook::ReplayWindow;

/// Interval between diff router statistics lines
const STATS_LOG_INTERVAL: Duration = Duration::from_secs(60);

/// Outcome of routing one diff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DiffRoute {
    Forwarded,
    /// Older than the pair's last snapshot
    Rejected,
    /// Pair not tracked; held until tracking starts
    Saved,
}

#[derive(Debug, Default)]
struct DiffStats {
    processed: u64,
    rejected: u64,
    saved: u64,
}

impl Shared {
    pub(crate) async fn route_diff(&self, diff: OrderBookMessage) -> DiffRoute {
        let pairs = self.pairs.lock().await;
        let route = pairs.get(&diff.trading_pair).map(|entry| entry.sender.clone());

        let Some(sender) = route else {
            // Still holding the pair map so a concurrent start cannot miss this diff
            self.saved
                .lock()
                .await
                .entry(diff.trading_pair.clone())
                .or_insert_with(|| ReplayWindow::new(self.settings.replay_window_capacity))
                .push(diff);
            self.metrics.diffs_buffered.inc();
            return DiffRoute::Saved;
        };
        drop(pairs);

        if self.is_stale(&diff).await {
            self.metrics.diffs_rejected.inc();
            return DiffRoute::Rejected;
        }

        if sender.send(PairEvent::Message(diff)).is_err() {
            debug!("Tracking task gone, diff dropped");
        }
        DiffRoute::Forwarded
    }

    /// Forward a snapshot or trade to its pair, returning false when the pair is not tracked
    pub(crate) async fn forward(&self, message: OrderBookMessage) -> bool {
        let route = self
            .pairs
            .lock()
            .await
            .get(&message.trading_pair)
            .map(|entry| entry.sender.clone());

        match route {
            Some(sender) => sender.send(PairEvent::Message(message)).is_ok(),
            None => false,
        }
    }

    async fn is_stale(&self, diff: &OrderBookMessage) -> bool {
        let handle = self.books.read().await.get(&diff.trading_pair);
        match handle {
            Some(handle) => {
                let book = handle.read().await;
                book.is_initialized() && diff.update_id <= book.snapshot_uid()
            }
            None => false,
        }
    }
}

pub(crate) async fn route_diffs(shared: Arc<Shared>, mut input: UnboundedReceiver<OrderBookMessage>) {
    let mut stats = DiffStats::default();
    let mut last_report = Instant::now();

    while let Some(diff) = input.recv().await {
        shared.metrics.record_received(diff.message_type);
        match shared.route_diff(diff).await {
            DiffRoute::Forwarded => stats.processed += 1,
            DiffRoute::Rejected => stats.rejected += 1,
            DiffRoute::Saved => stats.saved += 1,
        }

        if last_report.elapsed() >= STATS_LOG_INTERVAL {
            info!(
                processed = stats.processed,
                rejected = stats.rejected,
                saved = stats.saved,
                "Diff messages processed"
            );
            stats = DiffStats::default();
            last_report = Instant::now();
        }
    }
    debug!("Diff queue closed");
}

/// Drain the snapshot or trade queue; messages for untracked pairs are dropped
pub(crate) async fn route_messages(
    shared: Arc<Shared>,
    mut input: UnboundedReceiver<OrderBookMessage>,
    queue: &'static str,
) {
    while let Some(message) = input.recv().await {
        shared.metrics.record_received(message.message_type);
        let trading_pair = message.trading_pair.clone();
        if !shared.forward(message).await {
            trace!(queue, trading_pair = %trading_pair, "No tracking task, message dropped");
        }
    }
    debug!(queue, "Queue closed");
}
