//! Prometheus counters for the tracking pipeline

use prometheus::{IntCounter, IntCounterVec, Opts, Registry};

use crate::error::Result;
use crate::message::OrderBookMessageType;

/// Counters owned by one tracker, registered in its own registry
#[derive(Clone)]
pub struct TrackerMetrics {
    registry: Registry,
    messages_received: IntCounterVec,
    pub diffs_applied: IntCounter,
    pub diffs_rejected: IntCounter,
    pub diffs_buffered: IntCounter,
    pub diffs_replayed: IntCounter,
    pub snapshots_applied: IntCounter,
    pub trades_republished: IntCounter,
}

impl TrackerMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let messages_received = IntCounterVec::new(
            Opts::new(
                "book_tracker_messages_received_total",
                "Messages received from the data source listeners",
            ),
            &["type"],
        )?;
        let diffs_applied = IntCounter::new(
            "book_tracker_diffs_applied_total",
            "Diffs applied to an order book",
        )?;
        let diffs_rejected = IntCounter::new(
            "book_tracker_diffs_rejected_total",
            "Diffs discarded as older than the book",
        )?;
        let diffs_buffered = IntCounter::new(
            "book_tracker_diffs_buffered_total",
            "Diffs held while a pair awaits its snapshot",
        )?;
        let diffs_replayed = IntCounter::new(
            "book_tracker_diffs_replayed_total",
            "Buffered diffs replayed after a snapshot",
        )?;
        let snapshots_applied = IntCounter::new(
            "book_tracker_snapshots_applied_total",
            "Snapshots applied to an order book",
        )?;
        let trades_republished = IntCounter::new(
            "book_tracker_trades_republished_total",
            "Trades forwarded to trade subscribers",
        )?;

        registry.register(Box::new(messages_received.clone()))?;
        registry.register(Box::new(diffs_applied.clone()))?;
        registry.register(Box::new(diffs_rejected.clone()))?;
        registry.register(Box::new(diffs_buffered.clone()))?;
        registry.register(Box::new(diffs_replayed.clone()))?;
        registry.register(Box::new(snapshots_applied.clone()))?;
        registry.register(Box::new(trades_republished.clone()))?;

        Ok(Self {
            registry,
            messages_received,
            diffs_applied,
            diffs_rejected,
            diffs_buffered,
            diffs_replayed,
            snapshots_applied,
            trades_republished,
        })
    }

    pub fn record_received(&self, message_type: OrderBookMessageType) {
        let label = match message_type {
            OrderBookMessageType::Snapshot => "snapshot",
            OrderBookMessageType::Diff => "diff",
            OrderBookMessageType::Trade => "trade",
        };
        self.messages_received.with_label_values(&[label]).inc();
    }

    pub fn received(&self, message_type: &str) -> u64 {
        self.messages_received.with_label_values(&[message_type]).get()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_are_registered() {
        let metrics = TrackerMetrics::new().unwrap();
        metrics.record_received(OrderBookMessageType::Diff);
        metrics.record_received(OrderBookMessageType::Diff);
        metrics.diffs_replayed.inc();

        assert_eq!(metrics.received("diff"), 2);
        assert_eq!(metrics.received("trade"), 0);

        let names: Vec<String> = metrics
            .registry()
            .gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();
        assert!(names.contains(&"book_tracker_diffs_replayed_total".to_string()));
        assert!(names.contains(&"book_tracker_messages_received_total".to_string()));
    }
}
