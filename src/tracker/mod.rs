//! Order book tracker
//!
//! Drives a data source's three listeners, routes their messages to one
//! tracking task per trading pair and exposes read-only books, trade events
//! and synchronization state to consumers.

mod metrics;
mod pair;
mod router;

pub use metrics::TrackerMetrics;
pub use pair::TrackingState;

use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::Config;
use crate::data_source::OrderBookTrackerDataSource;
use crate::error::Result;
use crate::message::OrderBookMessage;
use crate::orderbook::{
    OrderBookHandle, OrderBookManager, OrderBookStatus, ReplayWindow, DEFAULT_REPLAY_WINDOW_CAPACITY,
};
use crate::retry::with_rest_timeout;
use crate::symbols::validate_trading_pair;
use pair::{PairEvent, PairTracker};

/// Buffered trade events per subscriber before it starts lagging
const TRADE_CHANNEL_CAPACITY: usize = 1024;

/// Tracker tuning
#[derive(Debug, Clone)]
pub struct TrackerSettings {
    /// Diffs retained per pair for replay after a snapshot
    pub replay_window_capacity: usize,
    /// Timeout of the initial REST snapshot of a pair
    pub rest_timeout: Duration,
    /// Pause before a failed initial snapshot is fetched again
    pub retry_delay: Duration,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            replay_window_capacity: DEFAULT_REPLAY_WINDOW_CAPACITY,
            rest_timeout: Duration::from_secs(10),
            retry_delay: Duration::from_secs(5),
        }
    }
}

impl From<&Config> for TrackerSettings {
    fn from(config: &Config) -> Self {
        Self {
            replay_window_capacity: config.replay_window_capacity,
            rest_timeout: config.rest_timeout(),
            retry_delay: config.snapshot_throttle(),
        }
    }
}

/// Aborts the wrapped task when dropped
struct TaskGuard(JoinHandle<()>);

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

struct PairEntry {
    sender: UnboundedSender<PairEvent>,
    state: watch::Receiver<TrackingState>,
    _tasks: Vec<TaskGuard>,
}

/// State shared between the tracker and its routers
pub(crate) struct Shared {
    data_source: Arc<dyn OrderBookTrackerDataSource>,
    settings: TrackerSettings,
    books: RwLock<OrderBookManager>,
    pairs: Mutex<HashMap<String, PairEntry>>,
    /// Diffs for pairs that are not tracked yet
    saved: Mutex<HashMap<String, ReplayWindow>>,
    trade_events: broadcast::Sender<OrderBookMessage>,
    metrics: Arc<TrackerMetrics>,
}

/// Keeps one order book per trading pair in sync with an exchange
pub struct OrderBookTracker {
    shared: Arc<Shared>,
    tasks: Mutex<Vec<TaskGuard>>,
}

impl OrderBookTracker {
    pub fn new(data_source: Arc<dyn OrderBookTrackerDataSource>, settings: TrackerSettings) -> Result<Self> {
        let (trade_events, _) = broadcast::channel(TRADE_CHANNEL_CAPACITY);
        let shared = Shared {
            data_source,
            settings,
            books: RwLock::new(OrderBookManager::new()),
            pairs: Mutex::new(HashMap::new()),
            saved: Mutex::new(HashMap::new()),
            trade_events,
            metrics: Arc::new(TrackerMetrics::new()?),
        };
        Ok(Self {
            shared: Arc::new(shared),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Start tracking the data source's pairs, then spawn its listeners and the routers
    pub async fn start(&self) {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            warn!("Order book tracker already started");
            return;
        }

        let source = self.shared.data_source.clone();
        info!(exchange = source.exchange_name(), "Starting order book tracker");

        for trading_pair in source.trading_pairs().await {
            if let Err(e) = self.start_tracking_pair(&trading_pair).await {
                error!(trading_pair = %trading_pair, error = %e, "Cannot track trading pair");
            }
        }

        let (trade_tx, trade_rx) = unbounded_channel();
        let (diff_tx, diff_rx) = unbounded_channel();
        let (snapshot_tx, snapshot_rx) = unbounded_channel();

        let listener = source.clone();
        tasks.push(TaskGuard(tokio::spawn(async move {
            listener.listen_for_trades(trade_tx).await
        })));
        let listener = source.clone();
        tasks.push(TaskGuard(tokio::spawn(async move {
            listener.listen_for_order_book_diffs(diff_tx).await
        })));
        let listener = source;
        tasks.push(TaskGuard(tokio::spawn(async move {
            listener.listen_for_order_book_snapshots(snapshot_tx).await
        })));

        tasks.push(TaskGuard(tokio::spawn(
            router::route_diffs(self.shared.clone(), diff_rx).instrument(info_span!("diff_router")),
        )));
        tasks.push(TaskGuard(tokio::spawn(
            router::route_messages(self.shared.clone(), snapshot_rx, "snapshots")
                .instrument(info_span!("snapshot_router")),
        )));
        tasks.push(TaskGuard(tokio::spawn(
            router::route_messages(self.shared.clone(), trade_rx, "trades")
                .instrument(info_span!("trade_router")),
        )));
    }

    /// Cancel every listener, router and tracking task and drop every book
    /// and saved diff.
    ///
    /// The data source keeps its subscribed pairs, so a later [`start`](Self::start)
    /// tracks them again from fresh snapshots.
    pub async fn stop(&self) {
        self.tasks.lock().await.clear();
        self.shared.pairs.lock().await.clear();
        *self.shared.books.write().await = OrderBookManager::new();
        self.shared.saved.lock().await.clear();
        info!("Order book tracker stopped");
    }

    /// Begin tracking a pair: subscribe it on the data source, create its
    /// book and spawn its tracking and initial snapshot tasks.
    ///
    /// Returns false if the pair is already tracked. Fails if the data source
    /// does not serve the pair.
    pub async fn start_tracking_pair(&self, trading_pair: &str) -> Result<bool> {
        validate_trading_pair(trading_pair)?;
        self.shared
            .data_source
            .subscribe_to_trading_pair(trading_pair)
            .await?;

        let mut pairs = self.shared.pairs.lock().await;
        if pairs.contains_key(trading_pair) {
            return Ok(false);
        }

        let book = self.shared.books.write().await.create_book(trading_pair);
        let mut window = ReplayWindow::new(self.shared.settings.replay_window_capacity);
        if let Some(saved) = self.shared.saved.lock().await.remove(trading_pair) {
            debug!(trading_pair, saved = saved.len(), "Handing over saved diffs");
            window.extend(saved);
        }

        let (sender, events) = unbounded_channel();
        let (state_tx, state) = watch::channel(TrackingState::AwaitingSnapshot);
        let tracker = PairTracker::new(
            trading_pair.to_string(),
            book,
            window,
            state_tx,
            self.shared.trade_events.clone(),
            self.shared.metrics.clone(),
        );

        let span = info_span!("order_book", trading_pair);
        let track = tokio::spawn(tracker.run(events).instrument(span.clone()));
        let fetch = tokio::spawn(
            fetch_initial_book(
                self.shared.data_source.clone(),
                trading_pair.to_string(),
                sender.clone(),
                self.shared.settings.clone(),
            )
            .instrument(span),
        );

        pairs.insert(
            trading_pair.to_string(),
            PairEntry {
                sender,
                state,
                _tasks: vec![TaskGuard(track), TaskGuard(fetch)],
            },
        );
        info!(trading_pair, "Started tracking trading pair");
        Ok(true)
    }

    /// Stop tracking a pair, unsubscribe it and drop its book. Returns false
    /// if it was not tracked.
    pub async fn stop_tracking_pair(&self, trading_pair: &str) -> bool {
        let Some(entry) = self.shared.pairs.lock().await.remove(trading_pair) else {
            return false;
        };
        drop(entry);

        self.shared.books.write().await.remove_book(trading_pair);
        self.shared.saved.lock().await.remove(trading_pair);
        if let Err(e) = self
            .shared
            .data_source
            .unsubscribe_from_trading_pair(trading_pair)
            .await
        {
            warn!(trading_pair, error = %e, "Failed to unsubscribe trading pair");
        }
        info!(trading_pair, "Stopped tracking trading pair");
        true
    }

    pub async fn order_book(&self, trading_pair: &str) -> Option<OrderBookHandle> {
        self.shared.books.read().await.get(trading_pair)
    }

    pub async fn order_books(&self) -> Vec<(String, OrderBookHandle)> {
        self.shared.books.read().await.handles()
    }

    /// Tracked pairs, sorted
    pub async fn trading_pairs(&self) -> Vec<String> {
        let mut pairs: Vec<String> = self.shared.pairs.lock().await.keys().cloned().collect();
        pairs.sort();
        pairs
    }

    /// Receive every trade applied by any tracking task
    pub fn subscribe_trades(&self) -> broadcast::Receiver<OrderBookMessage> {
        self.shared.trade_events.subscribe()
    }

    pub async fn tracking_state(&self, trading_pair: &str) -> TrackingState {
        self.shared
            .pairs
            .lock()
            .await
            .get(trading_pair)
            .map(|entry| *entry.state.borrow())
            .unwrap_or(TrackingState::Uninitialized)
    }

    pub async fn tracking_status(&self) -> BTreeMap<String, TrackingState> {
        self.shared
            .pairs
            .lock()
            .await
            .iter()
            .map(|(pair, entry)| (pair.clone(), *entry.state.borrow()))
            .collect()
    }

    /// True once at least one pair is tracked and every tracked pair is synchronized
    pub async fn ready(&self) -> bool {
        let pairs = self.shared.pairs.lock().await;
        !pairs.is_empty()
            && pairs
                .values()
                .all(|entry| *entry.state.borrow() == TrackingState::Synchronized)
    }

    /// Wait until every pair tracked at the time of the call is synchronized
    pub async fn wait_ready(&self) {
        let states: Vec<watch::Receiver<TrackingState>> = self
            .shared
            .pairs
            .lock()
            .await
            .values()
            .map(|entry| entry.state.clone())
            .collect();

        for mut state in states {
            // Errors only once the pair has been stopped
            let _ = state
                .wait_for(|state| *state == TrackingState::Synchronized)
                .await;
        }
    }

    /// Summaries of every book, sorted by pair
    pub async fn statuses(&self, depth: usize) -> Vec<OrderBookStatus> {
        let mut statuses = Vec::new();
        for (trading_pair, handle) in self.order_books().await {
            statuses.push(handle.status(&trading_pair, depth).await);
        }
        statuses.sort_by(|a, b| a.trading_pair.cmp(&b.trading_pair));
        statuses
    }

    /// Last traded price of every tracked pair, from the data source's REST API
    pub async fn last_traded_prices(&self) -> Result<HashMap<String, Decimal>> {
        let pairs = self.trading_pairs().await;
        with_rest_timeout(
            self.shared.settings.rest_timeout,
            self.shared.data_source.get_last_traded_prices(&pairs),
        )
        .await
    }

    pub fn metrics(&self) -> &TrackerMetrics {
        &self.shared.metrics
    }
}

impl Drop for OrderBookTracker {
    fn drop(&mut self) {
        self.tasks.get_mut().clear();
        if let Ok(mut pairs) = self.shared.pairs.try_lock() {
            pairs.clear();
        }
    }
}

/// Fetch the first REST book of a pair, retrying until it succeeds
async fn fetch_initial_book(
    source: Arc<dyn OrderBookTrackerDataSource>,
    trading_pair: String,
    sender: UnboundedSender<PairEvent>,
    settings: TrackerSettings,
) {
    loop {
        match with_rest_timeout(settings.rest_timeout, source.get_new_order_book(&trading_pair)).await {
            Ok(book) => {
                debug!(update_id = book.snapshot_uid(), "Fetched initial order book");
                if sender.send(PairEvent::InitialBook(book)).is_err() {
                    debug!("Tracking task gone, initial book dropped");
                }
                return;
            }
            Err(e) => {
                error!(
                    error = %e,
                    retry_secs = settings.retry_delay.as_secs(),
                    "Failed to fetch initial order book"
                );
                sleep(settings.retry_delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_source::MockOrderBookTrackerDataSource;
    use crate::error::TrackerError;
    use crate::message::{OrderBookRow, TradeFields, TradeType};
    use crate::orderbook::OrderBook;
    use rust_decimal_macros::dec;
    use std::future::Future;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::timeout;

    const PAIR: &str = "BTC-USDT";

    fn row(price: Decimal, amount: Decimal, update_id: u64) -> OrderBookRow {
        OrderBookRow::new(price, amount, update_id)
    }

    fn book_at(update_id: u64) -> OrderBook {
        let mut book = OrderBook::new();
        book.apply_snapshot(
            &[row(dec!(10), dec!(1), update_id)],
            &[row(dec!(11), dec!(1), update_id)],
            update_id,
        );
        book
    }

    fn diff(pair: &str, update_id: u64, bids: Vec<OrderBookRow>) -> OrderBookMessage {
        OrderBookMessage::diff(pair, update_id, 0.0, bids, vec![])
    }

    /// Data source whose listeners push a fixed script and return
    fn scripted_source(
        pairs: Vec<String>,
        diffs: Vec<OrderBookMessage>,
        trades: Vec<OrderBookMessage>,
        initial_update_id: u64,
    ) -> MockOrderBookTrackerDataSource {
        let mut source = MockOrderBookTrackerDataSource::new();
        source.expect_exchange_name().return_const("mock");
        source.expect_trading_pairs().return_const(pairs);
        source.expect_subscribe_to_trading_pair().returning(|_| Ok(true));
        source.expect_unsubscribe_from_trading_pair().returning(|_| Ok(true));
        source
            .expect_get_new_order_book()
            .returning(move |_| Ok(book_at(initial_update_id)));
        source.expect_listen_for_order_book_diffs().return_once(move |output| {
            for diff in diffs {
                let _ = output.send(diff);
            }
        });
        source.expect_listen_for_trades().return_once(move |output| {
            for trade in trades {
                let _ = output.send(trade);
            }
        });
        source
            .expect_listen_for_order_book_snapshots()
            .return_once(|_| ());
        source
    }

    fn tracker(source: MockOrderBookTrackerDataSource) -> OrderBookTracker {
        OrderBookTracker::new(Arc::new(source), TrackerSettings::default()).unwrap()
    }

    /// Poll `check` until it holds or a second has passed
    async fn eventually<F, Fut>(mut check: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        for _ in 0..100 {
            if check().await {
                return true;
            }
            sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_tracker_synchronizes_and_applies_diffs() {
        let diffs = vec![
            diff(PAIR, 95, vec![row(dec!(9), dec!(5), 95)]),
            diff(PAIR, 101, vec![row(dec!(10), dec!(2), 101)]),
            diff(PAIR, 102, vec![row(dec!(10), dec!(0), 102)]),
        ];
        let tracker = tracker(scripted_source(vec![PAIR.to_string()], diffs, vec![], 100));
        assert!(!tracker.ready().await);

        tracker.start().await;
        tokio_test::assert_ok!(timeout(Duration::from_secs(1), tracker.wait_ready()).await);
        assert!(tracker.ready().await);

        let handle = tracker.order_book(PAIR).await.unwrap();
        let handle_ref = &handle;
        assert!(eventually(|| async move { handle_ref.read().await.fence() == 102 }).await);

        let book = handle.read().await;
        assert_eq!(book.snapshot_uid(), 100);
        assert_eq!(book.bid_levels(), 0);
        assert_eq!(book.bid_amount(dec!(9)), None);
        assert_eq!(book.ask_amount(dec!(11)), Some(dec!(1)));
        assert_eq!(tracker.metrics().received("diff"), 3);
    }

    #[tokio::test]
    async fn test_diffs_for_untracked_pair_are_saved_then_replayed() {
        let pair = "ETH-USDT";
        let diffs = vec![diff(pair, 5, vec![row(dec!(10), dec!(2), 5)])];
        let tracker = tracker(scripted_source(vec![], diffs, vec![], 4));

        tracker.start().await;
        let metrics = tracker.metrics();
        assert!(eventually(|| async move { metrics.diffs_buffered.get() == 1 }).await);
        assert_eq!(tracker.tracking_state(pair).await, TrackingState::Uninitialized);
        assert!(!tracker.ready().await);

        assert!(tracker.start_tracking_pair(pair).await.unwrap());
        timeout(Duration::from_secs(1), tracker.wait_ready()).await.unwrap();

        let book = tracker.order_book(pair).await.unwrap();
        let book = book.read().await;
        assert_eq!(book.snapshot_uid(), 4);
        assert_eq!(book.bid_amount(dec!(10)), Some(dec!(2)));
        assert_eq!(book.fence(), 5);
    }

    #[tokio::test]
    async fn test_trades_reach_subscribers() {
        let trade = OrderBookMessage::trade(
            PAIR,
            42,
            1.0,
            TradeFields {
                price: dec!(10.5),
                amount: dec!(3),
                trade_type: TradeType::Sell,
                trade_id: "42".to_string(),
            },
        );
        let tracker = tracker(scripted_source(vec![PAIR.to_string()], vec![], vec![trade], 1));
        let mut trades = tracker.subscribe_trades();

        tracker.start().await;
        let received = timeout(Duration::from_secs(1), trades.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.update_id, 42);

        let handle = tracker.order_book(PAIR).await.unwrap();
        assert_eq!(handle.read().await.last_trade_price(), Some(dec!(10.5)));
    }

    #[tokio::test]
    async fn test_start_and_stop_tracking_pair() {
        let tracker = tracker(scripted_source(vec![], vec![], vec![], 1));

        assert!(matches!(
            tracker.start_tracking_pair("btcusdt").await,
            Err(TrackerError::UnknownTradingPair(_))
        ));
        assert!(tracker.start_tracking_pair(PAIR).await.unwrap());
        assert!(!tracker.start_tracking_pair(PAIR).await.unwrap());
        assert_eq!(tracker.trading_pairs().await, vec![PAIR.to_string()]);

        timeout(Duration::from_secs(1), tracker.wait_ready()).await.unwrap();
        assert_eq!(
            tracker.tracking_status().await.get(PAIR),
            Some(&TrackingState::Synchronized)
        );

        assert!(tracker.stop_tracking_pair(PAIR).await);
        assert!(!tracker.stop_tracking_pair(PAIR).await);
        assert!(tracker.order_book(PAIR).await.is_none());
        assert_eq!(tracker.tracking_state(PAIR).await, TrackingState::Uninitialized);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_book_fetch_is_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let mut source = MockOrderBookTrackerDataSource::new();
        source.expect_subscribe_to_trading_pair().returning(|_| Ok(true));
        source.expect_get_new_order_book().returning(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(TrackerError::RestApiError("unavailable".to_string()))
            } else {
                Ok(book_at(7))
            }
        });
        let tracker = tracker(source);

        tracker.start_tracking_pair(PAIR).await.unwrap();
        timeout(Duration::from_secs(30), tracker.wait_ready()).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.order_book(PAIR).await.unwrap().snapshot_uid().await, 7);
    }

    #[tokio::test]
    async fn test_statuses_are_sorted() {
        let tracker = tracker(scripted_source(vec![], vec![], vec![], 3));
        tracker.start_tracking_pair("ETH-USDT").await.unwrap();
        tracker.start_tracking_pair(PAIR).await.unwrap();
        timeout(Duration::from_secs(1), tracker.wait_ready()).await.unwrap();

        let statuses = tracker.statuses(5).await;
        let pairs: Vec<&str> = statuses.iter().map(|s| s.trading_pair.as_str()).collect();
        assert_eq!(pairs, vec![PAIR, "ETH-USDT"]);
        assert_eq!(statuses[0].snapshot_uid, 3);
        assert_eq!(statuses[0].bids.len(), 1);
    }

    #[tokio::test]
    async fn test_tracking_pair_changes_reach_data_source() {
        let calls = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut source = MockOrderBookTrackerDataSource::new();
        let subscribed = calls.clone();
        source.expect_subscribe_to_trading_pair().returning(move |pair| {
            subscribed.lock().unwrap().push(format!("subscribe {}", pair));
            Ok(true)
        });
        let unsubscribed = calls.clone();
        source.expect_unsubscribe_from_trading_pair().returning(move |pair| {
            unsubscribed.lock().unwrap().push(format!("unsubscribe {}", pair));
            Ok(true)
        });
        source.expect_get_new_order_book().returning(|_| Ok(book_at(1)));
        let tracker = tracker(source);

        assert!(tracker.start_tracking_pair("SOL-USDT").await.unwrap());
        assert!(tracker.stop_tracking_pair("SOL-USDT").await);
        // Nothing is sent for a pair that is not tracked
        assert!(!tracker.stop_tracking_pair("SOL-USDT").await);

        assert_eq!(
            *calls.lock().unwrap(),
            vec!["subscribe SOL-USDT", "unsubscribe SOL-USDT"]
        );
    }

    #[tokio::test]
    async fn test_pair_rejected_by_data_source_is_not_tracked() {
        let mut source = MockOrderBookTrackerDataSource::new();
        source
            .expect_subscribe_to_trading_pair()
            .returning(|pair| Err(TrackerError::UnknownTradingPair(pair.to_string())));
        let tracker = tracker(source);

        assert!(matches!(
            tracker.start_tracking_pair("DOGE-USDT").await,
            Err(TrackerError::UnknownTradingPair(_))
        ));
        assert!(tracker.trading_pairs().await.is_empty());
        assert!(tracker.order_book("DOGE-USDT").await.is_none());
    }

    #[tokio::test]
    async fn test_stop_drops_books_and_saved_diffs() {
        let diffs = vec![diff("ETH-USDT", 5, vec![row(dec!(10), dec!(2), 5)])];
        let tracker = tracker(scripted_source(vec![PAIR.to_string()], diffs, vec![], 4));

        tracker.start().await;
        timeout(Duration::from_secs(1), tracker.wait_ready()).await.unwrap();
        let metrics = tracker.metrics();
        assert!(eventually(|| async move { metrics.diffs_buffered.get() == 1 }).await);
        let kept = tracker.order_book(PAIR).await.unwrap();

        tracker.stop().await;
        assert!(tracker.order_books().await.is_empty());
        assert!(tracker.tracking_status().await.is_empty());
        assert!(tracker.shared.saved.lock().await.is_empty());
        assert!(!tracker.ready().await);

        // Handles taken before the stop still read the last state
        assert_eq!(kept.snapshot_uid().await, 4);
    }
}
