//! Binance order book data source
//!
//! REST snapshots and last prices come from the spot API; trades and depth
//! diffs from the combined WebSocket stream, one connection per listener.

use async_trait::async_trait;
use futures_util::future::try_join_all;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::time::sleep;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::order_book::BinanceOrderBook;
use super::parser::{ExchangeInfo, StreamEvent, TickerPrice};
use crate::config::Config;
use crate::data_source::{
    send_message, MessageMetadata, MessageSender, OrderBookMessageFactory,
    OrderBookTrackerDataSource,
};
use crate::error::{Result, TrackerError};
use crate::message::{now_timestamp, OrderBookMessage};
use crate::orderbook::OrderBook;
use crate::retry::{supervise, with_rest_timeout};
use crate::symbols::{combine_to_trading_pair, split_trading_pair, validate_trading_pair, SymbolMap};
use crate::websocket::WebSocketClient;

const SNAPSHOT_PATH: &str = "/depth";
const TICKER_PRICE_PATH: &str = "/ticker/price";
const EXCHANGE_INFO_PATH: &str = "/exchangeInfo";
const PAIR_CHANGE_CAPACITY: usize = 64;

/// Stream family served by one WebSocket connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Trades,
    Diffs,
}

impl StreamKind {
    fn stream_name(self, exchange_symbol: &str) -> String {
        let symbol = exchange_symbol.to_lowercase();
        match self {
            StreamKind::Trades => format!("{}@trade", symbol),
            StreamKind::Diffs => format!("{}@depth@100ms", symbol),
        }
    }

    fn subscription_id(self) -> u64 {
        match self {
            StreamKind::Trades => 1,
            StreamKind::Diffs => 2,
        }
    }

    fn label(self) -> &'static str {
        match self {
            StreamKind::Trades => "binance.trades",
            StreamKind::Diffs => "binance.diffs",
        }
    }
}

/// Change to the subscribed pair set, fanned out to every open connection
#[derive(Debug, Clone, PartialEq, Eq)]
enum PairChange {
    Subscribe(String),
    Unsubscribe(String),
}

impl PairChange {
    fn method(&self) -> &'static str {
        match self {
            PairChange::Subscribe(_) => "SUBSCRIBE",
            PairChange::Unsubscribe(_) => "UNSUBSCRIBE",
        }
    }

    fn trading_pair(&self) -> &str {
        match self {
            PairChange::Subscribe(pair) | PairChange::Unsubscribe(pair) => pair,
        }
    }
}

/// What woke up a connection's forwarding loop
enum StreamInput {
    Frame(String),
    Change(PairChange),
}

pub struct BinanceDataSource {
    config: Config,
    client: reqwest::Client,
    symbols: RwLock<SymbolMap>,
    /// Pairs currently subscribed; seeded from the configuration
    pairs: RwLock<Vec<String>>,
    changes: broadcast::Sender<PairChange>,
    /// Set once a REST snapshot arrives without `lastUpdateId`
    unsequenced: AtomicBool,
}

impl BinanceDataSource {
    pub fn new(config: Config) -> Self {
        Self::with_symbol_map(config, SymbolMap::new())
    }

    /// Use a preloaded symbol map instead of querying `exchangeInfo`
    pub fn with_symbol_map(config: Config, symbols: SymbolMap) -> Self {
        let (changes, _) = broadcast::channel(PAIR_CHANGE_CAPACITY);
        Self {
            pairs: RwLock::new(config.trading_pairs.clone()),
            config,
            client: reqwest::Client::new(),
            symbols: RwLock::new(symbols),
            changes,
            unsequenced: AtomicBool::new(false),
        }
    }

    /// Translate a canonical pair to its Binance symbol
    pub async fn exchange_symbol_for(&self, trading_pair: &str) -> Result<String> {
        self.ensure_symbol_map().await;
        self.symbols
            .read()
            .await
            .exchange_symbol(trading_pair)
            .map(str::to_string)
    }

    /// Translate a Binance symbol to its canonical pair
    pub async fn trading_pair_for(&self, exchange_symbol: &str) -> Result<String> {
        self.ensure_symbol_map().await;
        self.symbols
            .read()
            .await
            .trading_pair(exchange_symbol)
            .map(str::to_string)
    }

    async fn current_pairs(&self) -> Vec<String> {
        self.pairs.read().await.clone()
    }

    /// Make sure every subscribed pair has a symbol.
    ///
    /// Pairs missing from the instrument listing (or all of them, when the
    /// listing cannot be fetched) are mapped to their concatenated Binance
    /// form, e.g. `BTC-USDT` to `BTCUSDT`.
    async fn ensure_symbol_map(&self) {
        let pairs = self.current_pairs().await;
        if self.covers(&pairs).await {
            return;
        }

        // No lock is held across the REST call
        let listing = with_rest_timeout(self.config.rest_timeout(), self.fetch_exchange_info()).await;

        let mut symbols = self.symbols.write().await;
        if pairs.iter().all(|p| symbols.contains_pair(p)) {
            return;
        }

        match listing {
            Ok(info) => {
                for entry in info.symbols.iter().filter(|s| s.is_trading()) {
                    let pair = combine_to_trading_pair(&entry.base_asset, &entry.quote_asset);
                    if symbols.contains_pair(&pair) {
                        continue;
                    }
                    if let Err(e) = symbols.insert(&entry.symbol, &pair) {
                        debug!(symbol = %entry.symbol, error = %e, "Skipping unmappable symbol");
                    }
                }
                info!(symbols = symbols.len(), "Loaded Binance symbol map");
            }
            Err(e) => {
                warn!(error = %e, "Failed to fetch exchange info, using derived symbols");
            }
        }

        for pair in &pairs {
            if symbols.contains_pair(pair) {
                continue;
            }
            if let Ok((base, quote)) = split_trading_pair(pair) {
                let _ = symbols.insert(&format!("{}{}", base, quote), pair);
            }
        }
    }

    async fn covers(&self, pairs: &[String]) -> bool {
        let symbols = self.symbols.read().await;
        pairs.iter().all(|p| symbols.contains_pair(p))
    }

    async fn fetch_exchange_info(&self) -> Result<ExchangeInfo> {
        let raw = self.get_json(EXCHANGE_INFO_PATH, &[]).await?;
        Ok(ExchangeInfo::deserialize(&raw)?)
    }

    async fn get_json(&self, path: &str, query: &[(&str, String)]) -> Result<Value> {
        let url = format!("{}{}", self.config.rest_endpoint, path);
        let response = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json::<Value>().await?)
    }

    /// Fetch a REST snapshot and translate it
    pub async fn fetch_snapshot_message(&self, trading_pair: &str) -> Result<OrderBookMessage> {
        let symbol = self.exchange_symbol_for(trading_pair).await?;
        let query = [
            ("symbol", symbol),
            ("limit", self.config.snapshot_depth.to_string()),
        ];

        let raw = with_rest_timeout(self.config.rest_timeout(), self.get_json(SNAPSHOT_PATH, &query)).await?;
        self.snapshot_message_from_rest(trading_pair, &raw)
    }

    /// Translate a REST snapshot body.
    ///
    /// A body without `lastUpdateId` switches the source to synthesized ids
    /// for snapshots and diffs alike, so both keep comparable update ids.
    pub(crate) fn snapshot_message_from_rest(&self, trading_pair: &str, raw: &Value) -> Result<OrderBookMessage> {
        if raw.get("lastUpdateId").is_none() && !self.unsequenced.swap(true, Ordering::AcqRel) {
            warn!(
                trading_pair,
                "Snapshot carries no lastUpdateId, synthesizing update ids"
            );
        }

        BinanceOrderBook::snapshot_message_from_exchange(raw, now_timestamp(), &self.metadata_for(trading_pair))
    }

    fn metadata_for(&self, trading_pair: impl Into<String>) -> MessageMetadata {
        MessageMetadata::for_pair(trading_pair)
            .with_synthesized_update_ids(self.unsequenced.load(Ordering::Acquire))
    }

    async fn last_traded_price(&self, trading_pair: &str) -> Result<(String, Decimal)> {
        let symbol = self.exchange_symbol_for(trading_pair).await?;
        let raw = with_rest_timeout(
            self.config.rest_timeout(),
            self.get_json(TICKER_PRICE_PATH, &[("symbol", symbol)]),
        )
        .await?;
        let ticker = TickerPrice::deserialize(&raw)?;
        Ok((trading_pair.to_string(), ticker.price))
    }

    /// Translate one WebSocket frame; `None` for frames carrying no market data
    pub async fn message_from_stream_text(
        &self,
        kind: StreamKind,
        text: &str,
    ) -> Result<Option<OrderBookMessage>> {
        let (raw, expected) = match StreamEvent::parse(text)? {
            StreamEvent::DepthUpdate(raw) => (raw, StreamKind::Diffs),
            StreamEvent::Trade(raw) => (raw, StreamKind::Trades),
            StreamEvent::Response { id } => {
                debug!(id = ?id, "Subscription acknowledged");
                return Ok(None);
            }
            StreamEvent::Unknown(msg) => {
                debug!(msg = %msg, "Unknown message type");
                return Ok(None);
            }
        };

        if expected != kind {
            return Ok(None);
        }

        let symbol = raw
            .get("s")
            .and_then(Value::as_str)
            .ok_or_else(|| TrackerError::MalformedPayload("event without symbol".to_string()))?;
        let metadata = self.metadata_for(self.trading_pair_for(symbol).await?);

        let message = match kind {
            StreamKind::Diffs => {
                let timestamp = raw
                    .get("E")
                    .and_then(Value::as_u64)
                    .map(|ms| ms as f64 / 1_000.0)
                    .unwrap_or_else(now_timestamp);
                BinanceOrderBook::diff_message_from_exchange(&raw, timestamp, &metadata)?
            }
            StreamKind::Trades => BinanceOrderBook::trade_message_from_exchange(&raw, &metadata)?,
        };

        Ok(Some(message))
    }

    /// SUBSCRIBE/UNSUBSCRIBE envelope for `pairs`; `None` when there is nothing to send
    async fn stream_request(&self, method: &str, kind: StreamKind, pairs: &[String]) -> Result<Option<Value>> {
        if pairs.is_empty() {
            return Ok(None);
        }

        let mut params = Vec::with_capacity(pairs.len());
        for pair in pairs {
            let symbol = self.exchange_symbol_for(pair).await?;
            params.push(kind.stream_name(&symbol));
        }

        Ok(Some(json!({
            "method": method,
            "params": params,
            "id": kind.subscription_id(),
        })))
    }

    async fn subscription_request(&self, kind: StreamKind) -> Result<Option<Value>> {
        let pairs = self.current_pairs().await;
        self.stream_request("SUBSCRIBE", kind, &pairs).await
    }

    /// One connection lifetime: connect, subscribe, forward until an error
    async fn stream_messages(&self, kind: StreamKind, output: &MessageSender) -> Result<()> {
        // Registered before the pair set is read, so no change is missed
        let mut changes = self.changes.subscribe();
        let subscription = self.subscription_request(kind).await?;

        let url = format!("{}/stream", self.config.ws_endpoint);
        let mut client = WebSocketClient::new(
            &url,
            self.config.ws_read_timeout(),
            self.config.ws_pong_timeout(),
        );
        client.connect().await?;

        if let Some(subscription) = &subscription {
            client.send_json(subscription).await?;
            info!(
                stream = kind.label(),
                params = %subscription["params"],
                "Subscribed to public stream"
            );
        }

        let result = self.forward_messages(kind, &mut client, &mut changes, output).await;
        client.close().await;
        result
    }

    async fn forward_messages(
        &self,
        kind: StreamKind,
        client: &mut WebSocketClient,
        changes: &mut broadcast::Receiver<PairChange>,
        output: &MessageSender,
    ) -> Result<()> {
        loop {
            let input = tokio::select! {
                text = client.next_text() => StreamInput::Frame(text?),
                change = changes.recv() => StreamInput::Change(change.map_err(|e| {
                    TrackerError::WebSocketMessage(format!("subscription changes lost: {}", e))
                })?),
            };

            match input {
                StreamInput::Frame(text) => match self.message_from_stream_text(kind, &text).await {
                    Ok(Some(message)) => send_message(output, message)?,
                    Ok(None) => {}
                    Err(e) => {
                        warn!(stream = kind.label(), error = %e, "Dropping malformed message");
                    }
                },
                StreamInput::Change(change) => {
                    let pairs = [change.trading_pair().to_string()];
                    if let Some(request) = self.stream_request(change.method(), kind, &pairs).await? {
                        client.send_json(&request).await?;
                        info!(
                            stream = kind.label(),
                            method = change.method(),
                            trading_pair = change.trading_pair(),
                            "Updated stream subscription"
                        );
                    }
                }
            }
        }
    }

    async fn listen(&self, kind: StreamKind, output: MessageSender) {
        supervise(kind.label(), self.config.reconnect_delay(), || {
            self.stream_messages(kind, &output)
        })
        .instrument(info_span!("listener", exchange = "binance", stream = kind.label()))
        .await
    }
}

/// Round-robin REST resync.
///
/// Each round fetches one snapshot per pair in the current set, sleeping
/// `throttle` after every attempt and `interval` once the round is done. A
/// failed fetch is logged and the pair skipped until the next round. Returns
/// once `output` is closed.
async fn poll_snapshots<P, PFut, F, FFut>(
    pairs: P,
    fetch: F,
    throttle: Duration,
    interval: Duration,
    output: &MessageSender,
) where
    P: Fn() -> PFut,
    PFut: Future<Output = Vec<String>>,
    F: Fn(String) -> FFut,
    FFut: Future<Output = Result<OrderBookMessage>>,
{
    loop {
        if output.is_closed() {
            info!("Output queue closed, stopping snapshot listener");
            return;
        }

        for pair in pairs().await {
            match fetch(pair.clone()).await {
                Ok(snapshot) => {
                    if send_message(output, snapshot).is_err() {
                        info!("Output queue closed, stopping snapshot listener");
                        return;
                    }
                    debug!(trading_pair = %pair, "Saved order book snapshot");
                }
                Err(e) => {
                    error!(
                        trading_pair = %pair,
                        error = %e,
                        "Unexpected error fetching order book snapshot"
                    );
                }
            }
            sleep(throttle).await;
        }
        sleep(interval).await;
    }
}

#[async_trait]
impl OrderBookTrackerDataSource for BinanceDataSource {
    fn exchange_name(&self) -> &'static str {
        "binance"
    }

    async fn trading_pairs(&self) -> Vec<String> {
        self.current_pairs().await
    }

    async fn subscribe_to_trading_pair(&self, trading_pair: &str) -> Result<bool> {
        validate_trading_pair(trading_pair)?;
        {
            let mut pairs = self.pairs.write().await;
            if pairs.iter().any(|p| p == trading_pair) {
                return Ok(false);
            }
            pairs.push(trading_pair.to_string());
        }

        if let Err(e) = self.exchange_symbol_for(trading_pair).await {
            self.pairs.write().await.retain(|p| p != trading_pair);
            return Err(e);
        }

        // No receivers just means no connection is open yet
        let _ = self.changes.send(PairChange::Subscribe(trading_pair.to_string()));
        info!(trading_pair, "Subscribed trading pair");
        Ok(true)
    }

    async fn unsubscribe_from_trading_pair(&self, trading_pair: &str) -> Result<bool> {
        let removed = {
            let mut pairs = self.pairs.write().await;
            let before = pairs.len();
            pairs.retain(|p| p != trading_pair);
            pairs.len() != before
        };

        if removed {
            let _ = self.changes.send(PairChange::Unsubscribe(trading_pair.to_string()));
            info!(trading_pair, "Unsubscribed trading pair");
        }
        Ok(removed)
    }

    async fn get_last_traded_prices(&self, trading_pairs: &[String]) -> Result<HashMap<String, Decimal>> {
        let prices = try_join_all(trading_pairs.iter().map(|pair| self.last_traded_price(pair))).await?;
        Ok(prices.into_iter().collect())
    }

    async fn get_new_order_book(&self, trading_pair: &str) -> Result<OrderBook> {
        let snapshot = self.fetch_snapshot_message(trading_pair).await?;
        let mut book = OrderBook::new();
        book.apply_snapshot(&snapshot.bids, &snapshot.asks, snapshot.update_id);
        Ok(book)
    }

    async fn listen_for_trades(&self, output: MessageSender) {
        self.listen(StreamKind::Trades, output).await
    }

    async fn listen_for_order_book_diffs(&self, output: MessageSender) {
        self.listen(StreamKind::Diffs, output).await
    }

    async fn listen_for_order_book_snapshots(&self, output: MessageSender) {
        poll_snapshots(
            || self.current_pairs(),
            |pair| async move { self.fetch_snapshot_message(&pair).await },
            self.config.snapshot_throttle(),
            self.config.snapshot_interval(),
            &output,
        )
        .instrument(info_span!("listener", exchange = "binance", stream = "binance.snapshots"))
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use std::sync::{Arc, Mutex};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::protocol::Message;

    fn offline_config() -> Config {
        Config {
            trading_pairs: vec!["BTC-USDT".to_string()],
            ws_endpoint: "ws://127.0.0.1:1".to_string(),
            rest_endpoint: "http://127.0.0.1:1/api/v3".to_string(),
            reconnect_delay_secs: 1,
            snapshot_throttle_secs: 1,
            rest_timeout_secs: 1,
            ..Config::default()
        }
    }

    fn preloaded() -> BinanceDataSource {
        let mut symbols = SymbolMap::new();
        symbols.insert("BTCUSDT", "BTC-USDT").unwrap();
        symbols.insert("ETHUSDT", "ETH-USDT").unwrap();
        symbols.insert("SOLUSDT", "SOL-USDT").unwrap();
        BinanceDataSource::with_symbol_map(offline_config(), symbols)
    }

    /// Local combined-stream endpoint: client requests come out of
    /// `requests`, frames pushed into `frames` are sent to the client
    struct StreamServer {
        url: String,
        requests: UnboundedReceiver<Value>,
        frames: UnboundedSender<String>,
    }

    async fn stream_server() -> StreamServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (requests_tx, requests) = unbounded_channel();
        let (frames, mut frames_rx) = unbounded_channel::<String>();

        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(socket).await.unwrap();
            let (mut sink, mut stream) = ws.split();

            tokio::spawn(async move {
                while let Some(frame) = frames_rx.recv().await {
                    if sink.send(Message::Text(frame)).await.is_err() {
                        break;
                    }
                }
            });

            while let Some(Ok(msg)) = stream.next().await {
                if let Message::Text(text) = msg {
                    let _ = requests_tx.send(serde_json::from_str::<Value>(&text).unwrap());
                }
            }
        });

        StreamServer {
            url,
            requests,
            frames,
        }
    }

    fn connected_source(url: &str) -> Arc<BinanceDataSource> {
        let mut source = preloaded();
        source.config.ws_endpoint = url.to_string();
        Arc::new(source)
    }

    async fn next_request(server: &mut StreamServer) -> Value {
        timeout(Duration::from_secs(5), server.requests.recv())
            .await
            .expect("no request within 5s")
            .expect("server closed")
    }

    #[tokio::test]
    async fn test_symbol_map_falls_back_to_concatenation() {
        let source = BinanceDataSource::new(offline_config());
        assert_eq!(source.exchange_symbol_for("BTC-USDT").await.unwrap(), "BTCUSDT");
        assert_eq!(source.trading_pair_for("BTCUSDT").await.unwrap(), "BTC-USDT");
        assert!(source.trading_pair_for("DOGEUSDT").await.is_err());
    }

    #[tokio::test]
    async fn test_diff_frame_is_translated_to_canonical_pair() {
        let source = preloaded();
        let text = r#"{"stream":"ethusdt@depth@100ms","data":{"e":"depthUpdate","E":1672531200000,"s":"ETHUSDT","U":10,"u":12,"b":[["3000.1","2"]],"a":[]}}"#;

        let msg = source
            .message_from_stream_text(StreamKind::Diffs, text)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.trading_pair, "ETH-USDT");
        assert_eq!(msg.update_id, 12);
        assert_eq!(msg.timestamp, 1672531200.0);

        // The trade listener ignores depth events
        assert!(source
            .message_from_stream_text(StreamKind::Trades, text)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_malformed_and_control_frames() {
        let source = preloaded();
        assert!(source
            .message_from_stream_text(StreamKind::Diffs, r#"{"result":null,"id":2}"#)
            .await
            .unwrap()
            .is_none());

        let bad_row = r#"{"e":"depthUpdate","E":1,"s":"BTCUSDT","U":1,"u":2,"b":[["x","1"]],"a":[]}"#;
        assert!(matches!(
            source.message_from_stream_text(StreamKind::Diffs, bad_row).await,
            Err(TrackerError::MalformedPayload(_))
        ));

        let unknown_symbol = r#"{"e":"trade","E":1,"s":"XYZABC","t":1,"p":"1","q":"1","T":1,"m":false}"#;
        assert!(matches!(
            source.message_from_stream_text(StreamKind::Trades, unknown_symbol).await,
            Err(TrackerError::UnknownSymbol(_))
        ));
    }

    #[tokio::test]
    async fn test_subscription_request_lists_streams() {
        let source = preloaded();
        let request = source.subscription_request(StreamKind::Diffs).await.unwrap().unwrap();
        assert_eq!(request["method"], "SUBSCRIBE");
        assert_eq!(request["params"][0], "btcusdt@depth@100ms");
        assert_eq!(request["id"], 2);
    }

    #[tokio::test]
    async fn test_diff_listener_survives_connection_failures() {
        let source = std::sync::Arc::new(preloaded());
        let (tx, _rx) = unbounded_channel();

        let listener = source.clone();
        let handle = tokio::spawn(async move {
            listener.listen_for_order_book_diffs(tx).await;
        });

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!handle.is_finished());

        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_get_new_order_book_reports_rest_failure() {
        let source = preloaded();
        assert!(source.get_new_order_book("BTC-USDT").await.is_err());
    }

    #[tokio::test]
    async fn test_no_subscription_without_pairs() {
        let source = preloaded();
        assert!(source.unsubscribe_from_trading_pair("BTC-USDT").await.unwrap());
        assert!(source.subscription_request(StreamKind::Trades).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_subscribed_pairs_join_streams_and_snapshot_rotation() {
        let source = preloaded();
        assert!(source.subscribe_to_trading_pair("SOL-USDT").await.unwrap());
        assert!(!source.subscribe_to_trading_pair("SOL-USDT").await.unwrap());
        assert_eq!(source.trading_pairs().await, vec!["BTC-USDT", "SOL-USDT"]);

        let request = source.subscription_request(StreamKind::Trades).await.unwrap().unwrap();
        assert_eq!(request["params"], json!(["btcusdt@trade", "solusdt@trade"]));

        assert!(source.unsubscribe_from_trading_pair("SOL-USDT").await.unwrap());
        assert!(!source.unsubscribe_from_trading_pair("SOL-USDT").await.unwrap());
        assert_eq!(source.trading_pairs().await, vec!["BTC-USDT"]);
    }

    #[tokio::test]
    async fn test_subscribe_rejects_malformed_pair() {
        let source = preloaded();
        assert!(matches!(
            source.subscribe_to_trading_pair("SOLUSDT").await,
            Err(TrackerError::UnknownTradingPair(_))
        ));
        assert_eq!(source.trading_pairs().await, vec!["BTC-USDT"]);
    }

    #[tokio::test]
    async fn test_pair_changes_reach_open_connection() {
        let mut server = stream_server().await;
        let source = connected_source(&server.url);
        let (tx, _rx) = unbounded_channel();

        let listener = source.clone();
        let handle = tokio::spawn(async move { listener.listen_for_order_book_diffs(tx).await });

        let initial = next_request(&mut server).await;
        assert_eq!(initial["method"], "SUBSCRIBE");
        assert_eq!(initial["params"], json!(["btcusdt@depth@100ms"]));

        source.subscribe_to_trading_pair("SOL-USDT").await.unwrap();
        let added = next_request(&mut server).await;
        assert_eq!(added["method"], "SUBSCRIBE");
        assert_eq!(added["params"], json!(["solusdt@depth@100ms"]));

        source.unsubscribe_from_trading_pair("SOL-USDT").await.unwrap();
        let removed = next_request(&mut server).await;
        assert_eq!(removed["method"], "UNSUBSCRIBE");
        assert_eq!(removed["params"], json!(["solusdt@depth@100ms"]));

        handle.abort();
    }

    #[tokio::test]
    async fn test_malformed_frame_is_dropped_and_stream_continues() {
        let mut server = stream_server().await;
        let source = connected_source(&server.url);
        let (tx, mut rx) = unbounded_channel();

        let listener = source.clone();
        let handle = tokio::spawn(async move { listener.listen_for_order_book_diffs(tx).await });
        next_request(&mut server).await;

        let frames = [
            r#"{"result":null,"id":2}"#,
            r#"{"stream":"btcusdt@depth@100ms","data":{"e":"depthUpdate","E":1,"s":"BTCUSDT","U":1,"u":2,"b":[["x","1"]],"a":[]}}"#,
            r#"{"stream":"btcusdt@depth@100ms","data":{"e":"depthUpdate","E":2,"s":"BTCUSDT","U":3,"u":12,"b":[["100","1"]],"a":[]}}"#,
        ];
        for frame in frames {
            server.frames.send(frame.to_string()).unwrap();
        }

        let msg = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        assert_eq!(msg.trading_pair, "BTC-USDT");
        assert_eq!(msg.update_id, 12);
        assert!(rx.try_recv().is_err());
        assert!(!handle.is_finished());

        handle.abort();
    }

    #[tokio::test]
    async fn test_unsequenced_snapshot_switches_diffs_to_synthesized_ids() {
        let source = preloaded();
        let snapshot = source
            .snapshot_message_from_rest("BTC-USDT", &json!({"bids": [["10", "1"]], "asks": []}))
            .unwrap();
        let diff = source
            .message_from_stream_text(
                StreamKind::Diffs,
                r#"{"e":"depthUpdate","E":1,"s":"BTCUSDT","U":157,"u":160,"b":[["10","0"]],"a":[]}"#,
            )
            .await
            .unwrap()
            .unwrap();

        assert!(diff.update_id > snapshot.update_id);
        assert_eq!(diff.first_update_id, None);
    }

    #[tokio::test]
    async fn test_sequenced_snapshot_keeps_exchange_ids() {
        let source = preloaded();
        let snapshot = source
            .snapshot_message_from_rest("BTC-USDT", &json!({"lastUpdateId": 150, "bids": [], "asks": []}))
            .unwrap();
        let diff = source
            .message_from_stream_text(
                StreamKind::Diffs,
                r#"{"e":"depthUpdate","E":1,"s":"BTCUSDT","U":157,"u":160,"b":[],"a":[]}"#,
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(snapshot.update_id, 150);
        assert_eq!(diff.update_id, 160);
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_rounds_throttle_each_pair_then_wait_interval() {
        let started = tokio::time::Instant::now();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let (tx, mut rx) = unbounded_channel();

        let recorder = calls.clone();
        let poller = tokio::spawn(async move {
            poll_snapshots(
                || async { vec!["BTC-USDT".to_string(), "ETH-USDT".to_string()] },
                move |pair: String| {
                    let calls = recorder.clone();
                    async move {
                        calls.lock().unwrap().push((pair.clone(), started.elapsed().as_secs()));
                        if pair == "ETH-USDT" {
                            return Err(TrackerError::RestTimeout(1));
                        }
                        Ok(OrderBookMessage::snapshot(pair, 1, 0.0, vec![], vec![]))
                    }
                },
                Duration::from_secs(5),
                Duration::from_secs(60),
                &tx,
            )
            .await
        });

        sleep(Duration::from_secs(80)).await;
        assert_eq!(
            *calls.lock().unwrap(),
            vec![
                ("BTC-USDT".to_string(), 0),
                ("ETH-USDT".to_string(), 5),
                ("BTC-USDT".to_string(), 70),
                ("ETH-USDT".to_string(), 75),
            ]
        );

        // Only the successful fetches reach the queue
        let mut delivered = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            delivered.push(msg.trading_pair);
        }
        assert_eq!(delivered, vec!["BTC-USDT", "BTC-USDT"]);

        drop(rx);
        timeout(Duration::from_secs(300), poller).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_symbol_map_stays_readable_during_exchange_info_fetch() {
        // Accepts connections but never answers
        let silent = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut symbols = SymbolMap::new();
        symbols.insert("BTCUSDT", "BTC-USDT").unwrap();
        let config = Config {
            trading_pairs: vec!["BTC-USDT".to_string(), "SOL-USDT".to_string()],
            rest_endpoint: format!("http://{}/api/v3", silent.local_addr().unwrap()),
            ..offline_config()
        };
        let source = Arc::new(BinanceDataSource::with_symbol_map(config, symbols));

        let loader = source.clone();
        let lookup = tokio::spawn(async move { loader.exchange_symbol_for("SOL-USDT").await });
        sleep(Duration::from_millis(200)).await;
        assert!(!lookup.is_finished());

        let readable = timeout(Duration::from_millis(100), source.symbols.read()).await;
        assert!(readable.is_ok());
        drop(readable);

        // The listing times out and the pair falls back to its concatenated symbol
        assert_eq!(lookup.await.unwrap().unwrap(), "SOLUSDT");
        drop(silent);
    }
}
