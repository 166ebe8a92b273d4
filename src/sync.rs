// ===============================
// src/sync.rs (trade synchronization pipeline)
// ===============================
//
// Alur per symbol:
// 1) seed dedup set + cursor dari N trade terakhir di store
// 2) loop: rate limit -> query page (fromId = cursor) -> skip yang sudah dikenal
//    -> persist -> forward ke ledger
// 3) berhenti kalau page kosong / hanya berisi trade cursor itu sendiri
//
use std::sync::Arc;

use ahash::AHashSet;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain::{ExchangeName, Trade, TradeKey};
use crate::metrics::{SYNC_PAGES, SYNC_RUNS, TRADES_SYNCED};
use crate::positions::Position;
use crate::ratelimit::RateLimiter;
use crate::store::{MarginMode, StoreError, TradeStore};
use crate::venue::{Exchange, TradeQueryOptions, VenueError};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("{symbol}: query last trades from store: {source}")]
    QueryLast { symbol: String, source: StoreError },
    #[error("{symbol}: query trades from id {last_trade_id}: {source}")]
    QueryTrades { symbol: String, last_trade_id: i64, source: VenueError },
    #[error("{symbol}: insert trade {trade_id}: {source}")]
    Insert { symbol: String, trade_id: i64, source: StoreError },
    #[error("{symbol}: sync cancelled")]
    Cancelled { symbol: String },
}

/// Downstream consumer of newly persisted trades.
pub trait TradeSink: Send + Sync {
    fn on_trade(&self, trade: &Trade);
}

impl TradeSink for Position {
    fn on_trade(&self, trade: &Trade) {
        self.add_trade(trade);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub symbol: String,
    pub pages: usize,
    pub inserted: usize,
    pub skipped: usize,
    /// Cursor after the run (highest id seen).
    pub last_trade_id: i64,
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// How many persisted trades seed the dedup set.
    pub recent_window: usize,
    pub page_limit: usize,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self { recent_window: 50, page_limit: 1000 }
    }
}

pub struct TradeSync {
    store: Arc<dyn TradeStore>,
    limiter: Arc<RateLimiter>,
    options: SyncOptions,
}

impl TradeSync {
    pub fn new(store: Arc<dyn TradeStore>, limiter: Arc<RateLimiter>, options: SyncOptions) -> Self {
        Self { store, limiter, options }
    }

    /// Pulls every trade of `symbol` newer than the persisted ones.
    ///
    /// Callers must not run two syncs of the same (venue, symbol) at once.
    pub async fn sync(
        &self,
        cancel: &CancellationToken,
        exchange: &dyn Exchange,
        symbol: &str,
        sink: Option<&dyn TradeSink>,
    ) -> Result<SyncReport, SyncError> {
        let res = self.run(cancel, exchange, symbol, sink).await;
        let result = match &res {
            Ok(r) if r.pages == 0 => "unsupported",
            Ok(_) => "ok",
            Err(SyncError::Cancelled { .. }) => "cancelled",
            Err(_) => "error",
        };
        SYNC_RUNS.with_label_values(&[symbol, result]).inc();
        res
    }

    async fn run(
        &self,
        cancel: &CancellationToken,
        exchange: &dyn Exchange,
        symbol: &str,
        sink: Option<&dyn TradeSink>,
    ) -> Result<SyncReport, SyncError> {
        let mut report = SyncReport { symbol: symbol.to_string(), ..Default::default() };

        let Some(history) = exchange.trade_history() else {
            warn!(exchange = exchange.name(), %symbol, "exchange does not support trade history, nothing to sync");
            return Ok(report);
        };

        let margin = exchange.margin_settings();
        let symbol = match (&margin.isolated_margin_symbol, margin.is_isolated_margin) {
            (Some(isolated), true) => isolated.as_str(),
            _ => symbol,
        };
        report.symbol = symbol.to_string();
        let mode = MarginMode { is_margin: margin.is_margin, is_isolated: margin.is_isolated_margin };
        let exchange_name = ExchangeName::new(exchange.name());

        debug!(exchange = %exchange_name, %symbol, "querying last trades from store");
        let records = self
            .store
            .query_last(&exchange_name, symbol, mode, self.options.recent_window)
            .await
            .map_err(|source| SyncError::QueryLast { symbol: symbol.to_string(), source })?;

        let mut known: AHashSet<TradeKey> = records.iter().map(Trade::key).collect();
        // newest first
        let mut last_trade_id = records.first().map_or(1, |t| t.id);
        report.last_trade_id = last_trade_id;

        loop {
            if let Err(e) = self.limiter.wait(cancel).await {
                error!(?e, %symbol, "rate limit error");
            }

            let options = TradeQueryOptions {
                last_trade_id,
                limit: self.options.page_limit,
                ..Default::default()
            };
            info!(exchange = %exchange_name, %symbol, from_id = last_trade_id, limit = options.limit, "querying trades");

            let mut page = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(SyncError::Cancelled { symbol: symbol.to_string() });
                }
                res = history.query_trades(symbol, &options) => res.map_err(|source| SyncError::QueryTrades {
                    symbol: symbol.to_string(),
                    last_trade_id,
                    source,
                })?,
            };
            report.pages += 1;
            SYNC_PAGES.with_label_values(&[symbol]).inc();

            if page.is_empty() {
                break;
            }
            if page.len() == 1 && known.contains(&page[0].key()) {
                break;
            }

            page.sort_by_key(|t| t.id);
            let mut fresh = 0usize;
            for mut trade in page {
                let key = trade.key();
                if known.contains(&key) {
                    debug!(trade_id = trade.id, side = %trade.side, "ignore duplicated trade");
                    report.skipped += 1;
                    continue;
                }
                known.insert(key);
                fresh += 1;
                last_trade_id = trade.id;
                report.last_trade_id = last_trade_id;

                trade.is_margin = mode.is_margin;
                trade.is_isolated = mode.is_isolated;

                info!(
                    exchange = %trade.exchange,
                    trade_id = trade.id,
                    symbol = %trade.symbol,
                    side = %trade.side,
                    price = %trade.price,
                    quantity = %trade.quantity,
                    liquidity = trade.liquidity(),
                    time = %trade.time,
                    "inserting trade"
                );
                let inserted = self.store.insert(&trade).await.map_err(|source| SyncError::Insert {
                    symbol: symbol.to_string(),
                    trade_id: trade.id,
                    source,
                })?;
                if !inserted {
                    // persisted earlier but older than the recent window
                    debug!(trade_id = trade.id, "trade already persisted");
                    report.skipped += 1;
                    continue;
                }
                report.inserted += 1;
                TRADES_SYNCED.with_label_values(&[exchange_name.as_str(), symbol]).inc();

                if let Some(sink) = sink {
                    sink.on_trade(&trade);
                }
            }

            if fresh == 0 {
                // venue repeated a known page; nothing more to pull
                break;
            }
        }

        info!(%symbol, pages = report.pages, inserted = report.inserted, last_trade_id = report.last_trade_id, "trade sync done");
        Ok(report)
    }
}

/// Syncs several symbols of one session, one after another.
pub struct SyncService {
    trades: TradeSync,
}

impl SyncService {
    pub fn new(trades: TradeSync) -> Self { Self { trades } }

    /// Stops at the first failing symbol.
    pub async fn sync_session_symbols(
        &self,
        cancel: &CancellationToken,
        exchange: &dyn Exchange,
        symbols: &[String],
        sink: Option<&dyn TradeSink>,
    ) -> Result<Vec<SyncReport>, SyncError> {
        let mut reports = Vec::with_capacity(symbols.len());
        for symbol in symbols {
            info!(exchange = exchange.name(), %symbol, "syncing trades");
            reports.push(self.trades.sync(cancel, exchange, symbol, sink).await?);
        }
        Ok(reports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Side;
    use crate::positions::tests::trade;
    use crate::store::MemoryTradeStore;
    use crate::venue::MockExchange;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
    use std::time::Duration;

    use crate::domain::Decimal;
    use crate::store::{QueryTradesOptions, StoreError};

    fn fills(ids: std::ops::RangeInclusive<i64>) -> Vec<Trade> {
        ids.map(|id| {
            let mut t = trade(if id % 2 == 0 { Side::Sell } else { Side::Buy }, dec!(1), dec!(100));
            t.id = id;
            t
        })
        .collect()
    }

    fn pipeline(store: Arc<dyn TradeStore>) -> TradeSync {
        TradeSync::new(
            store,
            Arc::new(RateLimiter::for_trade_history()),
            SyncOptions { recent_window: 50, page_limit: 3 },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn second_run_inserts_nothing() {
        let store = Arc::new(MemoryTradeStore::new());
        let ex = MockExchange::new("binance").with_trades(fills(1..=7));
        let sync = pipeline(store.clone());
        let cancel = CancellationToken::new();

        let first = sync.sync(&cancel, &ex, "BTCUSDT", None).await.unwrap();
        assert_eq!(first.inserted, 7);
        assert_eq!(first.last_trade_id, 7);
        let ids: Vec<i64> = store.all().iter().map(|t| t.id).collect();
        assert_eq!(ids, (1..=7).collect::<Vec<_>>());

        let second = sync.sync(&cancel, &ex, "BTCUSDT", None).await.unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.pages, 1);
        assert_eq!(store.len(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn single_known_trade_page_terminates() {
        let store = Arc::new(MemoryTradeStore::new());
        let ex = MockExchange::new("binance").with_trades(fills(1..=1));
        let sync = pipeline(store.clone());
        let cancel = CancellationToken::new();

        sync.sync(&cancel, &ex, "BTCUSDT", None).await.unwrap();
        let requests = ex.requests();
        let again = sync.sync(&cancel, &ex, "BTCUSDT", None).await.unwrap();
        assert_eq!(ex.requests(), requests + 1);
        assert_eq!(again, SyncReport { symbol: "BTCUSDT".into(), pages: 1, inserted: 0, skipped: 0, last_trade_id: 1 });
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn new_fills_are_forwarded_in_id_order() {
        let store = Arc::new(MemoryTradeStore::new());
        let mut history = fills(1..=2);
        history.reverse();
        let ex = MockExchange::new("binance").with_trades(history);
        let sync = pipeline(store.clone());
        let cancel = CancellationToken::new();
        let pos = Position::new("BTCUSDT", "BTC", "USDT");

        sync.sync(&cancel, &ex, "BTCUSDT", Some(&pos)).await.unwrap();
        // buy 1 @ 100 then sell 1 @ 100
        assert!(pos.base().is_zero());

        let mut later = trade(Side::Buy, dec!(2), dec!(110));
        later.id = 3;
        ex.push_trade(later);
        let report = sync.sync(&cancel, &ex, "BTCUSDT", Some(&pos)).await.unwrap();
        assert_eq!(report.inserted, 1);
        assert_eq!(pos.base(), dec!(2));
        assert_eq!(pos.average_cost(), dec!(110));
    }

    #[tokio::test(start_paused = true)]
    async fn pages_respect_rate_limit() {
        let store = Arc::new(MemoryTradeStore::new());
        let ex = MockExchange::new("binance").with_trades(fills(1..=7)).with_page_size(3);
        let sync = pipeline(store);
        let start = tokio::time::Instant::now();

        let report = sync.sync(&CancellationToken::new(), &ex, "BTCUSDT", None).await.unwrap();
        // pages: [1,2,3] [3,4,5] [5,6,7] [7]; two free, then one per 5s
        assert_eq!(report.pages, 4);
        assert_eq!(start.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn cancelled_sync_keeps_nothing_partial() {
        let store = Arc::new(MemoryTradeStore::new());
        let ex = MockExchange::new("binance").with_trades(fills(1..=3));
        let sync = pipeline(store.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = sync.sync(&cancel, &ex, "BTCUSDT", None).await.unwrap_err();
        assert!(matches!(err, SyncError::Cancelled { ref symbol } if symbol == "BTCUSDT"));
        assert_eq!(ex.requests(), 0);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn venue_without_history_is_not_an_error() {
        let store = Arc::new(MemoryTradeStore::new());
        let ex = MockExchange::new("binance").with_trades(fills(1..=3)).without_trade_history();
        let report = pipeline(store.clone())
            .sync(&CancellationToken::new(), &ex, "BTCUSDT", None)
            .await
            .unwrap();
        assert_eq!(report.pages, 0);
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn dedup_key_is_id_and_side_only() {
        // Rows sharing id and side collapse even when they differ elsewhere
        // (here the exchange label); the store alone would keep both.
        let store = Arc::new(MemoryTradeStore::new());
        let a = trade(Side::Buy, dec!(1), dec!(100));
        let mut b = a.clone();
        b.exchange = ExchangeName::new("binance_futures");
        b.order_id = 99;
        let mut c = a.clone();
        c.side = Side::Sell;
        let ex = MockExchange::new("binance").with_trades(vec![a, b, c]).with_page_size(10);

        let report = pipeline(store.clone())
            .sync(&CancellationToken::new(), &ex, "BTCUSDT", None)
            .await
            .unwrap();
        assert_eq!(report.inserted, 2);
        let sides: Vec<Side> = store.all().iter().map(|t| t.side).collect();
        assert_eq!(sides, vec![Side::Buy, Side::Sell]);
    }

    #[tokio::test(start_paused = true)]
    async fn isolated_margin_syncs_isolated_symbol() {
        let store = Arc::new(MemoryTradeStore::new());
        let mut t = trade(Side::Buy, dec!(1), dec!(20));
        t.symbol = "ETHUSDT".into();
        let ex = MockExchange::new("binance").with_trades(vec![t]).with_margin(crate::domain::MarginSettings {
            is_margin: true,
            is_isolated_margin: true,
            isolated_margin_symbol: Some("ETHUSDT".into()),
        });

        let report = pipeline(store.clone())
            .sync(&CancellationToken::new(), &ex, "BTCUSDT", None)
            .await
            .unwrap();
        assert_eq!(report.symbol, "ETHUSDT");
        let stored = store.all();
        assert_eq!(stored.len(), 1);
        assert!(stored[0].is_margin && stored[0].is_isolated);
    }

    /// Memory store whose seed query or a chosen insert can be made to fail.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryTradeStore,
        fail_query_last: AtomicBool,
        fail_insert_id: Mutex<Option<i64>>,
    }

    fn disk_full() -> StoreError {
        StoreError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk full"))
    }

    #[async_trait]
    impl TradeStore for FlakyStore {
        async fn query_last(&self, exchange: &ExchangeName, symbol: &str, mode: MarginMode, limit: usize) -> Result<Vec<Trade>, StoreError> {
            if self.fail_query_last.load(AtomicOrdering::Relaxed) {
                return Err(disk_full());
            }
            self.inner.query_last(exchange, symbol, mode, limit).await
        }

        async fn query(&self, options: &QueryTradesOptions) -> Result<Vec<Trade>, StoreError> {
            self.inner.query(options).await
        }

        async fn query_for_trading_fee_currency(&self, exchange: &ExchangeName, symbol: &str, fee_currency: &str) -> Result<Vec<Trade>, StoreError> {
            self.inner.query_for_trading_fee_currency(exchange, symbol, fee_currency).await
        }

        async fn load(&self, id: i64) -> Result<Trade, StoreError> {
            self.inner.load(id).await
        }

        async fn insert(&self, trade: &Trade) -> Result<bool, StoreError> {
            if *self.fail_insert_id.lock() == Some(trade.id) {
                return Err(disk_full());
            }
            self.inner.insert(trade).await
        }

        async fn mark(&self, id: i64, strategy_id: &str) -> Result<(), StoreError> {
            self.inner.mark(id, strategy_id).await
        }

        async fn update_pnl(&self, id: i64, pnl: Decimal) -> Result<(), StoreError> {
            self.inner.update_pnl(id, pnl).await
        }
    }

    fn stored_ids(store: &MemoryTradeStore) -> Vec<i64> {
        store.all().iter().map(|t| t.id).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn failed_page_query_aborts_and_next_run_resumes() {
        let store = Arc::new(MemoryTradeStore::new());
        let ex = MockExchange::new("binance").with_trades(fills(1..=7));
        let sync = pipeline(store.clone());
        ex.fail_from(2);

        let err = sync.sync(&CancellationToken::new(), &ex, "BTCUSDT", None).await.unwrap_err();
        match err {
            SyncError::QueryTrades { symbol, last_trade_id, source } => {
                assert_eq!(symbol, "BTCUSDT");
                assert_eq!(last_trade_id, 3);
                assert!(matches!(source, VenueError::Api { status: 503, .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(stored_ids(&store), vec![1, 2, 3]);

        ex.recover();
        let report = sync.sync(&CancellationToken::new(), &ex, "BTCUSDT", None).await.unwrap();
        assert_eq!(report.inserted, 4);
        assert_eq!(stored_ids(&store), (1..=7).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_insert_is_retried_by_the_next_run() {
        let store = Arc::new(FlakyStore::default());
        *store.fail_insert_id.lock() = Some(5);
        let ex = MockExchange::new("binance").with_trades(fills(1..=7));
        let sync = pipeline(store.clone());
        let sink = Position::new("BTCUSDT", "BTC", "USDT");

        let err = sync.sync(&CancellationToken::new(), &ex, "BTCUSDT", Some(&sink)).await.unwrap_err();
        assert!(matches!(err, SyncError::Insert { ref symbol, trade_id: 5, .. } if symbol == "BTCUSDT"));
        assert_eq!(stored_ids(&store.inner), vec![1, 2, 3, 4]);
        // 1 buy, 2 sell, 3 buy, 4 sell
        assert_eq!(sink.base(), dec!(0));

        *store.fail_insert_id.lock() = None;
        let report = sync.sync(&CancellationToken::new(), &ex, "BTCUSDT", None).await.unwrap();
        assert_eq!(report.inserted, 3);
        assert_eq!(stored_ids(&store.inner), (1..=7).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_seed_query_requests_nothing() {
        let store = Arc::new(FlakyStore::default());
        store.fail_query_last.store(true, AtomicOrdering::Relaxed);
        let ex = MockExchange::new("binance").with_trades(fills(1..=3));

        let err = pipeline(store.clone())
            .sync(&CancellationToken::new(), &ex, "BTCUSDT", None)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::QueryLast { ref symbol, .. } if symbol == "BTCUSDT"));
        assert_eq!(ex.requests(), 0);
        assert!(store.inner.is_empty());
    }
}
