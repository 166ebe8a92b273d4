// ===============================
// tests/sync_pipeline.rs
// ===============================
//
// Sync pipeline lawan MockExchange + JSONL store di tempdir.
//
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal_macros::dec;
use tokio_util::sync::CancellationToken;

use trade_ledger::domain::{Decimal, ExchangeName, Side, Trade};
use trade_ledger::positions::Position;
use trade_ledger::ratelimit::RateLimiter;
use trade_ledger::store::{JsonlTradeStore, Ordering, QueryTradesOptions, TradeStore};
use trade_ledger::sync::{SyncError, SyncOptions, SyncService, TradeSink, TradeSync};
use trade_ledger::venue::MockExchange;

fn fill(id: i64, side: Side, price: Decimal) -> Trade {
    Trade {
        gid: 0,
        id,
        order_id: id as u64,
        exchange: ExchangeName::new("binance"),
        symbol: "BTCUSDT".into(),
        price,
        quantity: dec!(1),
        quote_quantity: price,
        side,
        is_buyer: side == Side::Buy,
        is_maker: id % 3 == 0,
        fee: dec!(0),
        fee_currency: "BNB".into(),
        time: Utc::now(),
        is_margin: false,
        is_isolated: false,
        strategy_id: None,
        pnl: None,
    }
}

fn history(n: i64) -> Vec<Trade> {
    (1..=n).map(|id| fill(id, Side::Buy, dec!(100) + Decimal::from(id))).collect()
}

// zero interval: limiter never blocks
fn pipeline(store: Arc<dyn TradeStore>, page_limit: usize) -> TradeSync {
    TradeSync::new(
        store,
        Arc::new(RateLimiter::new(Duration::ZERO, 1)),
        SyncOptions { recent_window: 50, page_limit },
    )
}

async fn stored_ids(store: &dyn TradeStore) -> Vec<i64> {
    store
        .query(&QueryTradesOptions { ordering: Ordering::Asc, ..Default::default() })
        .await
        .unwrap()
        .iter()
        .map(|t| t.id)
        .collect()
}

#[tokio::test]
async fn sync_is_idempotent_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state").join("trades.jsonl");
    let venue = MockExchange::new("binance").with_trades(history(9));
    let cancel = CancellationToken::new();

    {
        let store = Arc::new(JsonlTradeStore::open(&path).await.unwrap());
        let report = pipeline(store.clone(), 4).sync(&cancel, &venue, "BTCUSDT", None).await.unwrap();
        assert_eq!(report.inserted, 9);
        assert_eq!(report.last_trade_id, 9);
        assert_eq!(stored_ids(store.as_ref()).await, (1..=9).collect::<Vec<_>>());
    }

    let store = Arc::new(JsonlTradeStore::open(&path).await.unwrap());
    assert_eq!(store.len(), 9);
    let report = pipeline(store.clone(), 4).sync(&cancel, &venue, "BTCUSDT", None).await.unwrap();
    assert_eq!(report.inserted, 0);
    assert_eq!(report.last_trade_id, 9);
    assert_eq!(stored_ids(store.as_ref()).await, (1..=9).collect::<Vec<_>>());

    // new fill on the venue is picked up on the next pass
    venue.push_trade(fill(10, Side::Sell, dec!(120)));
    let report = pipeline(store.clone(), 4).sync(&cancel, &venue, "BTCUSDT", None).await.unwrap();
    assert_eq!(report.inserted, 1);
    assert_eq!(store.len(), 10);
    let gids: Vec<i64> = store
        .query(&QueryTradesOptions::default())
        .await
        .unwrap()
        .iter()
        .map(|t| t.gid)
        .collect();
    assert_eq!(gids, (1..=10).collect::<Vec<_>>());
}

/// Cancels the run once a given trade id went through.
struct CancelAfter {
    trade_id: i64,
    cancel: CancellationToken,
}

impl TradeSink for CancelAfter {
    fn on_trade(&self, trade: &Trade) {
        if trade.id == self.trade_id {
            self.cancel.cancel();
        }
    }
}

#[tokio::test]
async fn cancelled_sync_keeps_persisted_progress() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("trades.jsonl");
    let venue = MockExchange::new("binance").with_trades(history(6));

    {
        let store = Arc::new(JsonlTradeStore::open(&path).await.unwrap());
        let cancel = CancellationToken::new();
        let sink = CancelAfter { trade_id: 3, cancel: cancel.clone() };
        let res = pipeline(store.clone(), 2).sync(&cancel, &venue, "BTCUSDT", Some(&sink)).await;
        assert!(matches!(res, Err(SyncError::Cancelled { ref symbol }) if symbol == "BTCUSDT"));
        assert_eq!(stored_ids(store.as_ref()).await, vec![1, 2, 3]);
    }

    let store = Arc::new(JsonlTradeStore::open(&path).await.unwrap());
    let report = pipeline(store.clone(), 2)
        .sync(&CancellationToken::new(), &venue, "BTCUSDT", None)
        .await
        .unwrap();
    assert_eq!(report.inserted, 3);
    assert_eq!(stored_ids(store.as_ref()).await, (1..=6).collect::<Vec<_>>());
}

#[tokio::test]
async fn replayed_store_matches_position_fed_during_sync() {
    let store: Arc<dyn TradeStore> = Arc::new(trade_ledger::store::MemoryTradeStore::new());
    let mut trades = history(4);
    trades.push(fill(5, Side::Sell, dec!(130)));
    trades.push(fill(6, Side::Sell, dec!(90)));
    let venue = MockExchange::new("binance").with_trades(trades);

    let live = Position::new("BTCUSDT", "BTC", "USDT");
    pipeline(store.clone(), 2)
        .sync(&CancellationToken::new(), &venue, "BTCUSDT", Some(&live))
        .await
        .unwrap();

    let replayed = Position::new("BTCUSDT", "BTC", "USDT");
    let persisted = store
        .query(&QueryTradesOptions { symbol: Some("BTCUSDT".into()), ..Default::default() })
        .await
        .unwrap();
    replayed.add_trades(&persisted);

    assert_eq!(live.snapshot(), replayed.snapshot());
    assert_eq!(live.base(), dec!(2));
    assert_eq!(live.average_cost(), dec!(102.5));
}

#[tokio::test]
async fn session_symbols_are_synced_in_order() {
    let mut eth = fill(1, Side::Buy, dec!(10));
    eth.symbol = "ETHUSDT".into();
    let mut trades = history(3);
    trades.push(eth);
    let venue = MockExchange::new("binance").with_trades(trades);
    let store: Arc<dyn TradeStore> = Arc::new(trade_ledger::store::MemoryTradeStore::new());

    let svc = SyncService::new(pipeline(store.clone(), 10));
    let symbols = vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()];
    let reports = svc
        .sync_session_symbols(&CancellationToken::new(), &venue, &symbols, None)
        .await
        .unwrap();

    assert_eq!(reports.iter().map(|r| r.symbol.as_str()).collect::<Vec<_>>(), vec!["BTCUSDT", "ETHUSDT"]);
    assert_eq!(reports.iter().map(|r| r.inserted).collect::<Vec<_>>(), vec![3, 1]);
}
