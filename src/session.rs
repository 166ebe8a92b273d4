// ===============================
// src/session.rs (ExchangeSession)
// ===============================
//
// Satu session = satu akun di satu venue:
// - Account (balance ledger) yang di-update dari snapshot + user stream
// - Position per symbol, di-seed dari trade yang sudah persisted lalu
//   di-update dari live trade
//
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, info};

use crate::account::{Account, BalanceUpdate, FeeRates};
use crate::domain::{ExchangeName, MarketMap, Trade, FIAT_CURRENCIES};
use crate::metrics::{self, LIVE_TRADES};
use crate::notifier::NotificationService;
use crate::positions::{ExchangeFee, Position};
use crate::store::{Ordering, QueryTradesOptions, StoreError, TradeStore};
use crate::stream::{SubscriptionId, UserDataStream, UserEvent};
use crate::venue::{Exchange, VenueError};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("venue: {0}")]
    Venue(#[from] VenueError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("market {0} not found")]
    UnknownMarket(String),
}

pub struct ExchangeSession {
    name: String,
    exchange: Arc<dyn Exchange>,
    store: Arc<dyn TradeStore>,
    account: Arc<Account>,
    stream: Arc<UserDataStream>,
    notifier: Arc<NotificationService>,
    fee: ExchangeFee,
    markets: RwLock<MarketMap>,
    positions: RwLock<AHashMap<String, Arc<Position>>>,
    trades: Arc<Mutex<AHashMap<String, Vec<Trade>>>>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
}

impl ExchangeSession {
    pub fn new(
        name: impl Into<String>,
        exchange: Arc<dyn Exchange>,
        store: Arc<dyn TradeStore>,
        notifier: Arc<NotificationService>,
        fee: ExchangeFee,
    ) -> Self {
        let account = Account::with_fee_rates(FeeRates {
            maker_fee_rate: fee.maker_fee_rate,
            taker_fee_rate: fee.taker_fee_rate,
        });
        Self {
            name: name.into(),
            exchange,
            store,
            account: Arc::new(account),
            stream: Arc::new(UserDataStream::new()),
            notifier,
            fee,
            markets: RwLock::new(MarketMap::new()),
            positions: RwLock::new(AHashMap::new()),
            trades: Arc::new(Mutex::new(AHashMap::new())),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str { &self.name }

    pub fn exchange(&self) -> &Arc<dyn Exchange> { &self.exchange }

    pub fn account(&self) -> &Arc<Account> { &self.account }

    pub fn stream(&self) -> &Arc<UserDataStream> { &self.stream }

    pub fn notifier(&self) -> &Arc<NotificationService> { &self.notifier }

    pub fn markets(&self) -> MarketMap { self.markets.read().clone() }

    pub fn position(&self, symbol: &str) -> Option<Arc<Position>> {
        self.positions.read().get(symbol).cloned()
    }

    /// Trades of `symbol` seen by this session (replayed + live), oldest first.
    pub fn trades(&self, symbol: &str) -> Vec<Trade> {
        self.trades.lock().get(symbol).cloned().unwrap_or_default()
    }

    /// Loads markets and the balance snapshot, and binds the account to the stream.
    pub async fn init(&self) -> Result<(), SessionError> {
        let markets = self.exchange.query_markets().await?;
        info!(session = %self.name, markets = markets.len(), "markets loaded");
        *self.markets.write() = markets;

        let balances = self.exchange.query_account_balances().await?;
        info!(session = %self.name, balances = %balances.not_zero(), "account balances");
        self.account.apply(BalanceUpdate::Snapshot(balances));
        metrics::observe_balances(&self.account.balances());

        let account = Arc::clone(&self.account);
        let id = self.stream.subscribe(move |ev| {
            if let UserEvent::Balances(update) = ev {
                account.apply(update.clone());
                metrics::observe_balances(&account.balances());
            }
        });
        self.subscriptions.lock().push(id);
        Ok(())
    }

    /// Seeds the position of `symbol` from persisted trades and binds it to the stream.
    ///
    /// Calling it again for the same symbol returns the existing position.
    pub async fn init_symbol(&self, symbol: &str) -> Result<Arc<Position>, SessionError> {
        if let Some(p) = self.position(symbol) {
            return Ok(p);
        }
        let market = self
            .markets
            .read()
            .get(symbol)
            .cloned()
            .ok_or_else(|| SessionError::UnknownMarket(symbol.to_string()))?;
        let exchange = ExchangeName::new(self.exchange.name());

        let trades = match self.exchange.platform_fee_currency() {
            // BNBUSDT juga harus memasukkan BNB yang terpakai sebagai fee
            Some(fee_ccy) if symbol.starts_with(fee_ccy) => {
                self.store.query_for_trading_fee_currency(&exchange, symbol, fee_ccy).await?
            }
            _ => {
                self.store
                    .query(&QueryTradesOptions {
                        exchange: Some(exchange.clone()),
                        symbol: Some(symbol.to_string()),
                        ordering: Ordering::Asc,
                        ..Default::default()
                    })
                    .await?
            }
        };
        debug!(%symbol, trades = trades.len(), "replaying persisted trades");

        let position = Arc::new(Position::from_market(&market));
        position.set_exchange_fee_rate(exchange, self.fee);
        if let Some(profit) = position.add_trades(&trades) {
            metrics::add_realized(symbol, profit.profit, profit.net_profit);
        }
        metrics::observe_position(&position.snapshot());
        info!(session = %self.name, "{}", position);

        self.trades.lock().insert(symbol.to_string(), trades);

        let id = self.bind_position(symbol, Arc::clone(&position));
        self.subscriptions.lock().push(id);
        self.positions.write().insert(symbol.to_string(), Arc::clone(&position));
        Ok(position)
    }

    fn bind_position(&self, symbol: &str, position: Arc<Position>) -> SubscriptionId {
        let symbol = symbol.to_string();
        let trades = Arc::clone(&self.trades);
        let notifier = Arc::clone(&self.notifier);
        self.stream.subscribe(move |ev| {
            let UserEvent::Trade(t) = ev else { return };
            if t.symbol != symbol {
                return;
            }
            LIVE_TRADES.with_label_values(&[t.exchange.as_str(), &symbol]).inc();
            info!("{t}");
            if let Some(profit) = position.add_trade(t) {
                metrics::add_realized(&symbol, profit.profit, profit.net_profit);
                notifier.notify(format_args!(
                    "{symbol} realized profit {} (net {}) on trade {}",
                    profit.profit.round_dp(8),
                    profit.net_profit.round_dp(8),
                    t.id
                ));
            }
            metrics::observe_position(&position.snapshot());
            trades.lock().entry(symbol.clone()).or_default().push(t.clone());
        })
    }

    /// Symbols worth syncing: markets quoted in fiat whose base currency has a
    /// balance, or only the isolated symbol in isolated margin mode.
    pub fn find_possible_symbols(&self) -> Vec<String> {
        let margin = self.exchange.margin_settings();
        if margin.is_isolated_margin {
            return margin.isolated_margin_symbol.into_iter().collect();
        }

        let balances = self.account.balances();
        self.markets
            .read()
            .values()
            .filter(|m| FIAT_CURRENCIES.contains(&m.quote_currency.as_str()))
            .filter(|m| balances.get(&m.base_currency).map_or(false, |b| !b.total().is_zero()))
            .map(|m| m.symbol.clone())
            .collect()
    }

    /// Drops every stream subscription made by this session.
    pub fn close(&self) {
        for id in self.subscriptions.lock().drain(..) {
            self.stream.unsubscribe(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Balance, BalanceMap, MarginSettings, Market, Side};
    use crate::notifier::tests::Recorder;
    use crate::positions::tests::trade;
    use crate::store::MemoryTradeStore;
    use crate::venue::MockExchange;
    use rust_decimal_macros::dec;

    fn venue() -> MockExchange {
        MockExchange::new("binance")
            .with_market(Market::new("BTCUSDT", "BTC", "USDT"))
            .with_market(Market::new("ETHUSDT", "ETH", "USDT"))
            .with_market(Market::new("ETHBTC", "ETH", "BTC"))
            .with_balances(
                vec![Balance::new("BTC", dec!(0.5)), Balance::new("USDT", dec!(1000)), Balance::new("ETH", dec!(0))]
                    .into_iter()
                    .collect(),
            )
    }

    fn session(ex: MockExchange, store: Arc<MemoryTradeStore>, notifier: Arc<NotificationService>) -> ExchangeSession {
        ExchangeSession::new("binance", Arc::new(ex), store, notifier, ExchangeFee::default())
    }

    #[tokio::test]
    async fn init_symbol_replays_store_and_follows_stream() {
        let store = Arc::new(MemoryTradeStore::new());
        store.insert(&trade(Side::Buy, dec!(10), dec!(100))).await.unwrap();
        let rec = Arc::new(Recorder::default());
        let notifier = Arc::new(NotificationService::new());
        notifier.add_notifier(rec.clone());

        let s = session(venue(), store, notifier);
        s.init().await.unwrap();
        let p = s.init_symbol("BTCUSDT").await.unwrap();
        assert_eq!((p.base(), p.average_cost()), (dec!(10), dec!(100)));

        let mut sell = trade(Side::Sell, dec!(4), dec!(120));
        sell.id = 2;
        s.stream().publish(&UserEvent::Trade(sell));
        let mut other = trade(Side::Sell, dec!(1), dec!(1));
        other.symbol = "ETHUSDT".into();
        s.stream().publish(&UserEvent::Trade(other));

        assert_eq!(p.base(), dec!(6));
        assert_eq!(s.trades("BTCUSDT").len(), 2);
        assert_eq!(rec.0.lock().len(), 1);
        assert!(rec.0.lock()[0].starts_with("BTCUSDT realized profit 80"));
        assert!(Arc::ptr_eq(&p, &s.init_symbol("BTCUSDT").await.unwrap()));
    }

    #[tokio::test]
    async fn balance_events_update_account() {
        let s = session(venue(), Arc::new(MemoryTradeStore::new()), Arc::new(NotificationService::new()));
        s.init().await.unwrap();
        assert_eq!(s.account().balance("USDT").unwrap().available, dec!(1000));

        let delta: BalanceMap = vec![Balance::new("USDT", dec!(900))].into_iter().collect();
        s.stream().publish(&UserEvent::Balances(BalanceUpdate::Delta(delta)));
        assert_eq!(s.account().balance("USDT").unwrap().available, dec!(900));
        assert_eq!(s.account().balance("BTC").unwrap().available, dec!(0.5));

        s.close();
        assert_eq!(s.stream().subscribers(), 0);
    }

    #[tokio::test]
    async fn session_fee_reaches_account_and_positions() {
        let fee = ExchangeFee { maker_fee_rate: dec!(0.0002), taker_fee_rate: dec!(0.0004) };
        let s = ExchangeSession::new(
            "binance",
            Arc::new(venue()),
            Arc::new(MemoryTradeStore::new()),
            Arc::new(NotificationService::new()),
            fee,
        );
        assert_eq!(s.account().fee_rates(), FeeRates { maker_fee_rate: dec!(0.0002), taker_fee_rate: dec!(0.0004) });

        s.init().await.unwrap();
        let p = s.init_symbol("BTCUSDT").await.unwrap();
        assert_eq!(p.snapshot().exchange_fee_rates.get(&ExchangeName::new("binance")), Some(&fee));
    }

    #[tokio::test]
    async fn unknown_market_is_an_error() {
        let s = session(venue(), Arc::new(MemoryTradeStore::new()), Arc::new(NotificationService::new()));
        s.init().await.unwrap();
        assert!(matches!(s.init_symbol("DOGEUSDT").await, Err(SessionError::UnknownMarket(_))));
    }

    #[tokio::test]
    async fn possible_symbols_need_fiat_quote_and_balance() {
        let s = session(venue(), Arc::new(MemoryTradeStore::new()), Arc::new(NotificationService::new()));
        s.init().await.unwrap();
        assert_eq!(s.find_possible_symbols(), vec!["BTCUSDT".to_string()]);

        let isolated = venue().with_margin(MarginSettings {
            is_margin: true,
            is_isolated_margin: true,
            isolated_margin_symbol: Some("ETHUSDT".into()),
        });
        let s = session(isolated, Arc::new(MemoryTradeStore::new()), Arc::new(NotificationService::new()));
        s.init().await.unwrap();
        assert_eq!(s.find_possible_symbols(), vec!["ETHUSDT".to_string()]);
    }
}
