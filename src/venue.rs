// ===============================
// src/venue.rs (venue collaborator + mock venue)
// ===============================
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use thiserror::Error;

use crate::domain::{BalanceMap, MarginSettings, Market, MarketMap, Trade};

#[derive(Debug, Error)]
pub enum VenueError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("venue api error {status}: {body}")]
    Api { status: u16, body: String },
    #[error("decode: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("operation not supported by venue: {0}")]
    Unsupported(&'static str),
}

/// Page request for trade history.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TradeQueryOptions {
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub limit: usize,
    /// Inclusive lower bound on the venue trade id ("fromId").
    pub last_trade_id: i64,
}

#[async_trait]
pub trait TradeHistoryService: Send + Sync {
    async fn query_trades(&self, symbol: &str, options: &TradeQueryOptions) -> Result<Vec<Trade>, VenueError>;
}

#[async_trait]
pub trait Exchange: Send + Sync {
    fn name(&self) -> &str;

    /// Currency the venue discounts fees in (BNB on Binance), if any.
    fn platform_fee_currency(&self) -> Option<&str> { None }

    fn margin_settings(&self) -> MarginSettings { MarginSettings::default() }

    /// Trade history capability; venues without it return `None`.
    fn trade_history(&self) -> Option<&dyn TradeHistoryService> { None }

    async fn query_markets(&self) -> Result<MarketMap, VenueError>;

    async fn query_account_balances(&self) -> Result<BalanceMap, VenueError>;
}

/// In-process venue with a fixed trade history, used by `VENUE_MODE=mock` and tests.
///
/// Paging follows Binance `fromId`: the trade whose id equals the cursor is
/// returned again as the first row.
pub struct MockExchange {
    name: String,
    history: Mutex<Vec<Trade>>,
    markets: MarketMap,
    balances: Mutex<BalanceMap>,
    margin: MarginSettings,
    page_size: usize,
    supports_history: bool,
    requests: AtomicUsize,
    fail_from: Mutex<Option<usize>>,
}

impl MockExchange {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            history: Mutex::new(Vec::new()),
            markets: MarketMap::new(),
            balances: Mutex::new(BalanceMap::new()),
            margin: MarginSettings::default(),
            page_size: 1000,
            supports_history: true,
            requests: AtomicUsize::new(0),
            fail_from: Mutex::new(None),
        }
    }

    pub fn with_trades(self, trades: Vec<Trade>) -> Self {
        *self.history.lock() = trades;
        self
    }

    pub fn with_market(mut self, market: Market) -> Self {
        self.markets.insert(market.symbol.clone(), market);
        self
    }

    pub fn with_balances(self, balances: BalanceMap) -> Self {
        *self.balances.lock() = balances;
        self
    }

    pub fn with_margin(mut self, margin: MarginSettings) -> Self {
        self.margin = margin;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn without_trade_history(mut self) -> Self {
        self.supports_history = false;
        self
    }

    /// Appends a trade to the venue history (simulates a new fill).
    pub fn push_trade(&self, trade: Trade) {
        self.history.lock().push(trade);
    }

    /// Number of history page requests served.
    pub fn requests(&self) -> usize { self.requests.load(Ordering::Relaxed) }

    /// History request number `request` (counted from 1) and every later one
    /// fail with a 503 until [`MockExchange::recover`].
    pub fn fail_from(&self, request: usize) {
        *self.fail_from.lock() = Some(request);
    }

    pub fn recover(&self) {
        *self.fail_from.lock() = None;
    }
}

#[async_trait]
impl TradeHistoryService for MockExchange {
    async fn query_trades(&self, symbol: &str, options: &TradeQueryOptions) -> Result<Vec<Trade>, VenueError> {
        let n = self.requests.fetch_add(1, Ordering::Relaxed) + 1;
        if matches!(*self.fail_from.lock(), Some(from) if n >= from) {
            return Err(VenueError::Api { status: 503, body: "mock venue unavailable".into() });
        }
        let limit = if options.limit == 0 { self.page_size } else { options.limit.min(self.page_size) };

        let mut page: Vec<Trade> = self
            .history
            .lock()
            .iter()
            .filter(|t| t.symbol == symbol && t.id >= options.last_trade_id)
            .filter(|t| options.start_time.map_or(true, |s| t.time >= s))
            .filter(|t| options.end_time.map_or(true, |e| t.time <= e))
            .cloned()
            .collect();
        page.sort_by_key(|t| t.id);
        page.truncate(limit);
        Ok(page)
    }
}

#[async_trait]
impl Exchange for MockExchange {
    fn name(&self) -> &str { &self.name }

    fn margin_settings(&self) -> MarginSettings { self.margin.clone() }

    fn trade_history(&self) -> Option<&dyn TradeHistoryService> {
        if self.supports_history { Some(self) } else { None }
    }

    async fn query_markets(&self) -> Result<MarketMap, VenueError> { Ok(self.markets.clone()) }

    async fn query_account_balances(&self) -> Result<BalanceMap, VenueError> {
        Ok(self.balances.lock().clone())
    }
}
