// ===============================
// src/main.rs
// ===============================
/*
 # konfigurasi yang aktif
curl -s localhost:9898/metrics | egrep '^config_(venue_mode|symbol)'

# progress sync & posisi per symbol
curl -s localhost:9898/metrics | grep -E '^(trades_synced_total|sync_runs_total|position_)'

*/
/*
=============================================================================
Project : trade_ledger — trade sync pipeline + position/balance ledgers in Rust
Module  : <module_name>.rs
Version : 0.1.0
License : MIT (see LICENSE)

Summary : Pulls trade history from a venue (mock/Binance) into a durable
          JSONL store exactly once, replays it into per-symbol position
          ledgers, follows the live user data stream for fills and balance
          updates, and exposes Prometheus metrics.
=============================================================================
*/
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use rust_decimal::Decimal;
use tokio::{
    select,
    sync::mpsc,
    time::{interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use trade_ledger::{
    binance::{BinanceClient, BinanceConfig},
    config::{self, Cli, Command, Settings, VenueMode},
    domain::{Balance, BalanceMap, ExchangeName, Market, FIAT_CURRENCIES},
    feed,
    metrics,
    notifier::NotificationService,
    pnl::AverageCostCalculator,
    ratelimit::RateLimiter,
    registry::StrategyRegistry,
    session::ExchangeSession,
    store::{JsonlTradeStore, MemoryTradeStore, Ordering, QueryTradesOptions, TradeStore},
    stream::UserEvent,
    sync::{SyncError, SyncService, TradeSync},
    venue::{Exchange, MockExchange},
};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Concrete venue behind the session (the feed adapter needs the concrete type).
enum Venue {
    Mock(Arc<MockExchange>),
    Binance(Arc<BinanceClient>),
}

impl Venue {
    fn exchange(&self) -> Arc<dyn Exchange> {
        match self {
            Venue::Mock(v) => v.clone() as Arc<dyn Exchange>,
            Venue::Binance(v) => v.clone() as Arc<dyn Exchange>,
        }
    }
}

// BTCUSDT -> (BTC, USDT), cukup untuk mock venue
fn split_symbol(symbol: &str) -> Market {
    for quote in FIAT_CURRENCIES.iter().chain(["BTC", "ETH", "BNB"].iter()) {
        if let Some(base) = symbol.strip_suffix(quote) {
            if !base.is_empty() {
                return Market::new(symbol, base, *quote);
            }
        }
    }
    Market::new(symbol, symbol, "")
}

fn build_venue(s: &Settings) -> Venue {
    match s.venue_mode {
        VenueMode::Mock => {
            let mut v = MockExchange::new(&s.session_name).with_margin(s.margin.clone());
            let mut balances = BalanceMap::new();
            for sym in &s.symbols {
                let m = split_symbol(sym);
                balances.insert(Balance::new(&m.quote_currency, Decimal::new(10_000, 0)));
                v = v.with_market(m);
            }
            Venue::Mock(Arc::new(v.with_balances(balances)))
        }
        VenueMode::BinanceSandbox | VenueMode::BinanceMainnet => Venue::Binance(Arc::new(BinanceClient::new(BinanceConfig {
            rest_url: s.binance_rest_url.clone(),
            api_key: s.binance_api_key.clone(),
            api_secret: s.binance_api_secret.clone(),
            recv_window: s.binance_recv_window,
            margin: s.margin.clone(),
        }))),
    }
}

async fn build_store(s: &Settings) -> Result<Arc<dyn TradeStore>, BoxError> {
    let store: Arc<dyn TradeStore> = match &s.trade_store {
        Some(path) => Arc::new(JsonlTradeStore::open(path).await?),
        None => {
            warn!("TRADE_STORE not set, trades are kept in memory only");
            Arc::new(MemoryTradeStore::new())
        }
    };
    Ok(store)
}

fn build_sync(s: &Settings, store: Arc<dyn TradeStore>) -> SyncService {
    let limiter = Arc::new(RateLimiter::new(s.sync_rate_every, s.sync_rate_burst));
    SyncService::new(TradeSync::new(store, limiter, s.sync.clone()))
}

#[tokio::main]
async fn main() -> ExitCode {
    // ---- Logging ----
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    // ---- Load config ----
    let settings = match config::load() {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    let res = match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(settings).await,
        Command::Sync => sync_once(settings).await,
        Command::Pnl { symbol, price } => pnl(settings, symbol.to_ascii_uppercase(), price).await,
    };
    match res {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "exiting with error");
            ExitCode::FAILURE
        }
    }
}

async fn sync_once(settings: Settings) -> Result<(), BoxError> {
    let venue = build_venue(&settings);
    let store = build_store(&settings).await?;
    let sync = build_sync(&settings, store);

    let cancel = CancellationToken::new();
    spawn_ctrl_c(cancel.clone());
    let reports = sync
        .sync_session_symbols(&cancel, venue.exchange().as_ref(), &settings.symbols, None)
        .await?;
    for r in reports {
        info!(symbol = %r.symbol, pages = r.pages, inserted = r.inserted, last_trade_id = r.last_trade_id, "synced");
    }
    Ok(())
}

async fn pnl(settings: Settings, symbol: String, price: Decimal) -> Result<(), BoxError> {
    let venue = build_venue(&settings);
    let exchange = venue.exchange();
    let store = build_store(&settings).await?;

    let market = match exchange.query_markets().await?.remove(&symbol) {
        Some(m) => m,
        None => split_symbol(&symbol),
    };
    let name = ExchangeName::new(exchange.name());
    let trades = store
        .query(&QueryTradesOptions {
            exchange: Some(name.clone()),
            symbol: Some(symbol.clone()),
            ordering: Ordering::Asc,
            ..Default::default()
        })
        .await?;
    info!(%symbol, trades = trades.len(), "calculating average cost pnl");

    AverageCostCalculator::new(market)
        .with_fee_rate(name, settings.fee)
        .calculate(&trades, price)
        .print();
    Ok(())
}

fn spawn_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received, shutting down");
            cancel.cancel();
        }
    });
}

async fn run(settings: Settings) -> Result<(), BoxError> {
    // ---- Metrics ----
    metrics::init();
    if let Err(e) = metrics::serve_metrics(settings.metrics_port) {
        error!(?e, port = settings.metrics_port, "metrics bind failed, continuing without /metrics");
    }

    info!(
        session = %settings.session_name,
        venue_mode = settings.venue_mode.as_str(),
        symbols = ?settings.symbols,
        store = ?settings.trade_store,
        binance_ws = %settings.binance_ws_url,
        binance_rest = %settings.binance_rest_url,
        "startup config"
    );
    metrics::CONFIG_VENUE_MODE.with_label_values(&[settings.venue_mode.as_str()]).set(1);
    for s in &settings.symbols {
        metrics::CONFIG_SYMBOL.with_label_values(&[s]).set(1);
    }

    let cancel = CancellationToken::new();
    spawn_ctrl_c(cancel.clone());

    let venue = build_venue(&settings);
    let exchange = venue.exchange();
    let store = build_store(&settings).await?;
    let sync = build_sync(&settings, Arc::clone(&store));
    let notifier = NotificationService::with_log();

    let session = Arc::new(ExchangeSession::new(
        settings.session_name.clone(),
        Arc::clone(&exchange),
        store,
        Arc::clone(&notifier),
        settings.fee,
    ));
    session.init().await?;
    info!(candidates = ?session.find_possible_symbols(), "symbols with balance");

    // ---- Sync dulu, baru replay: posisi di-seed dari store ----
    match sync.sync_session_symbols(&cancel, exchange.as_ref(), &settings.symbols, None).await {
        Ok(_) => {}
        Err(SyncError::Cancelled { .. }) => return Ok(()),
        Err(e) => return Err(e.into()),
    }
    for symbol in &settings.symbols {
        session.init_symbol(symbol).await?;
    }

    // ---- Strategies ----
    let registry = StrategyRegistry::with_defaults();
    for id in &settings.strategies {
        let strategy = registry.build(id, serde_json::json!({ "symbols": settings.symbols }))?;
        let subs = strategy.attach(&session);
        info!(strategy = strategy.id(), subscriptions = subs.len(), "strategy attached");
    }

    // ---- Live feed -> dispatcher -> session stream ----
    let (ev_tx, ev_rx) = mpsc::channel::<UserEvent>(4096);
    let dispatcher = tokio::spawn(feed::run_dispatcher(ev_rx, Arc::clone(session.stream()), cancel.clone()));
    let mut feeds = Vec::new();
    match &venue {
        Venue::Mock(mock) => {
            for symbol in &settings.symbols {
                feeds.push(tokio::spawn(feed::run_mock(
                    Arc::clone(mock),
                    symbol.clone(),
                    Decimal::new(100, 0),
                    std::time::Duration::from_secs(1),
                    ev_tx.clone(),
                    cancel.clone(),
                )));
            }
        }
        Venue::Binance(client) => {
            feeds.push(tokio::spawn(feed::run_binance_stream(
                Arc::clone(client),
                settings.binance_ws_url.clone(),
                ev_tx.clone(),
                cancel.clone(),
            )));
        }
    }
    drop(ev_tx);

    // ---- Periodic re-sync (persist only; live feed sudah update ledger) ----
    let mut tick = interval(settings.sync_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tick.tick().await; // first tick fires immediately

    loop {
        select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {
                match sync.sync_session_symbols(&cancel, exchange.as_ref(), &settings.symbols, None).await {
                    Ok(_) => {}
                    Err(SyncError::Cancelled { .. }) => break,
                    Err(e) => warn!(error = %e, "periodic sync failed, retry next interval"),
                }
                for symbol in &settings.symbols {
                    if let Some(p) = session.position(symbol) {
                        info!("{}", p);
                    }
                }
            }
        }
    }

    info!("shutting down feeds...");
    for f in feeds {
        let _ = f.await;
    }
    let _ = dispatcher.await;
    session.close();
    info!(balances = %session.account().balances().not_zero(), "final balances");
    Ok(())
}
