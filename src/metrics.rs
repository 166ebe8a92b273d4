// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, GaugeVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use rust_decimal::prelude::ToPrimitive;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use tracing::{info, warn};

use crate::domain::{BalanceMap, Decimal};
use crate::positions::PositionState;

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// Metric names/labels are constants; construction can only fail on a typo.
fn counter_vec(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    IntCounterVec::new(Opts::new(name, help), labels).expect("valid counter opts")
}

fn gauge_vec(name: &str, help: &str, labels: &[&str]) -> GaugeVec {
    GaugeVec::new(Opts::new(name, help), labels).expect("valid gauge opts")
}

fn int_gauge_vec(name: &str, help: &str, labels: &[&str]) -> IntGaugeVec {
    IntGaugeVec::new(Opts::new(name, help), labels).expect("valid gauge opts")
}

// -------- Trade sync --------
pub static TRADES_SYNCED: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec("trades_synced_total", "new trades persisted by the sync pipeline", &["exchange", "symbol"])
});

pub static SYNC_RUNS: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec("sync_runs_total", "sync runs by outcome (ok, error, cancelled, unsupported)", &["symbol", "result"])
});

pub static SYNC_PAGES: Lazy<IntCounterVec> =
    Lazy::new(|| counter_vec("sync_pages_total", "trade history pages requested", &["symbol"]));

// -------- Live feed --------
pub static LIVE_TRADES: Lazy<IntCounterVec> =
    Lazy::new(|| counter_vec("live_trades_total", "trades received from the user stream", &["exchange", "symbol"]));

// -------- Ledgers --------
pub static POSITION_BASE: Lazy<GaugeVec> =
    Lazy::new(|| gauge_vec("position_base", "signed base amount per symbol", &["symbol"]));

pub static POSITION_AVG_COST: Lazy<GaugeVec> =
    Lazy::new(|| gauge_vec("position_average_cost", "average cost per symbol", &["symbol"]));

pub static REALIZED_PROFIT: Lazy<GaugeVec> =
    Lazy::new(|| gauge_vec("realized_profit", "cumulative realized profit per symbol (quote)", &["symbol"]));

pub static REALIZED_NET_PROFIT: Lazy<GaugeVec> =
    Lazy::new(|| gauge_vec("realized_net_profit", "cumulative realized net profit per symbol (quote)", &["symbol"]));

pub static BALANCE_AVAILABLE: Lazy<GaugeVec> =
    Lazy::new(|| gauge_vec("balance_available", "available balance per currency", &["currency"]));

pub static BALANCE_LOCKED: Lazy<GaugeVec> =
    Lazy::new(|| gauge_vec("balance_locked", "locked balance per currency", &["currency"]));

// -------- Binance user-data stream health --------
pub static WS_CONNECTED: Lazy<IntGaugeVec> = Lazy::new(|| {
    int_gauge_vec("user_stream_connected", "1 if the user data stream is connected, 0 otherwise", &["venue"])
});

pub static WS_RECONNECTS: Lazy<IntCounterVec> =
    Lazy::new(|| counter_vec("user_stream_reconnects_total", "reconnects to the user data stream", &["venue"]));

pub static WS_LAST_EVENT_TS: Lazy<IntGaugeVec> =
    Lazy::new(|| int_gauge_vec("user_stream_last_event_ts", "unix seconds of the last stream event", &["venue"]));

pub static LISTEN_KEEPALIVE: Lazy<IntCounterVec> =
    Lazy::new(|| counter_vec("listenkey_keepalive_total", "listenKey keepalive calls by result", &["venue", "result"]));

// ---- Config visibility ----
pub static CONFIG_VENUE_MODE: Lazy<IntGaugeVec> =
    Lazy::new(|| int_gauge_vec("config_venue_mode", "venue mode (label: mode)", &["mode"]));

pub static CONFIG_SYMBOL: Lazy<IntGaugeVec> =
    Lazy::new(|| int_gauge_vec("config_symbol", "configured symbols (label: symbol)", &["symbol"]));

pub fn init() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(TRADES_SYNCED.clone()),
        Box::new(SYNC_RUNS.clone()),
        Box::new(SYNC_PAGES.clone()),
        Box::new(LIVE_TRADES.clone()),
        Box::new(POSITION_BASE.clone()),
        Box::new(POSITION_AVG_COST.clone()),
        Box::new(REALIZED_PROFIT.clone()),
        Box::new(REALIZED_NET_PROFIT.clone()),
        Box::new(BALANCE_AVAILABLE.clone()),
        Box::new(BALANCE_LOCKED.clone()),
        Box::new(WS_CONNECTED.clone()),
        Box::new(WS_RECONNECTS.clone()),
        Box::new(WS_LAST_EVENT_TS.clone()),
        Box::new(LISTEN_KEEPALIVE.clone()),
        Box::new(CONFIG_VENUE_MODE.clone()),
        Box::new(CONFIG_SYMBOL.clone()),
    ];
    for c in collectors {
        // AlreadyReg on a second init() is harmless
        let _ = REGISTRY.register(c);
    }
}

fn f64_of(d: Decimal) -> f64 { d.to_f64().unwrap_or(0.0) }

pub fn observe_position(p: &PositionState) {
    POSITION_BASE.with_label_values(&[&p.symbol]).set(f64_of(p.base));
    POSITION_AVG_COST.with_label_values(&[&p.symbol]).set(f64_of(p.average_cost));
}

pub fn add_realized(symbol: &str, profit: Decimal, net_profit: Decimal) {
    REALIZED_PROFIT.with_label_values(&[symbol]).add(f64_of(profit));
    REALIZED_NET_PROFIT.with_label_values(&[symbol]).add(f64_of(net_profit));
}

pub fn observe_balances(balances: &BalanceMap) {
    for b in balances.iter() {
        BALANCE_AVAILABLE.with_label_values(&[&b.currency]).set(f64_of(b.available));
        BALANCE_LOCKED.with_label_values(&[&b.currency]).set(f64_of(b.locked));
    }
}

// Encode all metrics in Prometheus text format
pub fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

// Serve one HTTP request (GET / or /metrics), tiny HTTP 1.1 responder
fn handle_client(mut stream: TcpStream) {
    // Read a bit to consume headers (no full parse)
    let mut _req_buf = [0u8; 1024];
    let _ = stream.read(&mut _req_buf);

    let body = encode_metrics();
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );

    let _ = stream.write_all(header.as_bytes());
    let _ = stream.write_all(&body);
    let _ = stream.flush();
}

/// Binds the metrics port and serves it from a dedicated OS thread (keeps Tokio runtime clean).
pub fn serve_metrics(port: u16) -> std::io::Result<()> {
    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr)?;
    info!("metrics listening on http://{addr}/ (and /metrics)");

    thread::spawn(move || {
        for conn in listener.incoming() {
            match conn {
                Ok(stream) => handle_client(stream),
                Err(e) => warn!(?e, "metrics accept error"),
            }
        }
    });
    Ok(())
}
