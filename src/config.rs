// ===============================
// src/config.rs
// ===============================
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
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use rust_decimal::Decimal;
use thiserror::Error;

use crate::domain::MarginSettings;
use crate::positions::ExchangeFee;
use crate::sync::SyncOptions;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
    #[error("{0} is required for venue mode {1}")]
    Missing(&'static str, &'static str),
}

/// Sumber venue (history + user stream)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VenueMode {
    Mock,
    BinanceSandbox,
    BinanceMainnet,
}

impl VenueMode {
    pub fn parse(s: &str) -> Option<VenueMode> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mock"             => Some(VenueMode::Mock),
            "binance_sandbox"  => Some(VenueMode::BinanceSandbox),
            "binance_mainnet"  => Some(VenueMode::BinanceMainnet),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VenueMode::Mock           => "mock",
            VenueMode::BinanceSandbox => "binance_sandbox",
            VenueMode::BinanceMainnet => "binance_mainnet",
        }
    }

    // Endpoint default per mode
    pub fn default_ws_url(&self) -> &'static str {
        match self {
            VenueMode::Mock            => "wss://testnet.binance.vision/ws", // tidak dipakai saat mock
            VenueMode::BinanceSandbox  => "wss://testnet.binance.vision/ws",
            VenueMode::BinanceMainnet  => "wss://stream.binance.com:9443/ws",
        }
    }

    pub fn default_rest_url(&self) -> &'static str {
        match self {
            VenueMode::Mock            => "https://testnet.binance.vision", // placeholder
            VenueMode::BinanceSandbox  => "https://testnet.binance.vision",
            VenueMode::BinanceMainnet  => "https://api.binance.com",
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "trade_ledger", about = "Trade sync pipeline with position and balance ledgers")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Sync, replay, follow the user stream and re-sync periodically until Ctrl-C (default)
    Run,
    /// One sync pass over every configured symbol, then exit
    Sync,
    /// Replay persisted trades of a symbol and print the average-cost report
    Pnl {
        #[arg(long)]
        symbol: String,
        #[arg(long)]
        price: Decimal,
    },
}

#[derive(Clone, Debug)]
pub struct Settings {
    pub session_name: String,
    pub venue_mode: VenueMode,
    pub symbols: Vec<String>,

    // binance
    pub binance_rest_url: String,
    pub binance_ws_url: String,
    pub binance_api_key: String,
    pub binance_api_secret: String,
    pub binance_recv_window: u64,

    pub fee: ExchangeFee,
    pub margin: MarginSettings,

    // storage / metrics
    pub trade_store: Option<PathBuf>,
    pub metrics_port: u16,

    // sync
    pub sync_rate_every: Duration,
    pub sync_rate_burst: u32,
    pub sync: SyncOptions,
    pub sync_interval: Duration,

    pub strategies: Vec<String>,
}

fn parse_or<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match get(key) {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v.trim().parse().map_err(|_| ConfigError::InvalidValue { key, value: v }),
    }
}

fn flag(get: &impl Fn(&str) -> Option<String>, key: &'static str) -> Result<bool, ConfigError> {
    match get(key).map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(false),
        Some(v) => match v.as_str() {
            "" | "0" | "false" | "no" => Ok(false),
            "1" | "true" | "yes" => Ok(true),
            _ => Err(ConfigError::InvalidValue { key, value: v }),
        },
    }
}

// SYMBOLS=BTCUSDT,ETHUSDT,SOLUSDT
fn list(get: &impl Fn(&str) -> Option<String>, key: &str, upper: bool) -> Vec<String> {
    get(key)
        .map(|s| {
            s.split(',')
                .map(|x| x.trim())
                .filter(|x| !x.is_empty())
                .map(|x| if upper { x.to_ascii_uppercase() } else { x.to_ascii_lowercase() })
                .collect()
        })
        .unwrap_or_default()
}

impl Settings {
    /// Builds settings from a key lookup (environment in production, a map in tests).
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Settings, ConfigError> {
        let venue_mode = match get("VENUE_MODE") {
            None => VenueMode::Mock,
            Some(v) => VenueMode::parse(&v).ok_or(ConfigError::InvalidValue { key: "VENUE_MODE", value: v })?,
        };

        let mut symbols = list(&get, "SYMBOLS", true);
        symbols.dedup();
        if symbols.is_empty() {
            symbols.push("BTCUSDT".to_string());
        }

        let binance_api_key = get("BINANCE_API_KEY").unwrap_or_default();
        let binance_api_secret = get("BINANCE_API_SECRET").unwrap_or_default();
        if venue_mode != VenueMode::Mock {
            if binance_api_key.is_empty() {
                return Err(ConfigError::Missing("BINANCE_API_KEY", venue_mode.as_str()));
            }
            if binance_api_secret.is_empty() {
                return Err(ConfigError::Missing("BINANCE_API_SECRET", venue_mode.as_str()));
            }
        }

        let margin = MarginSettings {
            is_margin: flag(&get, "MARGIN")?,
            is_isolated_margin: flag(&get, "ISOLATED_MARGIN")?,
            isolated_margin_symbol: get("ISOLATED_MARGIN_SYMBOL")
                .map(|s| s.trim().to_ascii_uppercase())
                .filter(|s| !s.is_empty()),
        };
        if margin.is_isolated_margin && margin.isolated_margin_symbol.is_none() {
            return Err(ConfigError::Missing("ISOLATED_MARGIN_SYMBOL", venue_mode.as_str()));
        }

        let default_fee = Decimal::new(1, 3); // 0.1%
        let fee = ExchangeFee {
            maker_fee_rate: parse_or(&get, "MAKER_FEE_RATE", default_fee)?,
            taker_fee_rate: parse_or(&get, "TAKER_FEE_RATE", default_fee)?,
        };

        let mut strategies = list(&get, "STRATEGIES", false);
        if strategies.is_empty() {
            strategies.push("tradelog".to_string());
        }

        Ok(Settings {
            session_name: get("SESSION_NAME").unwrap_or_else(|| "binance".to_string()),
            venue_mode,
            symbols,
            binance_rest_url: get("BINANCE_REST_URL").unwrap_or_else(|| venue_mode.default_rest_url().to_string()),
            binance_ws_url: get("BINANCE_WS_URL").unwrap_or_else(|| venue_mode.default_ws_url().to_string()),
            binance_api_key,
            binance_api_secret,
            binance_recv_window: parse_or(&get, "BINANCE_RECV_WINDOW", 5000)?,
            fee,
            margin,
            trade_store: get("TRADE_STORE").filter(|s| !s.trim().is_empty()).map(PathBuf::from),
            metrics_port: parse_or(&get, "METRICS_PORT", 9898)?,
            sync_rate_every: Duration::from_millis(parse_or(&get, "SYNC_RATE_EVERY_MS", 5000)?),
            sync_rate_burst: parse_or(&get, "SYNC_RATE_BURST", 2)?,
            sync: SyncOptions {
                recent_window: parse_or(&get, "SYNC_RECENT_WINDOW", 50)?,
                page_limit: parse_or(&get, "SYNC_PAGE_LIMIT", 1000)?,
            },
            sync_interval: Duration::from_secs(parse_or(&get, "SYNC_INTERVAL_SECS", 300)?),
            strategies,
        })
    }
}

pub fn load() -> Result<Settings, ConfigError> {
    // Pastikan .env dibaca (agar SYMBOLS, TRADE_STORE, dll ter-load)
    let _ = dotenv();
    Settings::from_lookup(|k| env::var(k).ok())
}
