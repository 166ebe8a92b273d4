// ===============================
// src/binance.rs
// ===============================
//
// Client Binance spot yang tipis:
// - signing HMAC-SHA256 untuk endpoint SIGNED
// - myTrades (spot & margin) -> trade history untuk sync
// - account / exchangeInfo -> balances & markets
// - listenKey + decoding event user data stream
//
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use serde::{de::DeserializeOwned, Deserialize};
use sha2::Sha256;
use tracing::debug;

use crate::account::BalanceUpdate;
use crate::domain::{Balance, BalanceMap, Decimal, ExchangeName, MarginSettings, Market, MarketMap, Side, Trade};
use crate::stream::UserEvent;
use crate::venue::{Exchange, TradeHistoryService, TradeQueryOptions, VenueError};

pub const EXCHANGE_NAME: &str = "binance";
const MAX_TRADES_PER_PAGE: usize = 1000;

pub fn timestamp_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

pub fn sign_query(secret: &str, query: &str) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(query.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

fn encode_params(params: &[(&str, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

fn millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

#[derive(Debug, Clone)]
pub struct BinanceConfig {
    pub rest_url: String,
    pub api_key: String,
    pub api_secret: String,
    pub recv_window: u64,
    pub margin: MarginSettings,
}

pub struct BinanceClient {
    http: reqwest::Client,
    cfg: BinanceConfig,
    name: ExchangeName,
}

// ---- REST models ----
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTrade {
    symbol: String,
    id: i64,
    order_id: u64,
    #[serde(with = "rust_decimal::serde::str")]
    price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    qty: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    quote_qty: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    commission: Decimal,
    commission_asset: String,
    time: i64,
    is_buyer: bool,
    is_maker: bool,
    #[serde(default)]
    is_isolated: bool,
}

#[derive(Debug, Deserialize)]
struct RawAccount {
    balances: Vec<RawBalance>,
}

#[derive(Debug, Deserialize)]
struct RawBalance {
    asset: String,
    #[serde(with = "rust_decimal::serde::str")]
    free: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    locked: Decimal,
}

#[derive(Debug, Deserialize)]
struct RawExchangeInfo {
    symbols: Vec<RawSymbol>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSymbol {
    symbol: String,
    base_asset: String,
    quote_asset: String,
}

impl RawTrade {
    fn into_trade(self, exchange: &ExchangeName, margin: &MarginSettings) -> Trade {
        Trade {
            gid: 0,
            id: self.id,
            order_id: self.order_id,
            exchange: exchange.clone(),
            symbol: self.symbol,
            price: self.price,
            quantity: self.qty,
            quote_quantity: self.quote_qty,
            side: if self.is_buyer { Side::Buy } else { Side::Sell },
            is_buyer: self.is_buyer,
            is_maker: self.is_maker,
            fee: self.commission,
            fee_currency: self.commission_asset,
            time: millis(self.time),
            is_margin: margin.is_margin,
            is_isolated: margin.is_isolated_margin || self.is_isolated,
            strategy_id: None,
            pnl: None,
        }
    }
}

impl BinanceClient {
    pub fn new(cfg: BinanceConfig) -> Self {
        Self { http: reqwest::Client::new(), cfg, name: ExchangeName::new(EXCHANGE_NAME) }
    }

    async fn decode<T: DeserializeOwned>(rsp: reqwest::Response) -> Result<T, VenueError> {
        let status = rsp.status();
        let body = rsp.text().await?;
        if !status.is_success() {
            return Err(VenueError::Api { status: status.as_u16(), body });
        }
        Ok(serde_json::from_str(&body)?)
    }

    async fn public_get<T: DeserializeOwned>(&self, path: &str) -> Result<T, VenueError> {
        let url = format!("{}{}", self.cfg.rest_url.trim_end_matches('/'), path);
        let rsp = self.http.get(url).send().await?;
        Self::decode(rsp).await
    }

    async fn signed_get<T: DeserializeOwned>(&self, path: &str, mut params: Vec<(&str, String)>) -> Result<T, VenueError> {
        params.push(("timestamp", timestamp_ms().to_string()));
        params.push(("recvWindow", self.cfg.recv_window.to_string()));
        let query = encode_params(&params);
        let sig = sign_query(&self.cfg.api_secret, &query);
        let url = format!("{}{}?{}&signature={}", self.cfg.rest_url.trim_end_matches('/'), path, query, sig);
        let rsp = self.http.get(url).header("X-MBX-APIKEY", &self.cfg.api_key).send().await?;
        Self::decode(rsp).await
    }

    fn user_stream_url(&self, params: &[(&str, String)]) -> String {
        let (path, fixed) = user_stream_endpoint(&self.cfg.margin);
        let mut all: Vec<(&str, String)> = fixed;
        all.extend(params.iter().cloned());
        let base = format!("{}{}", self.cfg.rest_url.trim_end_matches('/'), path);
        if all.is_empty() { base } else { format!("{}?{}", base, encode_params(&all)) }
    }

    pub async fn create_listen_key(&self) -> Result<String, VenueError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct ListenKey {
            listen_key: String,
        }
        let url = self.user_stream_url(&[]);
        let rsp = self.http.post(url).header("X-MBX-APIKEY", &self.cfg.api_key).send().await?;
        let lk: ListenKey = Self::decode(rsp).await?;
        Ok(lk.listen_key)
    }

    /// Listen keys expire after 60 minutes without a keepalive.
    pub async fn keepalive_listen_key(&self, listen_key: &str) -> Result<(), VenueError> {
        let url = self.user_stream_url(&[("listenKey", listen_key.to_string())]);
        let rsp = self.http.put(url).header("X-MBX-APIKEY", &self.cfg.api_key).send().await?;
        let _: serde_json::Value = Self::decode(rsp).await?;
        Ok(())
    }
}

/// userDataStream path + fixed params for the account mode (spot, cross or isolated margin).
fn user_stream_endpoint(margin: &MarginSettings) -> (&'static str, Vec<(&'static str, String)>) {
    match (margin.is_margin, margin.is_isolated_margin, &margin.isolated_margin_symbol) {
        (true, true, Some(symbol)) => ("/sapi/v1/userDataStream/isolated", vec![("symbol", symbol.clone())]),
        (true, _, _) => ("/sapi/v1/userDataStream", Vec::new()),
        _ => ("/api/v3/userDataStream", Vec::new()),
    }
}

#[async_trait]
impl TradeHistoryService for BinanceClient {
    async fn query_trades(&self, symbol: &str, options: &TradeQueryOptions) -> Result<Vec<Trade>, VenueError> {
        let margin = &self.cfg.margin;
        let limit = match options.limit {
            0 => MAX_TRADES_PER_PAGE,
            n => n.min(MAX_TRADES_PER_PAGE),
        };

        let mut params: Vec<(&str, String)> = vec![("symbol", symbol.to_string()), ("limit", limit.to_string())];
        if options.last_trade_id > 0 {
            // fromId cannot be combined with a time range
            params.push(("fromId", options.last_trade_id.to_string()));
        } else {
            if let Some(t) = options.start_time {
                params.push(("startTime", t.timestamp_millis().to_string()));
            }
            if let Some(t) = options.end_time {
                params.push(("endTime", t.timestamp_millis().to_string()));
            }
        }

        let path = if margin.is_margin {
            if margin.is_isolated_margin {
                params.push(("isIsolated", "TRUE".to_string()));
            }
            "/sapi/v1/margin/myTrades"
        } else {
            "/api/v3/myTrades"
        };

        debug!(%symbol, from_id = options.last_trade_id, limit, path, "binance: query trades");
        let raw: Vec<RawTrade> = self.signed_get(path, params).await?;
        Ok(raw.into_iter().map(|t| t.into_trade(&self.name, margin)).collect())
    }
}

#[async_trait]
impl Exchange for BinanceClient {
    fn name(&self) -> &str { self.name.as_str() }

    fn platform_fee_currency(&self) -> Option<&str> { Some("BNB") }

    fn margin_settings(&self) -> MarginSettings { self.cfg.margin.clone() }

    fn trade_history(&self) -> Option<&dyn TradeHistoryService> { Some(self) }

    async fn query_markets(&self) -> Result<MarketMap, VenueError> {
        let info: RawExchangeInfo = self.public_get("/api/v3/exchangeInfo").await?;
        Ok(info
            .symbols
            .into_iter()
            .map(|s| (s.symbol.clone(), Market::new(s.symbol, s.base_asset, s.quote_asset)))
            .collect())
    }

    async fn query_account_balances(&self) -> Result<BalanceMap, VenueError> {
        let acct: RawAccount = self.signed_get("/api/v3/account", Vec::new()).await?;
        Ok(acct
            .balances
            .into_iter()
            .map(|b| Balance { locked: b.locked, ..Balance::new(b.asset, b.free) })
            .collect())
    }
}

// ---- User data stream models ----
#[derive(Debug, Deserialize)]
struct ExecutionReport {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "S")]
    side: String,
    #[serde(rename = "x")]
    execution_type: String,
    #[serde(rename = "i")]
    order_id: u64,
    #[serde(rename = "t")]
    trade_id: i64,
    #[serde(rename = "L", with = "rust_decimal::serde::str")]
    last_price: Decimal,
    #[serde(rename = "l", with = "rust_decimal::serde::str")]
    last_qty: Decimal,
    #[serde(rename = "Y", with = "rust_decimal::serde::str")]
    last_quote_qty: Decimal,
    #[serde(rename = "n", with = "rust_decimal::serde::str")]
    commission: Decimal,
    #[serde(rename = "N", default)]
    commission_asset: Option<String>,
    #[serde(rename = "T")]
    trade_time: i64,
    #[serde(rename = "m")]
    is_maker: bool,
}

#[derive(Debug, Deserialize)]
struct AccountPosition {
    #[serde(rename = "B")]
    balances: Vec<AccountPositionBalance>,
}

#[derive(Debug, Deserialize)]
struct AccountPositionBalance {
    #[serde(rename = "a")]
    asset: String,
    #[serde(rename = "f", with = "rust_decimal::serde::str")]
    free: Decimal,
    #[serde(rename = "l", with = "rust_decimal::serde::str")]
    locked: Decimal,
}

/// Decodes one user-data stream frame. Events that carry no fill or balance
/// change (order accepted, cancelled, listen key expiry, ...) yield `None`.
pub fn parse_user_event(text: &str, margin: &MarginSettings) -> Result<Option<UserEvent>, VenueError> {
    let v: serde_json::Value = serde_json::from_str(text)?;
    match v.get("e").and_then(|e| e.as_str()) {
        Some("executionReport") => {
            let r: ExecutionReport = serde_json::from_value(v)?;
            if r.execution_type != "TRADE" {
                return Ok(None);
            }
            let Some(side) = Side::parse(&r.side) else {
                return Ok(None);
            };
            Ok(Some(UserEvent::Trade(Trade {
                gid: 0,
                id: r.trade_id,
                order_id: r.order_id,
                exchange: ExchangeName::new(EXCHANGE_NAME),
                symbol: r.symbol,
                price: r.last_price,
                quantity: r.last_qty,
                quote_quantity: r.last_quote_qty,
                side,
                is_buyer: side == Side::Buy,
                is_maker: r.is_maker,
                fee: r.commission,
                fee_currency: r.commission_asset.unwrap_or_default(),
                time: millis(r.trade_time),
                is_margin: margin.is_margin,
                is_isolated: margin.is_isolated_margin,
                strategy_id: None,
                pnl: None,
            })))
        }
        Some("outboundAccountPosition") => {
            let p: AccountPosition = serde_json::from_value(v)?;
            let delta: BalanceMap = p
                .balances
                .into_iter()
                .map(|b| Balance { locked: b.locked, ..Balance::new(b.asset, b.free) })
                .collect();
            Ok(Some(UserEvent::Balances(BalanceUpdate::Delta(delta))))
        }
        _ => Ok(None),
    }
}
