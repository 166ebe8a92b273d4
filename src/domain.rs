// ===============================
// src/domain.rs
// ===============================
use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use rust_decimal::Decimal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side { Buy, Sell }

impl Side {
    pub fn reverse(&self) -> Side { match self { Side::Buy => Side::Sell, Side::Sell => Side::Buy } }

    pub fn parse(s: &str) -> Option<Side> {
        match s.trim().to_ascii_lowercase().as_str() {
            "buy" => Some(Side::Buy),
            "sell" => Some(Side::Sell),
            _ => None,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self { Side::Buy => "BUY", Side::Sell => "SELL" })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExchangeName(String);

impl ExchangeName {
    pub fn new(name: impl Into<String>) -> Self { Self(name.into().to_ascii_lowercase()) }
    pub fn as_str(&self) -> &str { &self.0 }
}

impl From<&str> for ExchangeName {
    fn from(s: &str) -> Self { ExchangeName::new(s) }
}

impl fmt::Display for ExchangeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

/// Identity used to deduplicate trades during synchronization.
///
/// Only the venue trade id and the side take part; symbol and exchange do not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TradeKey { pub id: i64, pub side: Side }

/// One executed fill, as reported by the venue or the live feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    /// Storage-assigned global id, 0 until persisted.
    #[serde(default)]
    pub gid: i64,
    /// Venue trade id (pagination cursor).
    pub id: i64,
    pub order_id: u64,
    pub exchange: ExchangeName,
    pub symbol: String,
    pub price: Decimal,
    pub quantity: Decimal,
    pub quote_quantity: Decimal,
    pub side: Side,
    #[serde(default)]
    pub is_buyer: bool,
    pub is_maker: bool,
    pub fee: Decimal,
    pub fee_currency: String,
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub is_margin: bool,
    #[serde(default)]
    pub is_isolated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pnl: Option<Decimal>,
}

impl Trade {
    pub fn key(&self) -> TradeKey { TradeKey { id: self.id, side: self.side } }

    pub fn liquidity(&self) -> &'static str { if self.is_maker { "MAKER" } else { "TAKER" } }
}

impl fmt::Display for Trade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TRADE {} {} {:4} {} @ {} orderID {} {} amount {}",
            self.exchange,
            self.symbol,
            self.side,
            self.quantity,
            self.price,
            self.order_id,
            self.time.format("%b %e %H:%M:%S%.3f"),
            self.quote_quantity,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Market {
    pub symbol: String,
    pub base_currency: String,
    pub quote_currency: String,
}

impl Market {
    pub fn new(symbol: impl Into<String>, base: impl Into<String>, quote: impl Into<String>) -> Self {
        Self { symbol: symbol.into(), base_currency: base.into(), quote_currency: quote.into() }
    }
}

pub type MarketMap = BTreeMap<String, Market>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MarginSettings {
    pub is_margin: bool,
    pub is_isolated_margin: bool,
    pub isolated_margin_symbol: Option<String>,
}

pub const FIAT_CURRENCIES: &[&str] = &["USDT", "USDC", "USD", "BUSD", "TUSD", "EUR"];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub currency: String,
    pub available: Decimal,
    #[serde(default)]
    pub locked: Decimal,
    #[serde(default)]
    pub borrowed: Decimal,
    #[serde(default)]
    pub interest: Decimal,
    /// (available + locked) - borrowed - interest, as reported by the venue.
    #[serde(default)]
    pub net_asset: Decimal,
    #[serde(default)]
    pub max_withdraw_amount: Decimal,
}

impl Balance {
    pub fn new(currency: impl Into<String>, available: Decimal) -> Self {
        Self { currency: currency.into(), available, ..Default::default() }
    }

    pub fn total(&self) -> Decimal { self.available + self.locked }

    pub fn debt(&self) -> Decimal { self.borrowed + self.interest }

    pub fn net(&self) -> Decimal { self.total() - self.debt() }

    pub fn add(&self, other: &Balance) -> Balance {
        Balance {
            currency: self.currency.clone(),
            available: self.available + other.available,
            locked: self.locked + other.locked,
            borrowed: self.borrowed + other.borrowed,
            interest: self.interest + other.interest,
            net_asset: self.net_asset + other.net_asset,
            max_withdraw_amount: self.max_withdraw_amount,
        }
    }
}

impl fmt::Display for Balance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.currency, self.net())?;
        if self.locked > Decimal::ZERO { write!(f, " (locked {})", self.locked)?; }
        if self.borrowed > Decimal::ZERO { write!(f, " (borrowed: {})", self.borrowed)?; }
        if self.interest > Decimal::ZERO { write!(f, " (interest: {})", self.interest)?; }
        Ok(())
    }
}

/// currency -> Balance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BalanceMap(BTreeMap<String, Balance>);

impl BalanceMap {
    pub fn new() -> Self { Self::default() }

    pub fn insert(&mut self, balance: Balance) -> Option<Balance> {
        self.0.insert(balance.currency.clone(), balance)
    }

    pub fn get(&self, currency: &str) -> Option<&Balance> { self.0.get(currency) }

    pub fn get_mut(&mut self, currency: &str) -> Option<&mut Balance> { self.0.get_mut(currency) }

    pub fn iter(&self) -> impl Iterator<Item = &Balance> { self.0.values() }

    pub fn len(&self) -> usize { self.0.len() }

    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    pub fn currencies(&self) -> Vec<String> { self.0.keys().cloned().collect() }

    pub fn not_zero(&self) -> BalanceMap {
        self.iter()
            .filter(|b| !(b.total().is_zero() && b.debt().is_zero() && b.net().is_zero()))
            .cloned()
            .collect()
    }

    pub fn debts(&self) -> BalanceMap {
        self.iter()
            .filter(|b| b.borrowed > Decimal::ZERO || b.interest > Decimal::ZERO)
            .cloned()
            .collect()
    }
}

impl FromIterator<Balance> for BalanceMap {
    fn from_iter<I: IntoIterator<Item = Balance>>(iter: I) -> Self {
        let mut m = BalanceMap::new();
        for b in iter { m.insert(b); }
        m
    }
}

impl IntoIterator for BalanceMap {
    type Item = Balance;
    type IntoIter = std::collections::btree_map::IntoValues<String, Balance>;
    fn into_iter(self) -> Self::IntoIter { self.0.into_values() }
}

impl fmt::Display for BalanceMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.iter().map(|b| b.to_string()).collect();
        write!(f, "BalanceMap[{}]", parts.join(", "))
    }
}
