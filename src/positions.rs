// ===============================
// src/positions.rs (Position ledger: average cost & realized PnL)
// ===============================
//
// Base > 0 -> long, Base < 0 -> short, Base == 0 -> flat.
// Average cost is only meaningful while Base != 0.
//
use std::collections::BTreeMap;
use std::fmt;
use std::ops::AddAssign;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::domain::{Decimal, ExchangeName, Market, Side, Trade};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeFee {
    pub maker_fee_rate: Decimal,
    pub taker_fee_rate: Decimal,
}

/// Profit realized by a trade that closed (part of) the open exposure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Profit {
    pub profit: Decimal,
    /// Profit after fees paid in a third currency.
    pub net_profit: Decimal,
}

impl AddAssign for Profit {
    fn add_assign(&mut self, rhs: Profit) {
        self.profit += rhs.profit;
        self.net_profit += rhs.net_profit;
    }
}

/// Plain position record. Mutated only through [`Position`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionState {
    pub symbol: String,
    pub base_currency: String,
    pub quote_currency: String,
    pub base: Decimal,
    pub quote: Decimal,
    pub average_cost: Decimal,
    /// Average cost with fees paid in a third currency folded in (net profit only).
    pub approximate_average_cost: Decimal,
    pub exchange_fee_rates: BTreeMap<ExchangeName, ExchangeFee>,
}

impl PositionState {
    /// Effective (quantity, quote quantity, fee in quote) after the fee adjustment.
    fn effective_fill(&self, t: &Trade) -> (Decimal, Decimal, Decimal) {
        let mut quantity = t.quantity;
        let mut quote_quantity = t.quote_quantity;
        let mut fee_in_quote = Decimal::ZERO;

        if t.fee_currency == self.base_currency {
            quantity -= t.fee;
        } else if t.fee_currency == self.quote_currency {
            quote_quantity -= t.fee;
        } else if let Some(rate) = self.exchange_fee_rates.get(&t.exchange) {
            // fee dibayar pakai mata uang ketiga (mis. BNB) -> konversi via fee rate
            let r = if t.is_maker { rate.maker_fee_rate } else { rate.taker_fee_rate };
            fee_in_quote += r * quote_quantity;
        }

        (quantity, quote_quantity, fee_in_quote)
    }

    fn apply(&mut self, t: &Trade) -> Option<Profit> {
        let price = t.price;
        let (quantity, quote_quantity, fee_in_quote) = self.effective_fill(t);

        match t.side {
            Side::Buy if self.base < Decimal::ZERO => {
                // covering short; flips to long when the buy is larger than the short
                let closed = if self.base + quantity > Decimal::ZERO { -self.base } else { quantity };
                let profit = Profit {
                    profit: (self.average_cost - price) * closed,
                    net_profit: (self.approximate_average_cost - price) * closed - fee_in_quote,
                };
                let flipped = self.base + quantity > Decimal::ZERO;
                self.base += quantity;
                self.quote -= quote_quantity;
                if flipped {
                    self.average_cost = price;
                    self.approximate_average_cost = price;
                }
                Some(profit)
            }
            Side::Buy => {
                let held = self.base;
                let size = held + quantity;
                self.approximate_average_cost = weighted(
                    self.approximate_average_cost,
                    held,
                    quote_quantity + fee_in_quote,
                    size,
                );
                self.average_cost = weighted(self.average_cost, held, quote_quantity, size);
                self.base += quantity;
                self.quote -= quote_quantity;
                None
            }
            Side::Sell if self.base > Decimal::ZERO => {
                // closing long; flips to short when the sell is larger than the long
                let closed = if self.base - quantity < Decimal::ZERO { self.base } else { quantity };
                let profit = Profit {
                    profit: (price - self.average_cost) * closed,
                    net_profit: (price - self.approximate_average_cost) * closed - fee_in_quote,
                };
                let flipped = self.base - quantity < Decimal::ZERO;
                self.base -= quantity;
                self.quote += quote_quantity;
                if flipped {
                    self.average_cost = price;
                    self.approximate_average_cost = price;
                }
                Some(profit)
            }
            Side::Sell => {
                // building short: base is <= 0, so -base is the held size
                let held = -self.base;
                let size = held + quantity;
                self.approximate_average_cost = weighted(
                    self.approximate_average_cost,
                    held,
                    quote_quantity - fee_in_quote,
                    size,
                );
                self.average_cost = weighted(self.average_cost, held, quote_quantity, size);
                self.base -= quantity;
                self.quote += quote_quantity;
                None
            }
        }
    }

    /// Mark-to-market profit of the open exposure at `price`.
    pub fn unrealized_profit(&self, price: Decimal) -> Decimal {
        if self.base.is_zero() {
            return Decimal::ZERO;
        }
        (price - self.average_cost) * self.base
    }
}

/// (cost * held + amount) / size, keeping the previous cost when size is zero.
fn weighted(cost: Decimal, held: Decimal, amount: Decimal, size: Decimal) -> Decimal {
    (cost * held + amount).checked_div(size).unwrap_or(cost)
}

/// Position ledger of one symbol.
///
/// Every read and write goes through the inner lock, so the pull pipeline and
/// the live feed can both feed trades into the same instance.
#[derive(Debug, Default)]
pub struct Position {
    inner: Mutex<PositionState>,
}

impl Position {
    pub fn new(symbol: impl Into<String>, base: impl Into<String>, quote: impl Into<String>) -> Self {
        Self {
            inner: Mutex::new(PositionState {
                symbol: symbol.into(),
                base_currency: base.into(),
                quote_currency: quote.into(),
                ..Default::default()
            }),
        }
    }

    pub fn from_market(market: &Market) -> Self {
        Self::new(&market.symbol, &market.base_currency, &market.quote_currency)
    }

    pub fn symbol(&self) -> String { self.inner.lock().symbol.clone() }

    pub fn base(&self) -> Decimal { self.inner.lock().base }

    pub fn quote(&self) -> Decimal { self.inner.lock().quote }

    pub fn average_cost(&self) -> Decimal { self.inner.lock().average_cost }

    pub fn approximate_average_cost(&self) -> Decimal { self.inner.lock().approximate_average_cost }

    pub fn snapshot(&self) -> PositionState { self.inner.lock().clone() }

    pub fn unrealized_profit(&self, price: Decimal) -> Decimal {
        self.inner.lock().unrealized_profit(price)
    }

    pub fn set_exchange_fee_rate(&self, exchange: ExchangeName, fee: ExchangeFee) {
        self.inner.lock().exchange_fee_rates.insert(exchange, fee);
    }

    /// Back to flat; fee rates are kept.
    pub fn reset(&self) {
        let mut p = self.inner.lock();
        p.base = Decimal::ZERO;
        p.quote = Decimal::ZERO;
        p.average_cost = Decimal::ZERO;
        p.approximate_average_cost = Decimal::ZERO;
    }

    /// Folds one trade into the position.
    ///
    /// Returns `Some` when the trade closed some of the open exposure. A trade
    /// that only grows the position returns `None`. Quantity and price must be
    /// positive; this is not checked.
    pub fn add_trade(&self, trade: &Trade) -> Option<Profit> {
        self.inner.lock().apply(trade)
    }

    /// Folds trades in the given order, which must be chronological.
    pub fn add_trades(&self, trades: &[Trade]) -> Option<Profit> {
        let mut p = self.inner.lock();
        let mut total: Option<Profit> = None;
        for t in trades {
            if let Some(profit) = p.apply(t) {
                *total.get_or_insert_with(Profit::default) += profit;
            }
        }
        total
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let p = self.inner.lock();
        write!(
            f,
            "POSITION {}: average cost = {}, base = {}, quote = {}",
            p.symbol, p.average_cost, p.base, p.quote
        )
    }
}
