// ===============================
// src/pnl.rs (average-cost PnL report)
// ===============================
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::domain::{Decimal, ExchangeName, Market, Side, Trade};
use crate::positions::{ExchangeFee, Position, Profit};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AverageCostPnlReport {
    pub symbol: String,
    pub current_price: Decimal,
    pub start_time: Option<DateTime<Utc>>,
    pub num_trades: usize,
    pub profit: Decimal,
    pub net_profit: Decimal,
    pub unrealized_profit: Decimal,
    pub average_cost: Decimal,
    pub buy_volume: Decimal,
    pub sell_volume: Decimal,
    /// Signed base amount still held.
    pub stock: Decimal,
    pub currency_fees: BTreeMap<String, Decimal>,
}

impl AverageCostPnlReport {
    pub fn print(&self) {
        match self.start_time {
            Some(t) => info!("TRADES SINCE: {}", t),
            None => info!("TRADES SINCE: -"),
        }
        info!("NUMBER OF TRADES: {}", self.num_trades);
        info!("AVERAGE COST: {}", self.average_cost.round_dp(2));
        info!("TOTAL BUY VOLUME: {}", self.buy_volume);
        info!("TOTAL SELL VOLUME: {}", self.sell_volume);
        info!("STOCK: {}", self.stock);
        info!("CURRENT PRICE: {}", self.current_price);
        info!("CURRENCY FEES:");
        for (currency, fee) in &self.currency_fees {
            info!(" - {}: {}", currency, fee);
        }
        info!("PROFIT: {}", self.profit.round_dp(2));
        info!("NET PROFIT: {}", self.net_profit.round_dp(2));
        info!("UNREALIZED PROFIT: {}", self.unrealized_profit.round_dp(2));
    }
}

/// Folds a trade history through a fresh position ledger.
pub struct AverageCostCalculator {
    market: Market,
    fee_rates: Vec<(ExchangeName, ExchangeFee)>,
}

impl AverageCostCalculator {
    pub fn new(market: Market) -> Self {
        Self { market, fee_rates: Vec::new() }
    }

    pub fn with_fee_rate(mut self, exchange: ExchangeName, fee: ExchangeFee) -> Self {
        self.fee_rates.push((exchange, fee));
        self
    }

    /// `trades` must be chronological; rows of other symbols are ignored.
    pub fn calculate(&self, trades: &[Trade], current_price: Decimal) -> AverageCostPnlReport {
        let position = Position::from_market(&self.market);
        for (exchange, fee) in &self.fee_rates {
            position.set_exchange_fee_rate(exchange.clone(), *fee);
        }

        let mut report = AverageCostPnlReport {
            symbol: self.market.symbol.clone(),
            current_price,
            ..Default::default()
        };
        let mut realized = Profit::default();

        for t in trades.iter().filter(|t| t.symbol == self.market.symbol) {
            report.start_time.get_or_insert(t.time);
            report.num_trades += 1;
            match t.side {
                Side::Buy => report.buy_volume += t.quantity,
                Side::Sell => report.sell_volume += t.quantity,
            }
            if !t.fee.is_zero() {
                *report.currency_fees.entry(t.fee_currency.clone()).or_default() += t.fee;
            }
            if let Some(p) = position.add_trade(t) {
                realized += p;
            }
        }

        report.profit = realized.profit;
        report.net_profit = realized.net_profit;
        report.stock = position.base();
        report.average_cost = position.average_cost();
        report.unrealized_profit = position.unrealized_profit(current_price);
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::positions::tests::trade;
    use rust_decimal_macros::dec;

    #[test]
    fn report_over_mixed_history() {
        let mut fee_buy = trade(Side::Buy, dec!(10), dec!(100));
        fee_buy.fee = dec!(0.01);
        fee_buy.fee_currency = "BNB".into();
        let mut eth = trade(Side::Buy, dec!(1), dec!(1));
        eth.symbol = "ETHUSDT".into();
        let trades = vec![fee_buy, eth, trade(Side::Sell, dec!(4), dec!(120))];

        let report = AverageCostCalculator::new(Market::new("BTCUSDT", "BTC", "USDT"))
            .calculate(&trades, dec!(130));

        assert_eq!(report.num_trades, 2);
        assert_eq!(report.buy_volume, dec!(10));
        assert_eq!(report.sell_volume, dec!(4));
        assert_eq!(report.stock, dec!(6));
        assert_eq!(report.profit, dec!(80));
        assert_eq!(report.average_cost, dec!(100));
        assert_eq!(report.unrealized_profit, dec!(180));
        assert_eq!(report.currency_fees.get("BNB"), Some(&dec!(0.01)));
        assert!(report.start_time.is_some());
        report.print();
    }

    #[test]
    fn empty_history() {
        let report = AverageCostCalculator::new(Market::new("BTCUSDT", "BTC", "USDT")).calculate(&[], dec!(1));
        assert_eq!(report.num_trades, 0);
        assert!(report.start_time.is_none());
        assert_eq!(report.unrealized_profit, Decimal::ZERO);
    }
}
