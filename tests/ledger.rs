// ===============================
// tests/ledger.rs
// ===============================
use std::sync::Arc;

use chrono::Utc;
use proptest::prelude::*;
use rust_decimal_macros::dec;

use trade_ledger::account::{Account, BalanceError};
use trade_ledger::domain::{Balance, BalanceMap, Decimal, ExchangeName, Side, Trade};
use trade_ledger::positions::{Position, Profit};

fn trade(id: i64, side: Side, qty: Decimal, price: Decimal) -> Trade {
    Trade {
        gid: 0,
        id,
        order_id: id as u64,
        exchange: ExchangeName::new("binance"),
        symbol: "BTCUSDT".into(),
        price,
        quantity: qty,
        quote_quantity: qty * price,
        side,
        is_buyer: side == Side::Buy,
        is_maker: false,
        fee: Decimal::ZERO,
        fee_currency: "BNB".into(),
        time: Utc::now(),
        is_margin: false,
        is_isolated: false,
        strategy_id: None,
        pnl: None,
    }
}

fn btc() -> Position { Position::new("BTCUSDT", "BTC", "USDT") }

// ---- Position ledger ----

#[test]
fn flip_from_long_to_short() {
    let p = btc();
    p.add_trade(&trade(1, Side::Buy, dec!(10), dec!(100)));
    let got = p.add_trade(&trade(2, Side::Sell, dec!(15), dec!(110)));
    assert_eq!(got, Some(Profit { profit: dec!(100), net_profit: dec!(100) }));
    assert_eq!(p.base(), dec!(-5));
    assert_eq!(p.average_cost(), dec!(110));
}

#[test]
fn close_without_flip() {
    let p = btc();
    p.add_trade(&trade(1, Side::Buy, dec!(10), dec!(100)));
    let got = p.add_trade(&trade(2, Side::Sell, dec!(4), dec!(120))).unwrap();
    assert_eq!(got.profit, dec!(80));
    assert_eq!(p.base(), dec!(6));
    assert_eq!(p.average_cost(), dec!(100));
}

#[test]
fn pure_accumulation() {
    let p = btc();
    assert_eq!(p.add_trade(&trade(1, Side::Buy, dec!(5), dec!(100))), None);
    assert_eq!(p.add_trade(&trade(2, Side::Buy, dec!(5), dec!(200))), None);
    assert_eq!(p.average_cost(), dec!(150));
    assert_eq!(p.base(), dec!(10));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_fills_match_sequential_fold() {
    let fills: Vec<Trade> = (1..=64)
        .map(|id| trade(id, Side::Buy, Decimal::from(id % 5 + 1), dec!(100) + Decimal::from(id % 7)))
        .collect();

    let shared = Arc::new(btc());
    let mut tasks = Vec::new();
    for chunk in fills.chunks(8) {
        let p = Arc::clone(&shared);
        let chunk = chunk.to_vec();
        tasks.push(tokio::spawn(async move {
            for t in &chunk {
                assert_eq!(p.add_trade(t), None);
                tokio::task::yield_now().await;
            }
        }));
    }
    for t in tasks {
        t.await.unwrap();
    }

    let sequential = btc();
    sequential.add_trades(&fills);

    assert_eq!(shared.base(), sequential.base());
    assert_eq!(shared.quote(), sequential.quote());
    let diff = (shared.average_cost() - sequential.average_cost()).abs();
    assert!(diff < dec!(0.000000000001), "average cost drifted by {diff}");
}

proptest! {
    #[test]
    fn same_direction_average_is_weighted_mean(
        fills in prop::collection::vec((1u32..1_000, 1u32..100_000), 1..40),
        seed in any::<u64>(),
    ) {
        let trades: Vec<Trade> = fills
            .iter()
            .enumerate()
            .map(|(i, (qty, price))| trade(i as i64 + 1, Side::Buy, Decimal::new(*qty as i64, 2), Decimal::new(*price as i64, 2)))
            .collect();

        let total_qty: Decimal = trades.iter().map(|t| t.quantity).sum();
        let total_cost: Decimal = trades.iter().map(|t| t.quantity * t.price).sum();
        let mean = total_cost / total_qty;

        // rotate + reverse: a different ordering of the same fills
        let mut shuffled = trades.clone();
        shuffled.rotate_left((seed as usize) % trades.len());
        if seed % 2 == 0 {
            shuffled.reverse();
        }

        let a = btc();
        a.add_trades(&trades);
        let b = btc();
        b.add_trades(&shuffled);

        let tolerance = dec!(0.0000000001);
        prop_assert!((a.average_cost() - mean).abs() < tolerance);
        prop_assert!((b.average_cost() - mean).abs() < tolerance);
        prop_assert_eq!(a.base(), total_qty);
        prop_assert_eq!(b.base(), total_qty);
    }
}

// ---- Balance ledger ----

fn account(usdt: Decimal) -> Account {
    let acc = Account::new();
    let balances: BalanceMap = vec![Balance::new("USDT", usdt)].into_iter().collect();
    acc.reset_balances(balances);
    acc
}

#[test]
fn reservation_rejects_overdraw_without_mutation() {
    let acc = account(dec!(100));
    acc.lock_balance("USDT", dec!(50)).unwrap();
    let b = acc.balance("USDT").unwrap();
    assert_eq!((b.available, b.locked), (dec!(50), dec!(50)));

    let err = acc.lock_balance("USDT", dec!(60)).unwrap_err();
    assert_eq!(
        err,
        BalanceError::InsufficientAvailable { currency: "USDT".into(), available: dec!(50), requested: dec!(60) }
    );
    let b = acc.balance("USDT").unwrap();
    assert_eq!((b.available, b.locked), (dec!(50), dec!(50)));
}

#[test]
fn order_lifecycle_keeps_total_until_fill() {
    let acc = account(dec!(100));
    acc.lock_balance("USDT", dec!(40)).unwrap();
    acc.unlock_balance("USDT", dec!(10)).unwrap();
    assert_eq!(acc.balance("USDT").unwrap().total(), dec!(100));

    acc.use_locked_balance("USDT", dec!(30)).unwrap();
    let b = acc.balance("USDT").unwrap();
    assert_eq!((b.available, b.locked), (dec!(70), dec!(0)));

    assert!(matches!(acc.unlock_balance("USDT", dec!(1)), Err(BalanceError::ExceedsLocked { .. })));
    assert!(matches!(acc.use_locked_balance("USDT", dec!(1)), Err(BalanceError::InsufficientLocked { .. })));
    assert!(matches!(acc.lock_balance("BTC", dec!(1)), Err(BalanceError::InsufficientAvailable { .. })));
}
