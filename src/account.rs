// ===============================
// src/account.rs (Balance ledger: available vs locked per currency)
// ===============================
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::domain::{Balance, BalanceMap, Decimal};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BalanceError {
    #[error("insufficient available {currency}: available {available}, requested {requested}")]
    InsufficientAvailable { currency: String, available: Decimal, requested: Decimal },
    #[error("unlock {currency} exceeds locked: locked {locked}, requested {requested}")]
    ExceedsLocked { currency: String, locked: Decimal, requested: Decimal },
    #[error("insufficient locked {currency}: locked {locked}, requested {requested}")]
    InsufficientLocked { currency: String, locked: Decimal, requested: Decimal },
    #[error("negative amount {amount} for {currency}")]
    NegativeAmount { currency: String, amount: Decimal },
}

/// How a balance message from the venue is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BalanceUpdate {
    /// Full account snapshot (reconnect): replaces every entry.
    Snapshot(BalanceMap),
    /// Push update: replaces only the named currencies.
    Delta(BalanceMap),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeeRates {
    pub maker_fee_rate: Decimal,
    pub taker_fee_rate: Decimal,
}

#[derive(Debug, Default)]
struct AccountState {
    balances: BalanceMap,
    fee_rates: FeeRates,
}

/// Per-currency balance ledger with order reservation.
///
/// All operations take the same lock. Failed operations leave the
/// balances untouched.
#[derive(Debug, Default)]
pub struct Account {
    inner: Mutex<AccountState>,
}

fn non_negative(currency: &str, amount: Decimal) -> Result<(), BalanceError> {
    if amount < Decimal::ZERO {
        return Err(BalanceError::NegativeAmount { currency: currency.to_string(), amount });
    }
    Ok(())
}

impl Account {
    pub fn new() -> Self { Self::default() }

    pub fn with_fee_rates(fee_rates: FeeRates) -> Self {
        Self { inner: Mutex::new(AccountState { fee_rates, ..Default::default() }) }
    }

    pub fn fee_rates(&self) -> FeeRates { self.inner.lock().fee_rates.clone() }

    pub fn balances(&self) -> BalanceMap { self.inner.lock().balances.clone() }

    pub fn balance(&self, currency: &str) -> Option<Balance> {
        self.inner.lock().balances.get(currency).cloned()
    }

    /// Credits available funds, creating the entry if needed.
    pub fn add_balance(&self, currency: &str, amount: Decimal) -> Result<(), BalanceError> {
        non_negative(currency, amount)?;
        let mut st = self.inner.lock();
        match st.balances.get_mut(currency) {
            Some(b) => b.available += amount,
            None => {
                st.balances.insert(Balance::new(currency, amount));
            }
        }
        Ok(())
    }

    /// Moves `amount` from available to locked.
    pub fn lock_balance(&self, currency: &str, amount: Decimal) -> Result<(), BalanceError> {
        non_negative(currency, amount)?;
        let mut st = self.inner.lock();
        match st.balances.get_mut(currency) {
            Some(b) if b.available >= amount => {
                b.available -= amount;
                b.locked += amount;
                debug!(%currency, %amount, available = %b.available, locked = %b.locked, "balance locked");
                Ok(())
            }
            other => Err(BalanceError::InsufficientAvailable {
                currency: currency.to_string(),
                available: other.map(|b| b.available).unwrap_or_default(),
                requested: amount,
            }),
        }
    }

    /// Moves `amount` from locked back to available.
    pub fn unlock_balance(&self, currency: &str, amount: Decimal) -> Result<(), BalanceError> {
        non_negative(currency, amount)?;
        let mut st = self.inner.lock();
        match st.balances.get_mut(currency) {
            Some(b) if amount <= b.locked => {
                b.locked -= amount;
                b.available += amount;
                debug!(%currency, %amount, available = %b.available, locked = %b.locked, "balance unlocked");
                Ok(())
            }
            other => Err(BalanceError::ExceedsLocked {
                currency: currency.to_string(),
                locked: other.map(|b| b.locked).unwrap_or_default(),
                requested: amount,
            }),
        }
    }

    /// Consumes locked funds of a fully executed order.
    pub fn use_locked_balance(&self, currency: &str, amount: Decimal) -> Result<(), BalanceError> {
        non_negative(currency, amount)?;
        let mut st = self.inner.lock();
        match st.balances.get_mut(currency) {
            Some(b) if b.locked >= amount => {
                b.locked -= amount;
                Ok(())
            }
            other => Err(BalanceError::InsufficientLocked {
                currency: currency.to_string(),
                locked: other.map(|b| b.locked).unwrap_or_default(),
                requested: amount,
            }),
        }
    }

    pub fn apply(&self, update: BalanceUpdate) {
        match update {
            BalanceUpdate::Snapshot(m) => self.reset_balances(m),
            BalanceUpdate::Delta(m) => self.update_balances(m),
        }
    }

    /// Replaces the whole balance sheet.
    pub fn reset_balances(&self, balances: BalanceMap) {
        warn_negative(&balances);
        self.inner.lock().balances = balances;
    }

    /// Replaces the record of each currency in `balances`; others are kept.
    pub fn update_balances(&self, balances: BalanceMap) {
        warn_negative(&balances);
        let mut st = self.inner.lock();
        for b in balances {
            st.balances.insert(b);
        }
    }
}

fn warn_negative(balances: &BalanceMap) {
    for b in balances.iter() {
        if b.available < Decimal::ZERO || b.locked < Decimal::ZERO {
            warn!(currency = %b.currency, available = %b.available, locked = %b.locked, "venue reported negative balance");
        }
    }
}
