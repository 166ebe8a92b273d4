// ===============================
// src/registry.rs
// ===============================
//
// Registry strategi yang eksplisit: id -> factory, diisi lewat daftar
// inisialisasi di `with_defaults()` (tanpa self-registration).
//
// Strategi bawaan:
// - tradelog : log setiap live trade per symbol + posisi setelahnya
//
use std::collections::BTreeMap;
use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use crate::session::ExchangeSession;
use crate::stream::{SubscriptionId, UserEvent};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("strategy {0} is already registered")]
    Duplicate(&'static str),
    #[error("unknown strategy {0}")]
    Unknown(String),
    #[error("strategy {id} config: {source}")]
    Config { id: String, source: serde_json::Error },
}

pub trait Strategy: Send + Sync {
    fn id(&self) -> &'static str;

    /// Hooks the strategy onto a session's stream.
    fn attach(&self, session: &ExchangeSession) -> Vec<SubscriptionId>;
}

pub type StrategyFactory = fn(serde_json::Value) -> Result<Box<dyn Strategy>, serde_json::Error>;

#[derive(Default)]
pub struct StrategyRegistry {
    factories: BTreeMap<&'static str, StrategyFactory>,
}

impl StrategyRegistry {
    pub fn new() -> Self { Self::default() }

    pub fn with_defaults() -> Self {
        let mut r = Self::new();
        for (id, factory) in [(TradeLog::ID, TradeLog::build as StrategyFactory)] {
            // ids in this list are distinct
            let _ = r.register(id, factory);
        }
        r
    }

    pub fn register(&mut self, id: &'static str, factory: StrategyFactory) -> Result<(), RegistryError> {
        if self.factories.contains_key(id) {
            return Err(RegistryError::Duplicate(id));
        }
        self.factories.insert(id, factory);
        Ok(())
    }

    pub fn ids(&self) -> Vec<&'static str> { self.factories.keys().copied().collect() }

    pub fn build(&self, id: &str, config: serde_json::Value) -> Result<Box<dyn Strategy>, RegistryError> {
        let factory = self.factories.get(id).ok_or_else(|| RegistryError::Unknown(id.to_string()))?;
        factory(config).map_err(|source| RegistryError::Config { id: id.to_string(), source })
    }
}

/// Logs each live fill of the configured symbols together with the position after it.
#[derive(Debug, Deserialize)]
pub struct TradeLog {
    pub symbols: Vec<String>,
}

impl TradeLog {
    pub const ID: &'static str = "tradelog";

    fn build(config: serde_json::Value) -> Result<Box<dyn Strategy>, serde_json::Error> {
        Ok(Box::new(serde_json::from_value::<TradeLog>(config)?))
    }
}

impl Strategy for TradeLog {
    fn id(&self) -> &'static str { Self::ID }

    fn attach(&self, session: &ExchangeSession) -> Vec<SubscriptionId> {
        let mut ids = Vec::new();
        for symbol in &self.symbols {
            let Some(position) = session.position(symbol) else {
                info!(strategy = Self::ID, %symbol, "symbol not initialized, skip");
                continue;
            };
            let symbol = symbol.clone();
            ids.push(session.stream().subscribe(move |ev| {
                if let UserEvent::Trade(t) = ev {
                    if t.symbol == symbol {
                        info!(strategy = TradeLog::ID, trade_id = t.id, side = %t.side, price = %t.price, "{}", position);
                    }
                }
            }));
        }
        ids
    }
}
