// ===============================
// src/lib.rs
// ===============================
pub mod account;
pub mod binance;      // signer + REST client + user stream decoding
pub mod config;
pub mod domain;
pub mod feed;
pub mod metrics;
pub mod notifier;
pub mod pnl;
pub mod positions;
pub mod ratelimit;
pub mod registry;
pub mod session;
pub mod store;
pub mod stream;
pub mod sync;
pub mod venue;        // venue traits + mock venue
