// ===============================
// src/feed.rs
// ===============================
//
// Live trade feed adapters:
// - run_dispatcher     : mpsc -> UserDataStream (publish ke semua subscriber)
// - run_binance_stream : Binance user data stream (executionReport / outboundAccountPosition)
//                        reconnect dengan exponential backoff + jitter
// - run_mock           : random-walk fill generator untuk VENUE_MODE=mock
//
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt; // for .next()
use rand::Rng;
use rust_decimal::Decimal;
use tokio::{sync::mpsc, time::sleep};
use tokio_tungstenite::connect_async;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::binance::{parse_user_event, BinanceClient};
use crate::domain::{ExchangeName, Side, Trade};
use crate::metrics::{LISTEN_KEEPALIVE, WS_CONNECTED, WS_LAST_EVENT_TS, WS_RECONNECTS};
use crate::stream::{UserDataStream, UserEvent};
use crate::venue::{Exchange, MockExchange};

const KEEPALIVE_EVERY: Duration = Duration::from_secs(30 * 60);

/// Exponential backoff + jitter: 0.5s, 1s, 2s ... capped at 32s.
fn backoff(attempt: u32) -> Duration {
    let shift = attempt.min(6); // 0..=6
    let base_ms = 500u64.saturating_mul(1u64 << shift);
    let jitter = rand::thread_rng().gen_range(0..=250);
    Duration::from_millis(base_ms + jitter)
}

/// Single delivery context: events are published in arrival order.
pub async fn run_dispatcher(mut rx: mpsc::Receiver<UserEvent>, stream: Arc<UserDataStream>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            ev = rx.recv() => match ev {
                Some(ev) => stream.publish(&ev),
                None => break,
            },
        }
    }
    info!("user event dispatcher stopped");
}

/// Binance user data stream -> `tx`.
///
/// `ws_base` from config:
///   * Sandbox: wss://testnet.binance.vision/ws
///   * Mainnet: wss://stream.binance.com:9443/ws
pub async fn run_binance_stream(
    client: Arc<BinanceClient>,
    ws_base: String,
    tx: mpsc::Sender<UserEvent>,
    cancel: CancellationToken,
) {
    let venue = client.name().to_string();
    let margin = client.margin_settings();
    let mut attempt: u32 = 0;

    while !cancel.is_cancelled() {
        // listenKey baru setiap reconnect (yang lama bisa sudah expired)
        let listen_key = match client.create_listen_key().await {
            Ok(k) => k,
            Err(e) => {
                error!(?e, "create listenKey failed");
                attempt = attempt.saturating_add(1);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(backoff(attempt)) => continue,
                }
            }
        };

        let ws_url = format!("{}/{}", ws_base.trim_end_matches('/'), listen_key);
        let url = match Url::parse(&ws_url) {
            Ok(u) => u,
            Err(e) => {
                error!(?e, "bad userDataStream url");
                return;
            }
        };

        info!(%ws_base, "connecting userDataStream");
        match connect_async(url).await {
            Ok((mut ws, _resp)) => {
                info!("userDataStream connected");
                WS_CONNECTED.with_label_values(&[&venue]).set(1);
                attempt = 0; // reset backoff

                let keepalive_client = Arc::clone(&client);
                let keepalive_key = listen_key.clone();
                let keepalive_venue = venue.clone();
                let keepalive = tokio::spawn(async move {
                    loop {
                        sleep(KEEPALIVE_EVERY).await;
                        match keepalive_client.keepalive_listen_key(&keepalive_key).await {
                            Ok(()) => LISTEN_KEEPALIVE.with_label_values(&[&keepalive_venue, "ok"]).inc(),
                            Err(e) => {
                                warn!(?e, "listenKey keepalive failed");
                                LISTEN_KEEPALIVE.with_label_values(&[&keepalive_venue, "err"]).inc();
                            }
                        }
                    }
                });

                loop {
                    let frame = tokio::select! {
                        _ = cancel.cancelled() => break,
                        f = ws.next() => f,
                    };
                    let Some(frame) = frame else { break };
                    match frame {
                        Ok(m) if m.is_text() => {
                            let txt = match m.into_text() {
                                Ok(t) => t,
                                Err(e) => {
                                    warn!(?e, "failed to read text frame");
                                    continue;
                                }
                            };
                            WS_LAST_EVENT_TS.with_label_values(&[&venue]).set(Utc::now().timestamp());
                            match parse_user_event(&txt, &margin) {
                                Ok(Some(ev)) => {
                                    if tx.send(ev).await.is_err() {
                                        warn!("user event channel closed");
                                        keepalive.abort();
                                        return;
                                    }
                                }
                                Ok(None) => {}
                                Err(e) => debug!(?e, "skip undecodable user event"),
                            }
                        }
                        Ok(_) => {
                            // ignore non-text frames
                        }
                        Err(e) => {
                            error!(?e, "userDataStream ws error");
                            break;
                        }
                    }
                }

                keepalive.abort();
                WS_CONNECTED.with_label_values(&[&venue]).set(0);
                if cancel.is_cancelled() {
                    break;
                }
                warn!("userDataStream disconnected, will reconnect");
                WS_RECONNECTS.with_label_values(&[&venue]).inc();
            }
            Err(e) => {
                error!(?e, "connect userDataStream failed");
            }
        }

        attempt = attempt.saturating_add(1);
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(backoff(attempt)) => {}
        }
    }
    info!("userDataStream stopped");
}

/// Mock fills: random walk around `start_price`, alternating small buys and sells.
///
/// Each fill is appended to the mock venue history (so a later sync persists it)
/// and pushed to `tx` as a live trade.
pub async fn run_mock(
    venue: Arc<MockExchange>,
    symbol: String,
    start_price: Decimal,
    every: Duration,
    tx: mpsc::Sender<UserEvent>,
    cancel: CancellationToken,
) {
    let exchange = ExchangeName::new(venue.name());
    let mut price = start_price;
    let mut id: i64 = 1_000_000;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(every) => {}
        }

        // jangan simpan ThreadRng melewati .await
        let (step, buy, qty_milli) = {
            let mut rng = rand::thread_rng();
            (rng.gen_range(-50i64..=50), rng.gen_bool(0.5), rng.gen_range(1i64..=100))
        };
        price = (price + Decimal::new(step, 2)).max(Decimal::ONE);
        let quantity = Decimal::new(qty_milli, 3);
        id += 1;

        let side = if buy { Side::Buy } else { Side::Sell };
        let trade = Trade {
            gid: 0,
            id,
            order_id: id as u64,
            exchange: exchange.clone(),
            symbol: symbol.clone(),
            price,
            quantity,
            quote_quantity: price * quantity,
            side,
            is_buyer: buy,
            is_maker: false,
            fee: Decimal::ZERO,
            fee_currency: "BNB".to_string(),
            time: Utc::now(),
            is_margin: false,
            is_isolated: false,
            strategy_id: None,
            pnl: None,
        };
        venue.push_trade(trade.clone());
        if tx.send(UserEvent::Trade(trade)).await.is_err() {
            break;
        }
    }
}
