// ===============================
// src/ratelimit.rs
// ===============================
//
// Token bucket untuk membatasi request ke venue.
// - `burst` token di awal, satu token baru setiap `every`.
// - wait() menunggu token tersedia, atau berhenti kalau token cancel dipicu.
//
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RateLimitError {
    #[error("rate limiter wait cancelled")]
    Cancelled,
}

#[derive(Debug)]
struct Bucket {
    tokens: u32,
    last_refill: Instant,
}

#[derive(Debug)]
pub struct RateLimiter {
    every: Duration,
    burst: u32,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(every: Duration, burst: u32) -> Self {
        let burst = burst.max(1);
        Self {
            every,
            burst,
            bucket: Mutex::new(Bucket { tokens: burst, last_refill: Instant::now() }),
        }
    }

    /// Binance allows 1200 weight/min; trade history pulls stay far below it.
    pub fn for_trade_history() -> Self {
        Self::new(Duration::from_secs(5), 2)
    }

    /// Takes a token if one is available, else returns the instant the next one appears.
    fn try_acquire(&self) -> Result<(), Instant> {
        let mut b = self.bucket.lock();
        let now = Instant::now();
        if b.tokens < self.burst && !self.every.is_zero() {
            let elapsed = now.saturating_duration_since(b.last_refill);
            let earned = (elapsed.as_nanos() / self.every.as_nanos()).min(u32::MAX as u128) as u32;
            if earned > 0 {
                b.tokens = b.tokens.saturating_add(earned).min(self.burst);
                b.last_refill = if b.tokens == self.burst { now } else { b.last_refill + self.every * earned };
            }
        } else if self.every.is_zero() {
            b.tokens = self.burst;
        }

        if b.tokens > 0 {
            if b.tokens == self.burst {
                // refill clock starts when the bucket stops being full
                b.last_refill = now;
            }
            b.tokens -= 1;
            Ok(())
        } else {
            Err(b.last_refill + self.every)
        }
    }

    pub async fn wait(&self, cancel: &CancellationToken) -> Result<(), RateLimitError> {
        loop {
            if cancel.is_cancelled() {
                return Err(RateLimitError::Cancelled);
            }
            match self.try_acquire() {
                Ok(()) => return Ok(()),
                Err(at) => {
                    tokio::select! {
                        _ = sleep_until(at) => {}
                        _ = cancel.cancelled() => return Err(RateLimitError::Cancelled),
                    }
                }
            }
        }
    }
}
