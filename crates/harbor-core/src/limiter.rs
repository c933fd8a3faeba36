//! Token-bucket rate limiting for transfer payload bytes.
//!
//! One limiter per session. Tokens refill continuously at the configured
//! byte rate and cap at one second of burst. Acquiring more tokens than
//! are available sleeps the caller for exactly the deficit; framing bytes
//! are not accounted, only chunk payloads.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Per-session token-bucket byte-rate limiter
pub struct RateLimiter {
    rate_bps: u64,
    bucket: Option<Mutex<Bucket>>,
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    /// Create a limiter capped at `rate_bps` bytes per second.
    ///
    /// A rate of 0 disables limiting entirely.
    #[must_use]
    pub fn new(rate_bps: u64) -> Self {
        let bucket = (rate_bps > 0).then(|| {
            Mutex::new(Bucket {
                tokens: rate_bps as f64,
                last_refill: Instant::now(),
            })
        });
        Self { rate_bps, bucket }
    }

    /// Configured rate in bytes per second (0 = unlimited)
    #[must_use]
    pub fn rate_bps(&self) -> u64 {
        self.rate_bps
    }

    /// Whether limiting is disabled
    #[must_use]
    pub fn is_unlimited(&self) -> bool {
        self.bucket.is_none()
    }

    /// Acquire tokens for `bytes` payload bytes, sleeping as needed.
    ///
    /// Returns the time spent waiting. The bucket is drained immediately;
    /// the sleep that follows covers exactly the deficit, so the refill
    /// during the sleep repays the debt.
    pub async fn acquire(&self, bytes: u64) -> Duration {
        let Some(bucket) = &self.bucket else {
            return Duration::ZERO;
        };

        let wait = {
            let mut b = bucket.lock().expect("limiter bucket poisoned");
            let now = Instant::now();
            let elapsed = now.duration_since(b.last_refill).as_secs_f64();
            b.tokens = (b.tokens + elapsed * self.rate_bps as f64).min(self.rate_bps as f64);
            b.last_refill = now;

            // The balance may go negative; the refill that accrues while
            // sleeping repays exactly that debt and no more.
            b.tokens -= bytes as f64;
            if b.tokens < 0.0 {
                Duration::from_secs_f64(-b.tokens / self.rate_bps as f64)
            } else {
                Duration::ZERO
            }
        };

        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }

        wait
    }
}
