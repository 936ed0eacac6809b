use std::sync::Arc;
use std::time::Duration;

use log::info;
use size::{KiB, Size};
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep};

use crate::config::Rate;

/// Burst capacity of every limiter: absorbs short spikes without allowing a
/// sustained overshoot of the configured rate.
pub const BURST: Size = Size::from_const(512 * KiB);

/// Token bucket limiter. Tokens are bytes; the bucket refills continuously at
/// `rate` bytes per second and holds at most `burst` bytes.
#[derive(Debug)]
pub struct RateLimiter {
    rate: f64,
    burst: u64,
    bucket: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self, rate: f64, burst: u64) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(burst as f64);
        self.last_refill = now;
    }
}

impl RateLimiter {
    /// Creates a limiter that starts with a full bucket.
    pub fn new(bytes_per_second: f64, burst: u64) -> Self {
        Self {
            rate: bytes_per_second,
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn from_rate(rate: Rate) -> Self {
        Self::new(rate.bytes_per_second(), BURST.bytes() as u64)
    }

    /// Sustained rate in bytes per second
    #[cfg(test)]
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Bucket capacity in bytes
    #[cfg(test)]
    pub fn burst(&self) -> u64 {
        self.burst
    }

    /// Waits until `bytes` tokens are available and consumes them. Requests
    /// larger than the burst are served in burst-sized slices.
    pub async fn acquire(&self, bytes: u64) {
        let mut remaining = bytes;
        while remaining > 0 {
            let slice = remaining.min(self.burst);
            self.take(slice).await;
            remaining -= slice;
        }
    }

    async fn take(&self, bytes: u64) {
        // The lock is held while sleeping so waiters are served in order.
        let mut bucket = self.bucket.lock().await;
        bucket.refill(self.rate, self.burst);
        let needed = bytes as f64;
        if bucket.tokens < needed {
            let deficit = needed - bucket.tokens;
            let wait = Duration::try_from_secs_f64(deficit / self.rate).unwrap_or(Duration::MAX);
            sleep(wait).await;
            bucket.refill(self.rate, self.burst);
        }
        bucket.tokens = (bucket.tokens - needed).max(0.0);
    }
}

/// Limiters for both directions; a direction without a cap has no limiter.
#[derive(Debug, Clone, Default)]
pub struct RateLimits {
    pub download: Option<Arc<RateLimiter>>,
    pub upload: Option<Arc<RateLimiter>>,
}

impl RateLimits {
    pub fn new(download: Option<Rate>, upload: Option<Rate>) -> Self {
        let download = download.map(|rate| {
            info!("Download rate limited to {}", rate);
            Arc::new(RateLimiter::from_rate(rate))
        });
        let upload = upload.map(|rate| {
            info!("Upload rate limited to {}", rate);
            Arc::new(RateLimiter::from_rate(rate))
        });
        Self { download, upload }
    }
}
