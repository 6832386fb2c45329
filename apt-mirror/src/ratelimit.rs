// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Global download rate limiting.

A token bucket shared by every download worker. Tokens are bytes; the
bucket refills at the configured rate and holds at most one second of
burst. Callers debit the bucket for each chunk and sleep off any deficit,
which bounds sustained throughput across all concurrent transfers.
*/

use {
    std::time::Duration,
    tokio::{sync::Mutex, time::Instant},
};

#[derive(Debug)]
struct Bucket {
    /// Refill rate in bytes per second. Also the burst capacity.
    rate: f64,
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();

        self.tokens = (self.tokens + elapsed * self.rate).min(self.rate);
        self.last_refill = now;
    }
}

/// Byte-rate limiter shared across all active downloads.
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Option<Mutex<Bucket>>,
}

impl RateLimiter {
    /// Create a limiter. [None] disables limiting entirely.
    pub fn new(rate: Option<u64>) -> Self {
        Self {
            bucket: rate.map(|rate| {
                Mutex::new(Bucket {
                    rate: rate as f64,
                    tokens: rate as f64,
                    last_refill: Instant::now(),
                })
            }),
        }
    }

    /// Debit `bytes` from the bucket, sleeping until the rate allows it.
    pub async fn acquire(&self, bytes: u64) {
        let Some(bucket) = &self.bucket else {
            return;
        };

        let wait = {
            let mut bucket = bucket.lock().await;
            bucket.refill();
            bucket.tokens -= bytes as f64;

            if bucket.tokens < 0.0 {
                Duration::from_secs_f64(-bucket.tokens / bucket.rate)
            } else {
                Duration::ZERO
            }
        };

        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn unlimited_never_sleeps() {
        let limiter = RateLimiter::new(None);
        let start = Instant::now();

        for _ in 0..100 {
            limiter.acquire(1 << 30).await;
        }

        assert_eq!(Instant::now(), start);
    }

    #[tokio::test(start_paused = true)]
    async fn sustained_rate_is_bounded() {
        let limiter = RateLimiter::new(Some(1000));
        let start = Instant::now();

        // 3000 bytes at 1000 B/s: the first second is covered by the
        // initial burst, the rest must wait about two seconds.
        for _ in 0..30 {
            limiter.acquire(100).await;
        }

        let elapsed = Instant::now().duration_since(start);
        assert!(elapsed >= Duration::from_millis(1900), "elapsed {:?}", elapsed);
        assert!(elapsed <= Duration::from_millis(2100), "elapsed {:?}", elapsed);
    }
}
