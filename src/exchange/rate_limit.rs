//! Process-wide token-bucket request limiter.
//!
//! Every gateway request acquires one token before hitting the wire; callers
//! suspend until a token is available. Refill is continuous at a fixed rate.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

pub struct TokenBucket {
    state: Mutex<BucketState>,
    capacity: f64,
    refill_per_sec: f64,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            state: Mutex::new(BucketState {
                tokens: capacity as f64,
                last_refill: Instant::now(),
            }),
            capacity: capacity as f64,
            refill_per_sec,
        }
    }

    /// Take one token, sleeping until one is available.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
                state.last_refill = now;

                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - state.tokens) / self.refill_per_sec)
            };

            debug!(wait_ms = wait.as_millis() as u64, "rate limiter saturated, waiting");
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn burst_within_capacity_does_not_block() {
        let bucket = TokenBucket::new(5, 1.0);
        let start = Instant::now();
        for _ in 0..5 {
            bucket.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn exhausted_bucket_waits_for_refill() {
        let bucket = TokenBucket::new(1, 20.0);
        bucket.acquire().await;
        let start = Instant::now();
        bucket.acquire().await;
        // One token at 20/s refills in ~50ms.
        assert!(start.elapsed() >= Duration::from_millis(30));
    }
}
