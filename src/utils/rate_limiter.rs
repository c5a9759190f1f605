use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::Error;

/// Token-bucket rate limiter shared per endpoint class.
///
/// The bucket holds up to `capacity` tokens and refills at `rate` tokens per
/// second. `acquire()` suspends the caller until a token is available;
/// `try_acquire()` fails immediately instead.
pub struct RateLimiter {
    capacity: f64,
    rate: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    refilled_at: Instant,
}

impl RateLimiter {
    pub fn new(capacity: u32, rate: f64) -> Self {
        Self {
            capacity: capacity as f64,
            rate,
            state: Mutex::new(BucketState {
                tokens: capacity as f64,
                refilled_at: Instant::now(),
            }),
        }
    }

    /// GraphQL endpoint class: 20 req/s sustained, burst of 40.
    pub fn for_gql() -> Self {
        Self::new(40, 20.0)
    }

    /// General HTTP endpoint class: 10 req/s sustained, burst of 20.
    pub fn for_http() -> Self {
        Self::new(20, 10.0)
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.duration_since(state.refilled_at).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.capacity);
        state.refilled_at = now;
    }

    /// Take one token, waiting for the refill if the bucket is empty.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                self.refill(&mut state, Instant::now());
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                // time until one whole token is available
                Duration::from_secs_f64((1.0 - state.tokens) / self.rate)
            };
            tokio::time::sleep(wait).await;
        }
    }

    /// Take one token without waiting.
    pub async fn try_acquire(&self) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        self.refill(&mut state, Instant::now());
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Ok(())
        } else {
            Err(Error::RateLimitExceeded)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_burst_up_to_capacity() {
        let limiter = RateLimiter::new(5, 1.0);
        for _ in 0..5 {
            limiter.try_acquire().await.expect("burst should fit capacity");
        }
        assert!(matches!(
            limiter.try_acquire().await,
            Err(Error::RateLimitExceeded)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_blocks_until_refill() {
        let limiter = RateLimiter::new(1, 10.0);
        limiter.acquire().await;
        let before = Instant::now();
        limiter.acquire().await;
        let waited = before.elapsed();
        // one token at 10/s refills in ~100ms
        assert!(waited >= Duration::from_millis(90));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokens_do_not_exceed_capacity() {
        let limiter = RateLimiter::new(2, 100.0);
        tokio::time::sleep(Duration::from_secs(10)).await;
        limiter.try_acquire().await.unwrap();
        limiter.try_acquire().await.unwrap();
        assert!(matches!(
            limiter.try_acquire().await,
            Err(Error::RateLimitExceeded)
        ));
    }

    #[test]
    fn test_endpoint_class_presets() {
        let gql = RateLimiter::for_gql();
        let http = RateLimiter::for_http();
        assert_eq!(gql.capacity as u32, 40);
        assert_eq!(http.capacity as u32, 20);
    }
}
