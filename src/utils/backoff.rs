use rand::Rng;
use std::time::Duration;

/// Exponential backoff with ±20% jitter.
///
/// Produces `min(base * 2^attempt, cap)` scaled by a uniform factor in
/// `[0.8, 1.2]`. Callers advance the attempt counter by pulling delays
/// and call `reset()` after a success.
#[derive(Debug)]
pub struct ExponentialBackoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

const JITTER_MIN: f64 = 0.8;
const JITTER_MAX: f64 = 1.2;

impl ExponentialBackoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap, attempt: 0 }
    }

    /// Default policy for HTTP retries: 1s base, 60s cap.
    pub fn for_requests() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Return the next delay and advance the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.peek();
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// The delay for the current attempt, without advancing.
    pub fn peek(&self) -> Duration {
        let exp = self.base.as_secs_f64() * 2f64.powi(self.attempt.min(32) as i32);
        let capped = exp.min(self.cap.as_secs_f64());
        let jitter = rand::thread_rng().gen_range(JITTER_MIN..=JITTER_MAX);
        Duration::from_secs_f64(capped * jitter)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_grow_exponentially() {
        let mut backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(60));
        let first = backoff.next_delay();
        let second = backoff.next_delay();
        let third = backoff.next_delay();
        // 1s, 2s, 4s nominal, each within ±20%
        assert!(first >= Duration::from_millis(800) && first <= Duration::from_millis(1200));
        assert!(second >= Duration::from_millis(1600) && second <= Duration::from_millis(2400));
        assert!(third >= Duration::from_millis(3200) && third <= Duration::from_millis(4800));
    }

    #[test]
    fn test_delay_is_capped() {
        let mut backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(5));
        for _ in 0..10 {
            backoff.next_delay();
        }
        // well past the cap: nominal value is 5s, jitter may push to 6s
        let delay = backoff.next_delay();
        assert!(delay <= Duration::from_secs(6));
    }

    #[test]
    fn test_reset_restarts_sequence() {
        let mut backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(60));
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.attempt(), 2);
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        let delay = backoff.next_delay();
        assert!(delay <= Duration::from_millis(1200));
    }

    #[test]
    fn test_bounded_total_delay_over_five_attempts() {
        // retry policy allows at most 5 attempts; the worst-case sum of
        // delays must stay under two minutes
        let mut backoff = ExponentialBackoff::for_requests();
        let total: Duration = (0..5).map(|_| backoff.next_delay()).sum();
        assert!(total <= Duration::from_secs(120));
    }
}
