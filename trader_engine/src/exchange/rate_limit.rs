/// exchange/rate_limit.rs — Minimum spacing between consecutive requests
///
/// A single-cell GCRA limiter (burst = 1): a call made less than
/// `min_interval` after the previous one waits out the remainder.
use std::num::NonZeroU32;
use std::time::Duration;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};

pub struct RequestSpacer {
    limiter: Option<DefaultDirectRateLimiter>,
    min_interval: Duration,
}

impl RequestSpacer {
    /// `Duration::ZERO` disables spacing.
    pub fn new(min_interval: Duration) -> Self {
        let limiter = Quota::with_period(min_interval)
            .map(|q| RateLimiter::direct(q.allow_burst(NonZeroU32::MIN)));
        Self { limiter, min_interval }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Suspend until the next request slot is available.
    pub async fn wait(&self) {
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn consecutive_calls_are_spaced() {
        let spacer = RequestSpacer::new(Duration::from_millis(50));
        let start = Instant::now();
        spacer.wait().await;
        spacer.wait().await;
        spacer.wait().await;
        // first slot is free, the next two each wait ~50ms
        assert!(start.elapsed() >= Duration::from_millis(90), "elapsed = {:?}", start.elapsed());
    }

    #[tokio::test]
    async fn zero_interval_never_waits() {
        let spacer = RequestSpacer::new(Duration::ZERO);
        let start = Instant::now();
        for _ in 0..100 {
            spacer.wait().await;
        }
        assert!(start.elapsed() < Duration::from_millis(50));
    }
}
