//! Request throttle for the upstream feed.
//!
//! One limiter is shared (`Arc`) by every service that talks to the feed, so
//! the combined request rate stays under one request per `interval`.

use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovernorRateLimiter,
};
use std::num::NonZeroU32;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{CollectorError, Result};

type Limiter = GovernorRateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

pub struct RateLimiter {
    interval: Duration,
    limiter: Limiter,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("interval", &self.interval)
            .finish()
    }
}

impl RateLimiter {
    /// One request per `interval`, burst of one. The first request is free.
    pub fn new(interval: Duration) -> Self {
        let interval = interval.max(Duration::from_millis(1));
        let quota = Quota::with_period(interval)
            .unwrap_or_else(|| Quota::per_second(NonZeroU32::MIN));
        Self {
            interval,
            limiter: GovernorRateLimiter::direct(quota),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Take a permit if one is available right now
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }

    /// Wait for a permit.
    ///
    /// Returns [`CollectorError::Cancelled`] without consuming a permit when
    /// `cancel` fires first (or already has). A pending wait holds no permit.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(CollectorError::Cancelled);
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CollectorError::Cancelled),
            _ = self.limiter.until_ready() => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[tokio::test]
    async fn test_wait_consumes_one_permit() {
        let limiter = RateLimiter::new(Duration::from_secs(60));
        let cancel = CancellationToken::new();

        limiter.wait(&cancel).await.unwrap();
        assert!(!limiter.try_acquire());
    }

    #[tokio::test]
    async fn test_wait_with_cancelled_token_keeps_permit() {
        let limiter = RateLimiter::new(Duration::from_secs(60));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = limiter.wait(&cancel).await.unwrap_err();

        assert!(err.is_cancelled());
        assert!(limiter.try_acquire());
    }

    #[tokio::test]
    async fn test_wait_spaces_requests_by_interval() {
        let limiter = RateLimiter::new(Duration::from_millis(20));
        let cancel = CancellationToken::new();
        let start = Instant::now();

        for _ in 0..4 {
            limiter.wait(&cancel).await.unwrap();
        }

        // First is immediate, the next three each wait one interval
        assert!(start.elapsed() >= Duration::from_millis(55));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_cancel_during_wait_returns_promptly() {
        let limiter = Arc::new(RateLimiter::new(Duration::from_secs(60)));
        let cancel = CancellationToken::new();
        assert!(limiter.try_acquire());

        let waiter = {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { limiter.wait(&cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        let start = Instant::now();
        cancel.cancel();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(CollectorError::Cancelled)));
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(!limiter.try_acquire());
    }

    #[tokio::test]
    async fn test_wait_pends_until_refill() {
        let limiter = RateLimiter::new(Duration::from_millis(50));
        let cancel = CancellationToken::new();
        assert!(limiter.try_acquire());

        let mut wait = tokio_test::task::spawn(limiter.wait(&cancel));
        tokio_test::assert_pending!(wait.poll());

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(wait.is_woken());
        tokio_test::assert_ready_ok!(wait.poll());
    }
}
