//! Live snapshot poller.
//!
//! Fetches the all-items latest-price snapshot once immediately and then on a
//! fixed interval, writing one observation per item per poll.

use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::convert::observations_from_latest;
use super::lifecycle::{cancellable, sleep_or_cancel, ServiceHandle};
use super::repository::PriceRepository;
use super::source::PriceSource;
use crate::error::Result;

const SERVICE: &str = "price_poller";

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub interval: Duration,
    pub retry_delay: Duration,
    /// Consecutive failures before backing off
    pub max_retries: u32,
    pub backoff_max: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            retry_delay: Duration::from_secs(10),
            max_retries: 5,
            backoff_max: Duration::from_secs(300),
        }
    }
}

/// Linear backoff once `fails` reaches `max_retries`, capped at `backoff_max`
pub fn backoff_delay(
    fails: u32,
    max_retries: u32,
    retry_delay: Duration,
    backoff_max: Duration,
) -> Option<Duration> {
    if fails < max_retries {
        return None;
    }
    let steps = fails - max_retries + 1;
    Some(retry_delay.saturating_mul(steps).min(backoff_max))
}

#[derive(Debug, Clone, Serialize)]
pub struct PollerStats {
    pub running: bool,
    pub consecutive_fails: u32,
    pub polls_completed: u64,
    pub observations_inserted: u64,
    pub interval_secs: u64,
}

pub struct PricePoller {
    source: Arc<dyn PriceSource>,
    repo: Arc<dyn PriceRepository>,
    config: PollerConfig,
    handle: ServiceHandle,
    consecutive_fails: AtomicU32,
    polls_completed: AtomicU64,
    observations_inserted: AtomicU64,
}

impl PricePoller {
    pub fn new(
        source: Arc<dyn PriceSource>,
        repo: Arc<dyn PriceRepository>,
        config: PollerConfig,
    ) -> Self {
        Self {
            source,
            repo,
            config,
            handle: ServiceHandle::new(SERVICE),
            consecutive_fails: AtomicU32::new(0),
            polls_completed: AtomicU64::new(0),
            observations_inserted: AtomicU64::new(0),
        }
    }

    /// Spawn the polling loop; a second call while running does nothing
    pub fn start(self: &Arc<Self>) -> bool {
        let this = Arc::clone(self);
        self.handle.spawn(move |cancel| async move { this.run(cancel).await })
    }

    /// Signal the loop to exit. Returns without waiting for the loop.
    pub fn stop(&self) {
        self.handle.signal_stop();
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_running()
    }

    pub fn stats(&self) -> PollerStats {
        PollerStats {
            running: self.is_running(),
            consecutive_fails: self.consecutive_fails.load(Ordering::SeqCst),
            polls_completed: self.polls_completed.load(Ordering::SeqCst),
            observations_inserted: self.observations_inserted.load(Ordering::SeqCst),
            interval_secs: self.config.interval.as_secs(),
        }
    }

    async fn run(&self, cancel: CancellationToken) {
        info!(
            service = SERVICE,
            interval_secs = self.config.interval.as_secs(),
            "starting polling loop"
        );

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.poll_once_cancellable(&cancel).await {
                Ok(_) => self.consecutive_fails.store(0, Ordering::SeqCst),
                Err(e) if e.is_cancelled() => break,
                Err(e) => {
                    let Some(backoff) = self.record_failure(&e) else {
                        continue;
                    };
                    warn!(
                        service = SERVICE,
                        backoff_secs = backoff.as_secs(),
                        "backing off due to repeated failures"
                    );
                    // Racing the stop signal keeps shutdown prompt during long backoffs
                    if sleep_or_cancel(&cancel, backoff).await.is_err() {
                        break;
                    }
                }
            }
        }

        info!(service = SERVICE, "polling loop stopped");
    }

    /// Fetch one snapshot and store it; returns rows written
    pub async fn poll_once(&self) -> Result<u64> {
        let observed_at = Utc::now();
        debug!(service = SERVICE, "fetching latest prices");

        let resp = self.source.latest_prices(None).await?;
        let observations = observations_from_latest(&resp, observed_at);
        let inserted = self.repo.insert_observations(&observations).await?;

        self.polls_completed.fetch_add(1, Ordering::SeqCst);
        self.observations_inserted.fetch_add(inserted, Ordering::SeqCst);
        info!(
            service = SERVICE,
            items_fetched = resp.data.len(),
            rows_inserted = inserted,
            observed_at = %observed_at.to_rfc3339(),
            "poll completed"
        );
        Ok(inserted)
    }

    /// Same as [`Self::poll_once`] but abandoned when `cancel` fires
    pub async fn poll_once_cancellable(&self, cancel: &CancellationToken) -> Result<u64> {
        cancellable(cancel, self.poll_once()).await
    }

    fn record_failure(&self, err: &crate::error::CollectorError) -> Option<Duration> {
        let fails = self.consecutive_fails.fetch_add(1, Ordering::SeqCst) + 1;
        error!(service = SERVICE, consecutive_fails = fails, error = %err, "poll failed");
        backoff_delay(
            fails,
            self.config.max_retries,
            self.config.retry_delay,
            self.config.backoff_max,
        )
    }
}
