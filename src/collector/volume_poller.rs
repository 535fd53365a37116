//! Fine-resolution refresher for the volume allow-list.
//!
//! Items flagged `poll_volume` get their 5m series re-fetched every cycle so
//! their recent volumes stay current between gap-repair passes.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::convert::buckets_from_series;
use super::lifecycle::{cancellable, sleep_or_cancel, ServiceHandle};
use super::price_poller::backoff_delay;
use super::rate_limiter::RateLimiter;
use super::repository::PriceRepository;
use super::source::PriceSource;
use crate::domain::{Resolution, RetentionPolicy};
use crate::error::{CollectorError, Result};

const SERVICE: &str = "volume_poller";
const RESOLUTION: Resolution = Resolution::FiveMinutes;

#[derive(Debug, Clone)]
pub struct VolumePollerConfig {
    pub poll_interval: Duration,
    pub retry_delay: Duration,
    pub max_retries: u32,
    pub backoff_max: Duration,
}

impl Default for VolumePollerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(300),
            retry_delay: Duration::from_secs(10),
            max_retries: 5,
            backoff_max: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct VolumePollerProgress {
    pub cycles_completed: u64,
    pub items_polled: u64,
    pub buckets_filled: u64,
    pub errors: u64,
    pub last_poll_start: Option<DateTime<Utc>>,
    pub last_poll_end: Option<DateTime<Utc>>,
}

pub struct VolumePoller {
    source: Arc<dyn PriceSource>,
    repo: Arc<dyn PriceRepository>,
    limiter: Arc<RateLimiter>,
    retention: RetentionPolicy,
    config: VolumePollerConfig,
    handle: ServiceHandle,
    consecutive_fails: AtomicU32,
    progress: RwLock<VolumePollerProgress>,
}

impl VolumePoller {
    pub fn new(
        source: Arc<dyn PriceSource>,
        repo: Arc<dyn PriceRepository>,
        limiter: Arc<RateLimiter>,
        retention: RetentionPolicy,
        config: VolumePollerConfig,
    ) -> Self {
        Self {
            source,
            repo,
            limiter,
            retention,
            config,
            handle: ServiceHandle::new(SERVICE),
            consecutive_fails: AtomicU32::new(0),
            progress: RwLock::new(VolumePollerProgress::default()),
        }
    }

    pub fn start(self: &Arc<Self>) -> bool {
        let this = Arc::clone(self);
        self.handle.spawn(move |cancel| async move { this.run(cancel).await })
    }

    /// Stop the loop and wait for it to exit
    pub async fn stop(&self) {
        self.handle.stop().await;
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_running()
    }

    pub fn consecutive_fails(&self) -> u32 {
        self.consecutive_fails.load(Ordering::SeqCst)
    }

    pub async fn progress(&self) -> VolumePollerProgress {
        self.progress.read().await.clone()
    }

    async fn run(&self, cancel: CancellationToken) {
        info!(
            service = SERVICE,
            poll_interval_secs = self.config.poll_interval.as_secs(),
            rate_limit_ms = self.limiter.interval().as_millis() as u64,
            "starting volume poller"
        );

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let cycle = cancel.child_token();
            match self.poll_cycle(&cycle).await {
                Ok(()) => self.consecutive_fails.store(0, Ordering::SeqCst),
                Err(e) if e.is_cancelled() => break,
                Err(e) => {
                    let fails = self.consecutive_fails.fetch_add(1, Ordering::SeqCst) + 1;
                    error!(service = SERVICE, consecutive_fails = fails, error = %e, "poll failed");
                    if let Some(backoff) = backoff_delay(
                        fails,
                        self.config.max_retries,
                        self.config.retry_delay,
                        self.config.backoff_max,
                    ) {
                        warn!(
                            service = SERVICE,
                            backoff_secs = backoff.as_secs(),
                            "backing off due to repeated failures"
                        );
                        if sleep_or_cancel(&cancel, backoff).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        info!(service = SERVICE, "volume poller stopped");
    }

    /// One pass over the allow-list. Per-item failures are counted, not returned.
    pub async fn poll_cycle(&self, cancel: &CancellationToken) -> Result<()> {
        let started = Utc::now();
        self.progress.write().await.last_poll_start = Some(started);

        let items = cancellable(cancel, self.repo.items_flagged_for_volume_polling()).await?;
        if items.is_empty() {
            debug!(service = SERVICE, "no items flagged for volume polling");
            return Ok(());
        }
        debug!(service = SERVICE, items_count = items.len(), "polling volume data");

        let mut items_polled = 0u64;
        let mut buckets_filled = 0u64;
        let mut errors = 0u64;

        for item_id in items {
            if cancel.is_cancelled() {
                return Err(CollectorError::Cancelled);
            }

            match self.poll_item(cancel, item_id).await {
                Ok(filled) => {
                    items_polled += 1;
                    buckets_filled += filled;
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    warn!(service = SERVICE, item_id, error = %e, "failed to poll item");
                    errors += 1;
                }
            }
        }

        let finished = Utc::now();
        let cycle = {
            let mut progress = self.progress.write().await;
            progress.cycles_completed += 1;
            progress.items_polled += items_polled;
            progress.buckets_filled += buckets_filled;
            progress.errors += errors;
            progress.last_poll_end = Some(finished);
            progress.cycles_completed
        };

        info!(
            service = SERVICE,
            cycle,
            items_polled,
            buckets_filled,
            errors,
            duration_ms = (finished - started).num_milliseconds(),
            "volume poll completed"
        );
        Ok(())
    }

    async fn poll_item(&self, cancel: &CancellationToken, item_id: i32) -> Result<u64> {
        self.limiter.wait(cancel).await?;

        let resp = cancellable(cancel, self.source.timeseries(item_id, RESOLUTION)).await?;
        let cutoff = self.retention.cutoff(RESOLUTION, Utc::now());
        let series = buckets_from_series(item_id, RESOLUTION, &resp, cutoff);
        if series.buckets.is_empty() {
            return Ok(0);
        }

        cancellable(cancel, self.repo.insert_buckets(&series.buckets)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MemoryStore;
    use crate::collector::source::{MockPriceSource, TimeseriesPoint, TimeseriesResponse};
    use crate::domain::CatalogItem;
    use chrono::Duration as ChronoDuration;

    fn series_for(now: DateTime<Utc>) -> TimeseriesResponse {
        let recent = RESOLUTION.last_closed_bucket(now);
        TimeseriesResponse {
            data: vec![
                TimeseriesPoint {
                    timestamp: (recent - ChronoDuration::days(30)).timestamp(),
                    avg_high_price: Some(90),
                    ..Default::default()
                },
                TimeseriesPoint {
                    timestamp: recent.timestamp(),
                    avg_high_price: Some(100),
                    high_price_volume: Some(42),
                    avg_low_price: Some(95),
                    low_price_volume: Some(17),
                },
            ],
        }
    }

    fn poller(source: MockPriceSource, store: Arc<MemoryStore>) -> Arc<VolumePoller> {
        Arc::new(VolumePoller::new(
            Arc::new(source),
            store,
            Arc::new(RateLimiter::new(Duration::from_millis(100))),
            RetentionPolicy::standard(),
            VolumePollerConfig::default(),
        ))
    }

    #[tokio::test]
    async fn test_cycle_polls_flagged_items_within_retention() {
        let store = Arc::new(MemoryStore::new());
        store
            .upsert_items(&[CatalogItem::new(2, "Cannonball"), CatalogItem::new(6, "Cannon base")])
            .await
            .unwrap();
        store.set_poll_volume(&[2], true).await.unwrap();

        let mut source = MockPriceSource::new();
        source
            .expect_timeseries()
            .withf(|item_id, res| *item_id == 2 && *res == Resolution::FiveMinutes)
            .times(1)
            .returning(|_, _| Ok(series_for(Utc::now())));

        let poller = poller(source, store.clone());
        poller.poll_cycle(&CancellationToken::new()).await.unwrap();

        let rows = store.buckets(Resolution::FiveMinutes).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].high_price_volume, Some(42));

        let progress = poller.progress().await;
        assert_eq!(progress.cycles_completed, 1);
        assert_eq!(progress.items_polled, 1);
        assert_eq!(progress.buckets_filled, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_start_and_joining_stop() {
        let store = Arc::new(MemoryStore::new());
        let poller = poller(MockPriceSource::new(), store);

        assert!(poller.start());
        assert!(!poller.start());
        assert!(poller.is_running());

        poller.stop().await;
        assert!(!poller.is_running());
    }

    #[tokio::test]
    async fn test_item_failure_is_counted_not_fatal() {
        let store = Arc::new(MemoryStore::new());
        store
            .upsert_items(&[CatalogItem::new(2, "Cannonball"), CatalogItem::new(6, "Cannon base")])
            .await
            .unwrap();
        store.set_poll_volume(&[2, 6], true).await.unwrap();

        let mut source = MockPriceSource::new();
        source.expect_timeseries().returning(|item_id, _| {
            if item_id == 2 {
                Err(CollectorError::UpstreamStatus {
                    endpoint: "/timeseries".to_string(),
                    status: 500,
                })
            } else {
                Ok(series_for(Utc::now()))
            }
        });

        let poller = poller(source, store.clone());
        poller.poll_cycle(&CancellationToken::new()).await.unwrap();

        let progress = poller.progress().await;
        assert_eq!(progress.errors, 1);
        assert_eq!(progress.items_polled, 1);
        assert_eq!(poller.consecutive_fails(), 0);
    }
}
