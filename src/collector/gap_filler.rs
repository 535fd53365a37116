//! Bounded item-wise gap repair.
//!
//! Each run picks up to `items_per_run` items per resolution that have some
//! data but fall short of the expected bucket count, and re-fetches their
//! series through the shared rate limiter.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backfiller::RunOutcome;
use super::convert::buckets_from_series;
use super::lifecycle::{cancellable, linked_token, RunningGuard};
use super::rate_limiter::RateLimiter;
use super::repository::PriceRepository;
use super::source::PriceSource;
use crate::domain::{Resolution, RetentionPolicy};
use crate::error::{CollectorError, Result};

const SERVICE: &str = "gap_filler";

#[derive(Debug, Clone)]
pub struct GapFillerConfig {
    pub resolutions: Vec<Resolution>,
    /// Items repaired per resolution per run
    pub items_per_run: usize,
}

impl Default for GapFillerConfig {
    fn default() -> Self {
        Self {
            resolutions: Resolution::ALL.to_vec(),
            items_per_run: 150,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GapFillProgress {
    pub items_scanned: usize,
    /// Items attempted, failed ones included
    pub items_processed: usize,
    pub gaps_found: usize,
    pub buckets_filled: u64,
    pub errors: usize,
    pub current_item: Option<i32>,
    pub current_resolution: Option<Resolution>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

pub struct GapFiller {
    source: Arc<dyn PriceSource>,
    repo: Arc<dyn PriceRepository>,
    limiter: Arc<RateLimiter>,
    retention: RetentionPolicy,
    config: GapFillerConfig,
    running: Arc<AtomicBool>,
    stop: Mutex<CancellationToken>,
    progress: RwLock<GapFillProgress>,
}

impl GapFiller {
    pub fn new(
        source: Arc<dyn PriceSource>,
        repo: Arc<dyn PriceRepository>,
        limiter: Arc<RateLimiter>,
        retention: RetentionPolicy,
        config: GapFillerConfig,
    ) -> Self {
        Self {
            source,
            repo,
            limiter,
            retention,
            config,
            running: Arc::new(AtomicBool::new(false)),
            stop: Mutex::new(CancellationToken::new()),
            progress: RwLock::new(GapFillProgress::default()),
        }
    }

    /// Signal a run in progress to finish after its current item
    pub fn stop(&self) {
        self.lock_stop().cancel();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn progress(&self) -> GapFillProgress {
        self.progress.read().await.clone()
    }

    /// One pass over every configured resolution.
    ///
    /// Caller cancellation returns [`CollectorError::Cancelled`]; `stop()`
    /// returns [`RunOutcome::Stopped`]. Counters are read with `progress()`.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<RunOutcome> {
        let Some(_guard) = RunningGuard::acquire(&self.running) else {
            return Ok(RunOutcome::AlreadyRunning);
        };
        let stop = {
            let mut slot = self.lock_stop();
            *slot = CancellationToken::new();
            slot.clone()
        };
        let run_cancel = linked_token(&stop, cancel);
        let _release = run_cancel.clone().drop_guard();

        *self.progress.write().await = GapFillProgress {
            start_time: Some(Utc::now()),
            ..Default::default()
        };

        for &resolution in &self.config.resolutions {
            if run_cancel.is_cancelled() && !cancel.is_cancelled() {
                info!(service = SERVICE, "gap fill stopped by signal");
                return Ok(RunOutcome::Stopped);
            }
            match self.fill_resolution(&run_cancel, resolution).await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() && !cancel.is_cancelled() => {
                    info!(service = SERVICE, "gap fill stopped by signal");
                    return Ok(RunOutcome::Stopped);
                }
                Err(e) => return Err(e),
            }
        }

        let progress = {
            let mut progress = self.progress.write().await;
            progress.end_time = Some(Utc::now());
            progress.current_item = None;
            progress.current_resolution = None;
            progress.clone()
        };
        info!(
            service = SERVICE,
            items_processed = progress.items_processed,
            gaps_found = progress.gaps_found,
            buckets_filled = progress.buckets_filled,
            errors = progress.errors,
            "gap fill complete"
        );
        Ok(RunOutcome::Completed)
    }

    async fn fill_resolution(
        &self,
        cancel: &CancellationToken,
        resolution: Resolution,
    ) -> Result<()> {
        let items = cancellable(
            cancel,
            self.repo.items_with_gaps(
                resolution,
                self.retention.retention(resolution),
                self.config.items_per_run,
            ),
        )
        .await?;

        {
            let mut progress = self.progress.write().await;
            progress.items_scanned += items.len();
            progress.gaps_found += items.len();
        }
        if items.is_empty() {
            debug!(service = SERVICE, resolution = %resolution, "no gaps found");
            return Ok(());
        }
        info!(
            service = SERVICE,
            resolution = %resolution,
            items = items.len(),
            "filling gaps"
        );

        for item_id in items {
            if cancel.is_cancelled() {
                return Err(CollectorError::Cancelled);
            }

            {
                let mut progress = self.progress.write().await;
                progress.current_item = Some(item_id);
                progress.current_resolution = Some(resolution);
            }

            match self.fill_item(cancel, item_id, resolution).await {
                Ok(filled) => self.progress.write().await.buckets_filled += filled,
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    warn!(
                        service = SERVICE,
                        item_id,
                        resolution = %resolution,
                        error = %e,
                        "failed to fill gaps"
                    );
                    self.progress.write().await.errors += 1;
                }
            }
            self.progress.write().await.items_processed += 1;
        }

        Ok(())
    }

    async fn fill_item(
        &self,
        cancel: &CancellationToken,
        item_id: i32,
        resolution: Resolution,
    ) -> Result<u64> {
        self.limiter.wait(cancel).await?;

        let resp = cancellable(cancel, self.source.timeseries(item_id, resolution)).await?;
        let cutoff = self.retention.cutoff(resolution, Utc::now());
        let series = buckets_from_series(item_id, resolution, &resp, cutoff);
        if series.outside_retention > 0 {
            debug!(
                service = SERVICE,
                item_id,
                skipped = series.outside_retention,
                "dropped points outside retention"
            );
        }
        if series.buckets.is_empty() {
            return Ok(0);
        }

        cancellable(cancel, self.repo.insert_buckets(&series.buckets)).await
    }

    fn lock_stop(&self) -> MutexGuard<'_, CancellationToken> {
        self.stop.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MemoryStore;
    use crate::collector::source::{MockPriceSource, TimeseriesPoint, TimeseriesResponse};
    use crate::domain::{CatalogItem, PriceBucket, SOURCE_API};
    use std::time::Duration;

    fn bucket(item_id: i32, bucket_start: DateTime<Utc>) -> PriceBucket {
        PriceBucket {
            item_id,
            bucket_start,
            resolution: Resolution::OneDay,
            avg_high_price: Some(100),
            high_price_volume: None,
            avg_low_price: None,
            low_price_volume: None,
            source: SOURCE_API.to_string(),
        }
    }

    #[tokio::test]
    async fn test_fills_only_items_with_gaps() {
        let store = Arc::new(MemoryStore::new());
        store
            .upsert_items(&[CatalogItem::new(2, "Cannonball"), CatalogItem::new(6, "Cannon base")])
            .await
            .unwrap();
        let latest = Resolution::OneDay.last_closed_bucket(Utc::now());
        store.insert_buckets(&[bucket(2, latest)]).await.unwrap();

        let mut source = MockPriceSource::new();
        source
            .expect_timeseries()
            .withf(|item_id, res| *item_id == 2 && *res == Resolution::OneDay)
            .times(1)
            .returning(move |_, _| {
                Ok(TimeseriesResponse {
                    data: (1..=3)
                        .map(|days| TimeseriesPoint {
                            timestamp: (latest - chrono::Duration::days(days)).timestamp(),
                            avg_low_price: Some(90),
                            ..Default::default()
                        })
                        .collect(),
                })
            });

        let filler = GapFiller::new(
            Arc::new(source),
            store.clone(),
            Arc::new(RateLimiter::new(Duration::from_millis(1))),
            RetentionPolicy::standard(),
            GapFillerConfig {
                resolutions: vec![Resolution::OneDay],
                items_per_run: 10,
            },
        );
        let outcome = filler.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed);

        let progress = filler.progress().await;
        assert_eq!(progress.gaps_found, 1);
        assert_eq!(progress.items_processed, 1);
        assert_eq!(progress.buckets_filled, 3);
        assert_eq!(store.bucket_count(Resolution::OneDay).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_cancelled_run_stops_before_fetching() {
        let store = Arc::new(MemoryStore::new());
        let filler = GapFiller::new(
            Arc::new(MockPriceSource::new()),
            store,
            Arc::new(RateLimiter::new(Duration::from_millis(1))),
            RetentionPolicy::standard(),
            GapFillerConfig::default(),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(filler.run(&cancel).await.unwrap_err().is_cancelled());
    }

    /// Two items with partial daily coverage, and a limiter whose only free
    /// permit is already spent
    async fn blocked_filler(source: MockPriceSource) -> Arc<GapFiller> {
        let store = Arc::new(MemoryStore::new());
        let latest = Resolution::OneDay.last_closed_bucket(Utc::now());
        store
            .insert_buckets(&[bucket(2, latest), bucket(6, latest)])
            .await
            .unwrap();

        let limiter = Arc::new(RateLimiter::new(Duration::from_secs(60)));
        assert!(limiter.try_acquire());

        Arc::new(GapFiller::new(
            Arc::new(source),
            store,
            limiter,
            RetentionPolicy::standard(),
            GapFillerConfig {
                resolutions: vec![Resolution::OneDay, Resolution::OneHour],
                items_per_run: 10,
            },
        ))
    }

    async fn wait_until_running(filler: &GapFiller) {
        for _ in 0..200 {
            if filler.is_running() && filler.progress().await.current_item.is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("gap filler never started");
    }

    #[tokio::test]
    async fn test_stop_ends_run_before_next_item() {
        // Stopped while waiting for a permit, so nothing is fetched
        let filler = blocked_filler(MockPriceSource::new()).await;

        let run = {
            let filler = filler.clone();
            tokio::spawn(async move { filler.run(&CancellationToken::new()).await })
        };
        wait_until_running(&filler).await;
        filler.stop();

        let outcome = run.await.unwrap().unwrap();
        assert_eq!(outcome, RunOutcome::Stopped);
        assert!(!filler.is_running());

        let progress = filler.progress().await;
        assert_eq!(progress.gaps_found, 2);
        assert_eq!(progress.items_processed, 0);
        assert_eq!(progress.current_item, Some(2));
        assert_eq!(progress.current_resolution, Some(Resolution::OneDay));
        assert!(progress.end_time.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_run_is_rejected() {
        let filler = blocked_filler(MockPriceSource::new()).await;

        let first = {
            let filler = filler.clone();
            tokio::spawn(async move { filler.run(&CancellationToken::new()).await })
        };
        wait_until_running(&filler).await;

        let second = filler.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(second, RunOutcome::AlreadyRunning);

        filler.stop();
        assert_eq!(first.await.unwrap().unwrap(), RunOutcome::Stopped);
    }

    #[tokio::test]
    async fn test_failed_items_count_as_processed() {
        let store = Arc::new(MemoryStore::new());
        let latest = Resolution::OneDay.last_closed_bucket(Utc::now());
        store.insert_buckets(&[bucket(2, latest)]).await.unwrap();

        let mut source = MockPriceSource::new();
        source.expect_timeseries().times(1).returning(|_, _| {
            Err(CollectorError::UpstreamStatus {
                endpoint: "/timeseries".to_string(),
                status: 500,
            })
        });

        let filler = GapFiller::new(
            Arc::new(source),
            store,
            Arc::new(RateLimiter::new(Duration::from_millis(1))),
            RetentionPolicy::standard(),
            GapFillerConfig {
                resolutions: vec![Resolution::OneDay],
                items_per_run: 10,
            },
        );
        assert_eq!(
            filler.run(&CancellationToken::new()).await.unwrap(),
            RunOutcome::Completed
        );

        let progress = filler.progress().await;
        assert_eq!(progress.items_processed, 1);
        assert_eq!(progress.errors, 1);
        assert_eq!(progress.buckets_filled, 0);
    }
}
