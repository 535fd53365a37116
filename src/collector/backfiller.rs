//! One-shot historical backfill.
//!
//! Pulls the full upstream series for every known item that has no rows yet
//! at a resolution. Items already backfilled are skipped, so an interrupted
//! run resumes where it left off.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::convert::buckets_from_series;
use super::lifecycle::{cancellable, linked_token, sleep_or_cancel, RunningGuard};
use super::repository::PriceRepository;
use super::source::PriceSource;
use crate::domain::Resolution;
use crate::error::{CollectorError, Result};

const SERVICE: &str = "backfiller";

#[derive(Debug, Clone)]
pub struct BackfillerConfig {
    pub resolutions: Vec<Resolution>,
    /// Fixed pause between items
    pub item_delay: Duration,
    /// Items between progress log lines
    pub batch_size: usize,
}

impl Default for BackfillerConfig {
    fn default() -> Self {
        Self {
            resolutions: Resolution::ALL.to_vec(),
            item_delay: Duration::from_millis(100),
            batch_size: 100,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BackfillProgress {
    pub total_items: usize,
    pub processed_items: usize,
    pub skipped_items: usize,
    pub current_item: Option<i32>,
    pub current_resolution: Option<Resolution>,
    pub buckets_inserted: u64,
    pub errors: usize,
    pub start_time: Option<DateTime<Utc>>,
}

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    /// `stop()` was called; work done so far is kept
    Stopped,
    /// Another run was already in progress
    AlreadyRunning,
}

pub struct Backfiller {
    source: Arc<dyn PriceSource>,
    repo: Arc<dyn PriceRepository>,
    config: BackfillerConfig,
    running: Arc<AtomicBool>,
    stop: Mutex<CancellationToken>,
    progress: RwLock<BackfillProgress>,
}

impl Backfiller {
    pub fn new(
        source: Arc<dyn PriceSource>,
        repo: Arc<dyn PriceRepository>,
        config: BackfillerConfig,
    ) -> Self {
        Self {
            source,
            repo,
            config,
            running: Arc::new(AtomicBool::new(false)),
            stop: Mutex::new(CancellationToken::new()),
            progress: RwLock::new(BackfillProgress::default()),
        }
    }

    /// Signal a run in progress to finish after its current item
    pub fn stop(&self) {
        self.stop_token().cancel();
    }

    pub async fn progress(&self) -> BackfillProgress {
        self.progress.read().await.clone()
    }

    /// Run to completion, until `stop()`, or until `cancel` fires.
    ///
    /// Caller cancellation returns [`CollectorError::Cancelled`]; `stop()`
    /// returns [`RunOutcome::Stopped`].
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

        *self.progress.write().await = BackfillProgress {
            start_time: Some(Utc::now()),
            ..Default::default()
        };

        match self.backfill_all(&run_cancel).await {
            Ok(()) => {}
            Err(e) if e.is_cancelled() && !cancel.is_cancelled() => {
                info!(service = SERVICE, "backfill stopped by signal");
                return Ok(RunOutcome::Stopped);
            }
            Err(e) => return Err(e),
        }

        let progress = self.progress().await;
        let elapsed_ms = progress
            .start_time
            .map(|t| (Utc::now() - t).num_milliseconds())
            .unwrap_or_default();
        info!(
            service = SERVICE,
            elapsed_ms,
            items_processed = progress.processed_items,
            buckets_inserted = progress.buckets_inserted,
            errors = progress.errors,
            "backfill complete"
        );
        Ok(RunOutcome::Completed)
    }

    async fn backfill_all(&self, cancel: &CancellationToken) -> Result<()> {
        let items = self.items_to_backfill(cancel).await?;
        self.progress.write().await.total_items = items.len();
        let resolutions: Vec<&str> = self.config.resolutions.iter().map(|r| r.as_str()).collect();
        info!(
            service = SERVICE,
            total_items = items.len(),
            resolutions = ?resolutions,
            "starting backfill"
        );

        for &resolution in &self.config.resolutions {
            self.backfill_resolution(cancel, &items, resolution).await?;
        }
        Ok(())
    }

    /// Items already seen by the live poller, or the whole catalog on a fresh store
    async fn items_to_backfill(&self, cancel: &CancellationToken) -> Result<Vec<i32>> {
        let items = cancellable(cancel, self.repo.distinct_observed_item_ids()).await?;
        if !items.is_empty() {
            return Ok(items);
        }

        info!(service = SERVICE, "no observations found, fetching item catalog");
        let catalog = cancellable(cancel, self.source.item_catalog()).await?;
        Ok(catalog.into_iter().map(|item| item.id).collect())
    }

    async fn backfill_resolution(
        &self,
        cancel: &CancellationToken,
        items: &[i32],
        resolution: Resolution,
    ) -> Result<()> {
        let done = cancellable(cancel, self.repo.backfilled_items(resolution)).await?;
        let todo: Vec<i32> = items.iter().copied().filter(|id| !done.contains(id)).collect();
        self.progress.write().await.skipped_items += items.len() - todo.len();

        info!(
            service = SERVICE,
            resolution = %resolution,
            items_to_process = todo.len(),
            already_done = done.len(),
            "backfilling resolution"
        );

        for (i, &item_id) in todo.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(CollectorError::Cancelled);
            }

            {
                let mut progress = self.progress.write().await;
                progress.current_item = Some(item_id);
                progress.current_resolution = Some(resolution);
            }

            match self.backfill_item(cancel, item_id, resolution).await {
                Ok(inserted) => self.progress.write().await.buckets_inserted += inserted,
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    warn!(
                        service = SERVICE,
                        item_id,
                        resolution = %resolution,
                        error = %e,
                        "failed to backfill item"
                    );
                    self.progress.write().await.errors += 1;
                }
            }
            self.progress.write().await.processed_items += 1;

            let done_count = i + 1;
            if self.config.batch_size > 0 && done_count % self.config.batch_size == 0 {
                info!(
                    service = SERVICE,
                    resolution = %resolution,
                    progress = done_count,
                    total = todo.len(),
                    percent = done_count as f64 / todo.len() as f64 * 100.0,
                    "backfill progress"
                );
            }

            sleep_or_cancel(cancel, self.config.item_delay).await?;
        }

        Ok(())
    }

    async fn backfill_item(
        &self,
        cancel: &CancellationToken,
        item_id: i32,
        resolution: Resolution,
    ) -> Result<u64> {
        let resp = cancellable(cancel, self.source.timeseries(item_id, resolution)).await?;
        let series = buckets_from_series(item_id, resolution, &resp, None);
        if series.buckets.is_empty() {
            return Ok(0);
        }
        cancellable(cancel, self.repo.insert_buckets(&series.buckets)).await
    }

    fn stop_token(&self) -> CancellationToken {
        self.lock_stop().clone()
    }

    fn lock_stop(&self) -> MutexGuard<'_, CancellationToken> {
        self.stop.lock().unwrap_or_else(|e| e.into_inner())
    }
}
