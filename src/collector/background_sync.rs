//! Timer-driven gap repair across every configured resolution.
//!
//! Each cycle asks the repository what is missing or stale, then fetches and
//! upserts it one target at a time through the shared rate limiter. Which
//! question gets asked is a [`DiscoveryStrategy`]; several can be chained, and
//! earlier strategies in the list get first claim on the per-cycle budget.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::convert::{buckets_from_bulk, buckets_from_series};
use super::lifecycle::{cancellable, ServiceHandle};
use super::rate_limiter::RateLimiter;
use super::repository::PriceRepository;
use super::source::PriceSource;
use crate::domain::{Resolution, RetentionPolicy};
use crate::error::{CollectorError, Result};

const SERVICE: &str = "background_sync";

/// How a cycle finds what to repair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryStrategy {
    /// Bucket timestamps with no rows or too few items; one all-items
    /// snapshot per timestamp
    Timestamps,
    /// Items with some but incomplete coverage; one series per item
    ItemGaps,
    /// Catalog items under-covered or never synced; one series per item
    NewItems,
}

impl DiscoveryStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscoveryStrategy::Timestamps => "timestamps",
            DiscoveryStrategy::ItemGaps => "item_gaps",
            DiscoveryStrategy::NewItems => "new_items",
        }
    }
}

impl std::fmt::Display for DiscoveryStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for DiscoveryStrategy {
    type Err = CollectorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "timestamps" => Ok(DiscoveryStrategy::Timestamps),
            "item_gaps" => Ok(DiscoveryStrategy::ItemGaps),
            "new_items" => Ok(DiscoveryStrategy::NewItems),
            other => Err(CollectorError::Validation(format!(
                "unknown discovery strategy: {} (valid: timestamps, item_gaps, new_items)",
                other
            ))),
        }
    }
}

/// One unit of repair work; each costs one upstream request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncTarget {
    Timestamp(DateTime<Utc>),
    Item(i32),
}

#[derive(Debug, Clone)]
pub struct BackgroundSyncConfig {
    pub resolutions: Vec<Resolution>,
    pub run_interval: Duration,
    /// Upstream requests allowed per resolution per cycle
    pub targets_per_cycle: usize,
    /// Timestamps with fewer items than this are re-fetched
    pub min_item_threshold: usize,
    /// Applied in order; earlier strategies take budget first
    pub strategies: Vec<DiscoveryStrategy>,
}

impl Default for BackgroundSyncConfig {
    fn default() -> Self {
        Self {
            resolutions: Resolution::ALL.to_vec(),
            run_interval: Duration::from_secs(300),
            targets_per_cycle: 50,
            min_item_threshold: 100,
            strategies: vec![DiscoveryStrategy::Timestamps],
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BackgroundSyncProgress {
    pub cycles_completed: u64,
    pub timestamps_synced: u64,
    pub items_synced: u64,
    pub buckets_filled: u64,
    pub errors: u64,
    pub last_cycle_start: Option<DateTime<Utc>>,
    pub last_cycle_end: Option<DateTime<Utc>>,
}

/// Counters for one cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleTally {
    pub timestamps_synced: u64,
    pub items_synced: u64,
    pub buckets_filled: u64,
    pub errors: u64,
}

impl CycleTally {
    fn add(&mut self, other: CycleTally) {
        self.timestamps_synced += other.timestamps_synced;
        self.items_synced += other.items_synced;
        self.buckets_filled += other.buckets_filled;
        self.errors += other.errors;
    }
}

pub struct BackgroundSync {
    source: Arc<dyn PriceSource>,
    repo: Arc<dyn PriceRepository>,
    limiter: Arc<RateLimiter>,
    retention: RetentionPolicy,
    config: BackgroundSyncConfig,
    handle: ServiceHandle,
    progress: RwLock<BackgroundSyncProgress>,
}

impl BackgroundSync {
    pub fn new(
        source: Arc<dyn PriceSource>,
        repo: Arc<dyn PriceRepository>,
        limiter: Arc<RateLimiter>,
        retention: RetentionPolicy,
        config: BackgroundSyncConfig,
    ) -> Self {
        Self {
            source,
            repo,
            limiter,
            retention,
            config,
            handle: ServiceHandle::new(SERVICE),
            progress: RwLock::new(BackgroundSyncProgress::default()),
        }
    }

    pub fn start(self: &Arc<Self>) -> bool {
        let this = Arc::clone(self);
        self.handle.spawn(move |cancel| async move { this.run(cancel).await })
    }

    /// Stop the loop and wait for it to exit. Upserts already applied stay.
    pub async fn stop(&self) {
        self.handle.stop().await;
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_running()
    }

    pub async fn progress(&self) -> BackgroundSyncProgress {
        self.progress.read().await.clone()
    }

    async fn run(&self, cancel: CancellationToken) {
        let resolutions: Vec<&str> = self.config.resolutions.iter().map(|r| r.as_str()).collect();
        let strategies: Vec<&str> = self.config.strategies.iter().map(|s| s.as_str()).collect();
        info!(
            service = SERVICE,
            resolutions = ?resolutions,
            strategies = ?strategies,
            run_interval_secs = self.config.run_interval.as_secs(),
            targets_per_cycle = self.config.targets_per_cycle,
            min_item_threshold = self.config.min_item_threshold,
            "starting background sync"
        );

        let mut ticker = tokio::time::interval(self.config.run_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let cycle = cancel.child_token();
            self.run_cycle(&cycle).await;
        }

        info!(service = SERVICE, "background sync stopped");
    }

    /// One pass over every configured resolution
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> CycleTally {
        let started = Utc::now();
        self.progress.write().await.last_cycle_start = Some(started);

        let mut tally = CycleTally::default();
        for &resolution in &self.config.resolutions {
            if cancel.is_cancelled() {
                break;
            }
            tally.add(self.sync_resolution(cancel, resolution).await);
        }

        let finished = Utc::now();
        let interrupted = cancel.is_cancelled();
        let cycle = {
            let mut progress = self.progress.write().await;
            progress.timestamps_synced += tally.timestamps_synced;
            progress.items_synced += tally.items_synced;
            progress.buckets_filled += tally.buckets_filled;
            progress.errors += tally.errors;
            // An interrupted cycle keeps its applied work but is not a completed cycle
            if !interrupted {
                progress.cycles_completed += 1;
                progress.last_cycle_end = Some(finished);
            }
            progress.cycles_completed
        };

        if interrupted {
            info!(
                service = SERVICE,
                timestamps_synced = tally.timestamps_synced,
                items_synced = tally.items_synced,
                buckets_filled = tally.buckets_filled,
                errors = tally.errors,
                "sync cycle interrupted"
            );
            return tally;
        }

        info!(
            service = SERVICE,
            cycle,
            timestamps_synced = tally.timestamps_synced,
            items_synced = tally.items_synced,
            buckets_filled = tally.buckets_filled,
            errors = tally.errors,
            duration_ms = (finished - started).num_milliseconds(),
            "sync cycle completed"
        );
        tally
    }

    async fn sync_resolution(
        &self,
        cancel: &CancellationToken,
        resolution: Resolution,
    ) -> CycleTally {
        let mut tally = CycleTally::default();
        let mut budget = self.config.targets_per_cycle;
        let mut seen: HashSet<SyncTarget> = HashSet::new();

        for &strategy in &self.config.strategies {
            if budget == 0 || cancel.is_cancelled() {
                break;
            }

            let targets = match self.discover(cancel, strategy, resolution, budget).await {
                Ok(targets) => targets,
                Err(e) if e.is_cancelled() => break,
                Err(e) => {
                    // Enumeration failure abandons only this resolution
                    error!(
                        service = SERVICE,
                        resolution = %resolution,
                        strategy = %strategy,
                        error = %e,
                        "failed to discover sync targets"
                    );
                    tally.errors += 1;
                    break;
                }
            };

            let targets: Vec<SyncTarget> =
                targets.into_iter().filter(|t| seen.insert(*t)).collect();
            if targets.is_empty() {
                debug!(
                    service = SERVICE,
                    resolution = %resolution,
                    strategy = %strategy,
                    "no targets need sync"
                );
                continue;
            }
            debug!(
                service = SERVICE,
                resolution = %resolution,
                strategy = %strategy,
                targets = targets.len(),
                "syncing targets"
            );

            for target in targets {
                if cancel.is_cancelled() {
                    return tally;
                }
                budget = budget.saturating_sub(1);

                match self.sync_target(cancel, resolution, target).await {
                    Ok(filled) => {
                        match target {
                            SyncTarget::Timestamp(_) => tally.timestamps_synced += 1,
                            SyncTarget::Item(_) => tally.items_synced += 1,
                        }
                        tally.buckets_filled += filled;
                    }
                    Err(e) if e.is_cancelled() => return tally,
                    Err(e) => {
                        match target {
                            SyncTarget::Timestamp(ts) => warn!(
                                service = SERVICE,
                                resolution = %resolution,
                                timestamp = %ts.to_rfc3339(),
                                error = %e,
                                "failed to sync timestamp"
                            ),
                            SyncTarget::Item(item_id) => warn!(
                                service = SERVICE,
                                resolution = %resolution,
                                item_id,
                                error = %e,
                                "failed to sync item"
                            ),
                        }
                        tally.errors += 1;
                    }
                }
            }
        }

        tally
    }

    async fn discover(
        &self,
        cancel: &CancellationToken,
        strategy: DiscoveryStrategy,
        resolution: Resolution,
        limit: usize,
    ) -> Result<Vec<SyncTarget>> {
        let retention = self.retention.retention(resolution);
        let targets = match strategy {
            DiscoveryStrategy::Timestamps => cancellable(
                cancel,
                self.repo.missing_or_incomplete_timestamps(
                    resolution,
                    retention,
                    self.config.min_item_threshold,
                    limit,
                ),
            )
            .await?
            .into_iter()
            .map(SyncTarget::Timestamp)
            .collect(),
            DiscoveryStrategy::ItemGaps => {
                cancellable(cancel, self.repo.items_with_gaps(resolution, retention, limit))
                    .await?
                    .into_iter()
                    .map(SyncTarget::Item)
                    .collect()
            }
            DiscoveryStrategy::NewItems => {
                cancellable(cancel, self.repo.items_needing_sync(resolution, retention, limit))
                    .await?
                    .into_iter()
                    .map(SyncTarget::Item)
                    .collect()
            }
        };
        Ok(targets)
    }

    async fn sync_target(
        &self,
        cancel: &CancellationToken,
        resolution: Resolution,
        target: SyncTarget,
    ) -> Result<u64> {
        self.limiter.wait(cancel).await?;

        let buckets = match target {
            SyncTarget::Timestamp(ts) => {
                let resp =
                    cancellable(cancel, self.source.bulk_prices(resolution, Some(ts))).await?;
                buckets_from_bulk(&resp, resolution)
            }
            SyncTarget::Item(item_id) => {
                let resp = cancellable(cancel, self.source.timeseries(item_id, resolution)).await?;
                let cutoff = self.retention.cutoff(resolution, Utc::now());
                buckets_from_series(item_id, resolution, &resp, cutoff).buckets
            }
        };

        if buckets.is_empty() {
            return Ok(0);
        }
        cancellable(cancel, self.repo.insert_buckets(&buckets)).await
    }
}
