use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;

use crate::domain::{
    CatalogItem, CompletenessDistribution, PriceBucket, PriceObservation, Resolution,
    SyncCoverageStats, ZeroDataItem,
};
use crate::error::Result;

/// Persistence used by every collector service.
///
/// `retention` arguments follow [`crate::domain::RetentionPolicy::retention`]:
/// zero means unlimited, bounded by the upstream series span.
#[async_trait]
pub trait PriceRepository: Send + Sync {
    // ==================== Writes ====================

    /// Append observations; returns rows written
    async fn insert_observations(&self, batch: &[PriceObservation]) -> Result<u64>;

    /// Upsert buckets on (item, bucket_start) per resolution, last write wins.
    /// Duplicate keys inside one batch collapse to the last occurrence.
    async fn insert_buckets(&self, batch: &[PriceBucket]) -> Result<u64>;

    /// Upsert catalog metadata; zero optionals stored as NULL
    async fn upsert_items(&self, items: &[CatalogItem]) -> Result<u64>;

    /// Flag or unflag items for fine-resolution volume polling
    async fn set_poll_volume(&self, item_ids: &[i32], poll_volume: bool) -> Result<u64>;

    // ==================== Discovery ====================

    /// Closed bucket starts in the window with zero or fewer than `min_items`
    /// rows, newest first
    async fn missing_or_incomplete_timestamps(
        &self,
        resolution: Resolution,
        retention: Duration,
        min_items: usize,
        limit: usize,
    ) -> Result<Vec<DateTime<Utc>>>;

    /// Catalog items (with or without data) under 90% of expected buckets
    async fn items_needing_sync(
        &self,
        resolution: Resolution,
        retention: Duration,
        limit: usize,
    ) -> Result<Vec<i32>>;

    /// Items with some but under 90% of expected buckets
    async fn items_with_gaps(
        &self,
        resolution: Resolution,
        retention: Duration,
        limit: usize,
    ) -> Result<Vec<i32>>;

    async fn distinct_observed_item_ids(&self) -> Result<Vec<i32>>;

    /// Items with at least one row at `resolution`
    async fn backfilled_items(&self, resolution: Resolution) -> Result<HashSet<i32>>;

    async fn items_flagged_for_volume_polling(&self) -> Result<Vec<i32>>;

    // ==================== Status ====================

    async fn item_count(&self) -> Result<i64>;

    async fn observation_count(&self) -> Result<i64>;

    async fn latest_observation_time(&self) -> Result<Option<DateTime<Utc>>>;

    async fn bucket_count(&self, resolution: Resolution) -> Result<i64>;

    async fn coverage_stats(&self, resolution: Resolution) -> Result<SyncCoverageStats>;

    async fn completeness_distribution(
        &self,
        resolution: Resolution,
        retention: Duration,
    ) -> Result<CompletenessDistribution>;

    async fn items_with_zero_data(
        &self,
        resolution: Resolution,
        limit: usize,
    ) -> Result<Vec<ZeroDataItem>>;

    /// Whether the newest observation is younger than `threshold`
    async fn is_data_fresh(&self, threshold: Duration) -> Result<bool> {
        Ok(self
            .latest_observation_time()
            .await?
            .map(|t| Utc::now() - t < threshold)
            .unwrap_or(false))
    }
}
