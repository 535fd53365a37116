//! In-process repository.
//!
//! Mirrors the Postgres store's semantics over plain collections so services
//! can be driven without a database (tests, dry runs).

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

use crate::collector::repository::PriceRepository;
use crate::domain::{
    expected_buckets, group_for_upsert, incomplete_threshold, CatalogItem,
    CompletenessDistribution, PriceBucket, PriceObservation, Resolution, SyncCoverageStats,
    ZeroDataItem,
};
use crate::error::{CollectorError, Result};

#[derive(Debug, Clone)]
struct StoredItem {
    item: CatalogItem,
    poll_volume: bool,
}

#[derive(Default)]
struct Tables {
    items: BTreeMap<i32, StoredItem>,
    observations: Vec<PriceObservation>,
    buckets: HashMap<Resolution, BTreeMap<(i32, DateTime<Utc>), PriceBucket>>,
    failing_discovery: HashSet<Resolution>,
}

impl Tables {
    fn bucket_table(
        &self,
        resolution: Resolution,
    ) -> Option<&BTreeMap<(i32, DateTime<Utc>), PriceBucket>> {
        self.buckets.get(&resolution)
    }

    fn check_discoverable(&self, resolution: Resolution) -> Result<()> {
        if self.failing_discovery.contains(&resolution) {
            return Err(CollectorError::Internal(format!(
                "memory store discovery disabled for {resolution}"
            )));
        }
        Ok(())
    }

    /// Per-item bucket counts strictly after `since`
    fn counts_since(&self, resolution: Resolution, since: DateTime<Utc>) -> HashMap<i32, i64> {
        let mut counts = HashMap::new();
        if let Some(table) = self.bucket_table(resolution) {
            for (item_id, start) in table.keys() {
                if *start > since {
                    *counts.entry(*item_id).or_insert(0) += 1;
                }
            }
        }
        counts
    }

    fn last_seen_since(&self, since: DateTime<Utc>) -> HashMap<i32, DateTime<Utc>> {
        let mut last_seen: HashMap<i32, DateTime<Utc>> = HashMap::new();
        for obs in self.observations.iter().filter(|o| o.observed_at > since) {
            let entry = last_seen.entry(obs.item_id).or_insert(obs.observed_at);
            if obs.observed_at > *entry {
                *entry = obs.observed_at;
            }
        }
        last_seen
    }

    fn has_any_bucket(&self, resolution: Resolution, item_id: i32) -> bool {
        self.bucket_table(resolution)
            .map(|t| t.keys().any(|(id, _)| *id == item_id))
            .unwrap_or(false)
    }
}

/// Orders candidates by most recent observation (missing last), then id
fn prioritize(
    mut ids: Vec<i32>,
    last_seen: &HashMap<i32, DateTime<Utc>>,
    limit: usize,
) -> Vec<i32> {
    ids.sort_by(|a, b| {
        let la = last_seen.get(a);
        let lb = last_seen.get(b);
        match (la, lb) {
            (Some(x), Some(y)) => y.cmp(x).then(a.cmp(b)),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.cmp(b),
        }
    });
    ids.truncate(limit);
    ids
}

#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail, to exercise error paths
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make target discovery queries fail for one resolution
    pub async fn set_fail_discovery(&self, resolution: Resolution, fail: bool) {
        let mut tables = self.tables.write().await;
        if fail {
            tables.failing_discovery.insert(resolution);
        } else {
            tables.failing_discovery.remove(&resolution);
        }
    }

    pub async fn observations(&self) -> Vec<PriceObservation> {
        self.tables.read().await.observations.clone()
    }

    /// Stored buckets at one resolution, ordered by (item, bucket_start)
    pub async fn buckets(&self, resolution: Resolution) -> Vec<PriceBucket> {
        self.tables
            .read()
            .await
            .bucket_table(resolution)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn bucket(
        &self,
        resolution: Resolution,
        item_id: i32,
        bucket_start: DateTime<Utc>,
    ) -> Option<PriceBucket> {
        self.tables
            .read()
            .await
            .bucket_table(resolution)
            .and_then(|t| t.get(&(item_id, bucket_start)).cloned())
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(CollectorError::Internal("memory store writes disabled".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl PriceRepository for MemoryStore {
    async fn insert_observations(&self, batch: &[PriceObservation]) -> Result<u64> {
        self.check_writable()?;
        let mut tables = self.tables.write().await;
        tables.observations.extend_from_slice(batch);
        Ok(batch.len() as u64)
    }

    async fn insert_buckets(&self, batch: &[PriceBucket]) -> Result<u64> {
        self.check_writable()?;
        let mut tables = self.tables.write().await;
        let mut written = 0u64;

        for (resolution, rows) in group_for_upsert(batch) {
            let table = tables.buckets.entry(resolution).or_default();
            for row in rows {
                let key = (row.item_id, row.bucket_start);
                let replace = table.get(&key).map(|old| row.supersedes(old)).unwrap_or(true);
                if replace {
                    table.insert(key, row);
                    written += 1;
                }
            }
        }
        Ok(written)
    }

    async fn upsert_items(&self, items: &[CatalogItem]) -> Result<u64> {
        self.check_writable()?;
        let mut tables = self.tables.write().await;
        for item in items {
            let poll_volume = tables
                .items
                .get(&item.id)
                .map(|s| s.poll_volume)
                .unwrap_or(false);
            tables.items.insert(
                item.id,
                StoredItem {
                    item: item.clone(),
                    poll_volume,
                },
            );
        }
        Ok(items.len() as u64)
    }

    async fn set_poll_volume(&self, item_ids: &[i32], poll_volume: bool) -> Result<u64> {
        self.check_writable()?;
        let mut tables = self.tables.write().await;
        let mut affected = 0u64;
        for id in item_ids {
            if let Some(stored) = tables.items.get_mut(id) {
                stored.poll_volume = poll_volume;
                affected += 1;
            }
        }
        Ok(affected)
    }

    async fn missing_or_incomplete_timestamps(
        &self,
        resolution: Resolution,
        retention: Duration,
        min_items: usize,
        limit: usize,
    ) -> Result<Vec<DateTime<Utc>>> {
        let tables = self.tables.read().await;
        tables.check_discoverable(resolution)?;
        let mut per_ts: HashMap<DateTime<Utc>, usize> = HashMap::new();
        if let Some(table) = tables.bucket_table(resolution) {
            for (_, start) in table.keys() {
                *per_ts.entry(*start).or_insert(0) += 1;
            }
        }

        Ok(resolution
            .expected_bucket_starts(retention, Utc::now())
            .into_iter()
            .filter(|ts| {
                let n = per_ts.get(ts).copied().unwrap_or(0);
                n == 0 || n < min_items
            })
            .take(limit)
            .collect())
    }

    async fn items_needing_sync(
        &self,
        resolution: Resolution,
        retention: Duration,
        limit: usize,
    ) -> Result<Vec<i32>> {
        let tables = self.tables.read().await;
        tables.check_discoverable(resolution)?;
        let now = Utc::now();
        let since = resolution.window_start(retention, now);
        let threshold = incomplete_threshold(expected_buckets(since, now, resolution.step_secs()));
        let counts = tables.counts_since(resolution, since);

        let candidates = tables
            .items
            .keys()
            .copied()
            .filter(|id| (counts.get(id).copied().unwrap_or(0) as f64) < threshold)
            .collect();
        Ok(prioritize(candidates, &tables.last_seen_since(since), limit))
    }

    async fn items_with_gaps(
        &self,
        resolution: Resolution,
        retention: Duration,
        limit: usize,
    ) -> Result<Vec<i32>> {
        let tables = self.tables.read().await;
        tables.check_discoverable(resolution)?;
        let now = Utc::now();
        let since = resolution.window_start(retention, now);
        let threshold = incomplete_threshold(expected_buckets(since, now, resolution.step_secs()));

        let candidates = tables
            .counts_since(resolution, since)
            .into_iter()
            .filter(|(_, n)| (*n as f64) < threshold)
            .map(|(id, _)| id)
            .collect();
        Ok(prioritize(candidates, &tables.last_seen_since(since), limit))
    }

    async fn distinct_observed_item_ids(&self) -> Result<Vec<i32>> {
        let tables = self.tables.read().await;
        let ids: std::collections::BTreeSet<i32> =
            tables.observations.iter().map(|o| o.item_id).collect();
        Ok(ids.into_iter().collect())
    }

    async fn backfilled_items(&self, resolution: Resolution) -> Result<HashSet<i32>> {
        let tables = self.tables.read().await;
        Ok(tables
            .bucket_table(resolution)
            .map(|t| t.keys().map(|(id, _)| *id).collect())
            .unwrap_or_default())
    }

    async fn items_flagged_for_volume_polling(&self) -> Result<Vec<i32>> {
        let tables = self.tables.read().await;
        Ok(tables
            .items
            .values()
            .filter(|s| s.poll_volume)
            .map(|s| s.item.id)
            .collect())
    }

    async fn item_count(&self) -> Result<i64> {
        Ok(self.tables.read().await.items.len() as i64)
    }

    async fn observation_count(&self) -> Result<i64> {
        Ok(self.tables.read().await.observations.len() as i64)
    }

    async fn latest_observation_time(&self) -> Result<Option<DateTime<Utc>>> {
        let tables = self.tables.read().await;
        Ok(tables.observations.iter().map(|o| o.observed_at).max())
    }

    async fn bucket_count(&self, resolution: Resolution) -> Result<i64> {
        let tables = self.tables.read().await;
        Ok(tables.bucket_table(resolution).map(|t| t.len() as i64).unwrap_or(0))
    }

    async fn coverage_stats(&self, resolution: Resolution) -> Result<SyncCoverageStats> {
        let tables = self.tables.read().await;
        let total_items = tables.items.len() as i64;
        let items_with_data = tables
            .items
            .keys()
            .filter(|id| tables.has_any_bucket(resolution, **id))
            .count() as i64;
        let starts = tables
            .bucket_table(resolution)
            .map(|t| t.keys().map(|(_, s)| *s).collect::<Vec<_>>())
            .unwrap_or_default();

        Ok(SyncCoverageStats {
            total_items,
            items_with_data,
            items_with_no_data: total_items - items_with_data,
            oldest_bucket: starts.iter().min().copied(),
            newest_bucket: starts.iter().max().copied(),
        })
    }

    async fn completeness_distribution(
        &self,
        resolution: Resolution,
        retention: Duration,
    ) -> Result<CompletenessDistribution> {
        let tables = self.tables.read().await;
        let now = Utc::now();
        let since = resolution.window_start(retention, now);
        let expected = expected_buckets(since, now, resolution.step_secs());
        let counts = tables.counts_since(resolution, since);

        let mut dist = CompletenessDistribution::default();
        for id in tables.items.keys() {
            dist.record(counts.get(id).copied().unwrap_or(0), expected);
        }
        Ok(dist)
    }

    async fn items_with_zero_data(
        &self,
        resolution: Resolution,
        limit: usize,
    ) -> Result<Vec<ZeroDataItem>> {
        let tables = self.tables.read().await;
        Ok(tables
            .items
            .values()
            .filter(|s| !tables.has_any_bucket(resolution, s.item.id))
            .take(limit)
            .map(|s| ZeroDataItem {
                item_id: s.item.id,
                name: s.item.name.clone(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SOURCE_API;

    fn bucket(item_id: i32, start: DateTime<Utc>, res: Resolution, high: i64) -> PriceBucket {
        PriceBucket {
            item_id,
            bucket_start: start,
            resolution: res,
            avg_high_price: Some(high),
            high_price_volume: Some(10),
            avg_low_price: Some(high - 5),
            low_price_volume: Some(12),
            source: SOURCE_API.to_string(),
        }
    }

    #[tokio::test]
    async fn test_bucket_upsert_is_idempotent_last_write_wins() {
        let store = MemoryStore::new();
        let res = Resolution::OneHour;
        let ts = res.last_closed_bucket(Utc::now());

        store.insert_buckets(&[bucket(2, ts, res, 100)]).await.unwrap();
        store.insert_buckets(&[bucket(2, ts, res, 100)]).await.unwrap();
        assert_eq!(store.bucket_count(res).await.unwrap(), 1);

        store.insert_buckets(&[bucket(2, ts, res, 140)]).await.unwrap();
        let stored = store.bucket(res, 2, ts).await.unwrap();
        assert_eq!(stored.avg_high_price, Some(140));
        assert_eq!(store.bucket_count(res).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_missing_timestamps_respect_retention_and_threshold() {
        let store = MemoryStore::new();
        let res = Resolution::FiveMinutes;
        let retention = Duration::hours(1);
        let now = Utc::now();
        let newest = res.last_closed_bucket(now);

        // Newest bucket fully populated, next one only partially
        let full: Vec<_> = (1..=3).map(|id| bucket(id, newest, res, 100)).collect();
        store.insert_buckets(&full).await.unwrap();
        store
            .insert_buckets(&[bucket(1, newest - res.step(), res, 100)])
            .await
            .unwrap();

        let missing = store
            .missing_or_incomplete_timestamps(res, retention, 3, 100)
            .await
            .unwrap();

        assert!(!missing.contains(&newest));
        assert_eq!(missing.first(), Some(&(newest - res.step())));
        assert!(missing.iter().all(|ts| *ts >= now - retention));
        assert!(missing.windows(2).all(|w| w[0] > w[1]));
    }

    #[tokio::test]
    async fn test_items_with_gaps_excludes_empty_and_complete_items() {
        let store = MemoryStore::new();
        let res = Resolution::OneDay;
        let retention = Duration::days(10);
        let newest = res.last_closed_bucket(Utc::now());

        store
            .upsert_items(&[
                CatalogItem::new(1, "Complete"),
                CatalogItem::new(2, "Partial"),
                CatalogItem::new(3, "Empty"),
            ])
            .await
            .unwrap();

        let complete: Vec<_> = (0..10)
            .map(|d| bucket(1, newest - Duration::days(d), res, 100))
            .collect();
        store.insert_buckets(&complete).await.unwrap();
        store.insert_buckets(&[bucket(2, newest, res, 100)]).await.unwrap();

        let gaps = store.items_with_gaps(res, retention, 10).await.unwrap();
        assert_eq!(gaps, vec![2]);

        let needing = store.items_needing_sync(res, retention, 10).await.unwrap();
        assert_eq!(needing, vec![2, 3]);

        let zero = store.items_with_zero_data(res, 10).await.unwrap();
        assert_eq!(zero.len(), 1);
        assert_eq!(zero[0].item_id, 3);
    }

    #[tokio::test]
    async fn test_poll_volume_flag_survives_catalog_refresh() {
        let store = MemoryStore::new();
        store.upsert_items(&[CatalogItem::new(4151, "Abyssal whip")]).await.unwrap();
        assert_eq!(store.set_poll_volume(&[4151, 9999], true).await.unwrap(), 1);

        store.upsert_items(&[CatalogItem::new(4151, "Abyssal whip")]).await.unwrap();
        assert_eq!(store.items_flagged_for_volume_polling().await.unwrap(), vec![4151]);
    }

    #[tokio::test]
    async fn test_freshness_uses_latest_observation() {
        let store = MemoryStore::new();
        assert!(!store.is_data_fresh(Duration::minutes(5)).await.unwrap());

        store
            .insert_observations(&[PriceObservation {
                item_id: 2,
                observed_at: Utc::now(),
                high_price: Some(180),
                high_time: None,
                low_price: Some(175),
                low_time: None,
            }])
            .await
            .unwrap();
        assert!(store.is_data_fresh(Duration::minutes(5)).await.unwrap());
    }
}
