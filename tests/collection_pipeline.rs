use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ge_collector::collector::source::{
    BulkPricePoint, BulkPriceResponse, LatestPrice, LatestPricesResponse, TimeseriesPoint,
    TimeseriesResponse,
};
use ge_collector::collector::{
    buckets_from_series, Backfiller, BackfillerConfig, BackgroundSync, BackgroundSyncConfig,
    DiscoveryStrategy, ItemSyncer, ItemSyncerConfig, PollerConfig, PricePoller, PriceRepository,
    PriceSource, RateLimiter, RunOutcome, VolumePoller, VolumePollerConfig,
};
use ge_collector::domain::{CatalogItem, PriceObservation, Resolution, RetentionPolicy};
use ge_collector::{MemoryStore, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Deterministic feed serving the same three items for every request
#[derive(Default)]
struct StaticFeed {
    timeseries_calls: Mutex<Vec<(i32, Resolution)>>,
    bulk_calls: Mutex<Vec<(Resolution, Option<DateTime<Utc>>)>>,
}

const ITEMS: [i32; 3] = [2, 6, 4151];

impl StaticFeed {
    fn timeseries_calls(&self) -> Vec<(i32, Resolution)> {
        self.timeseries_calls.lock().unwrap().clone()
    }

    fn bulk_calls(&self) -> Vec<(Resolution, Option<DateTime<Utc>>)> {
        self.bulk_calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl PriceSource for StaticFeed {
    async fn item_catalog(&self) -> Result<Vec<CatalogItem>> {
        Ok(vec![
            CatalogItem::new(2, "Cannonball"),
            CatalogItem::new(6, "Cannon base"),
            CatalogItem::new(4151, "Abyssal whip"),
        ])
    }

    async fn latest_prices(&self, _item_id: Option<i32>) -> Result<LatestPricesResponse> {
        let data = ITEMS
            .iter()
            .map(|id| {
                (
                    id.to_string(),
                    LatestPrice {
                        high: Some(*id as i64 * 10),
                        high_time: Some(1_710_000_000),
                        low: Some(*id as i64 * 9),
                        low_time: Some(1_710_000_000),
                    },
                )
            })
            .collect();
        Ok(LatestPricesResponse { data })
    }

    async fn timeseries(&self, item_id: i32, resolution: Resolution) -> Result<TimeseriesResponse> {
        self.timeseries_calls.lock().unwrap().push((item_id, resolution));
        let latest = resolution.last_closed_bucket(Utc::now());
        let data = (0..3)
            .map(|i| TimeseriesPoint {
                timestamp: (latest - resolution.step() * i).timestamp(),
                avg_high_price: Some(100),
                high_price_volume: Some(5),
                avg_low_price: Some(95),
                low_price_volume: Some(7),
            })
            .collect();
        Ok(TimeseriesResponse { data })
    }

    async fn bulk_prices(
        &self,
        resolution: Resolution,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<BulkPriceResponse> {
        self.bulk_calls.lock().unwrap().push((resolution, timestamp));
        let bucket = timestamp.unwrap_or_else(|| resolution.last_closed_bucket(Utc::now()));
        let data: HashMap<String, BulkPricePoint> = ITEMS
            .iter()
            .map(|id| {
                (
                    id.to_string(),
                    BulkPricePoint {
                        avg_high_price: Some(*id as i64),
                        high_price_volume: Some(1),
                        avg_low_price: None,
                        low_price_volume: None,
                    },
                )
            })
            .collect();
        Ok(BulkPriceResponse {
            data,
            timestamp: bucket.timestamp(),
        })
    }
}

fn observation(item_id: i32) -> PriceObservation {
    PriceObservation {
        item_id,
        observed_at: Utc::now(),
        high_price: Some(100),
        high_time: None,
        low_price: Some(90),
        low_time: None,
    }
}

/// A missing hourly timestamp is filled from one bulk request and stops
/// being reported as missing.
#[tokio::test]
async fn gap_repair_fills_missing_timestamp() {
    let feed = Arc::new(StaticFeed::default());
    let store = Arc::new(MemoryStore::new());
    let retention = RetentionPolicy::standard();
    let resolution = Resolution::OneHour;

    let sync = BackgroundSync::new(
        feed.clone(),
        store.clone(),
        Arc::new(RateLimiter::new(Duration::from_millis(1))),
        retention,
        BackgroundSyncConfig {
            resolutions: vec![resolution],
            run_interval: Duration::from_secs(300),
            targets_per_cycle: 1,
            min_item_threshold: 3,
            strategies: vec![DiscoveryStrategy::Timestamps],
        },
    );

    let newest = resolution.expected_bucket_starts(retention.retention(resolution), Utc::now())[0];
    let tally = sync.run_cycle(&CancellationToken::new()).await;

    assert_eq!(tally.timestamps_synced, 1);
    assert_eq!(tally.buckets_filled, 3);
    assert_eq!(tally.errors, 0);
    assert_eq!(feed.bulk_calls(), vec![(resolution, Some(newest))]);

    for item_id in ITEMS {
        let bucket = store.bucket(resolution, item_id, newest).await;
        assert!(bucket.is_some(), "item {item_id} should have a bucket at {newest}");
    }

    let still_missing = store
        .missing_or_incomplete_timestamps(resolution, retention.retention(resolution), 3, 10)
        .await
        .unwrap();
    assert!(!still_missing.contains(&newest));
}

/// Items that already have rows at a resolution are not fetched again.
#[tokio::test]
async fn backfill_skips_items_already_backfilled() {
    let feed = Arc::new(StaticFeed::default());
    let store = Arc::new(MemoryStore::new());
    store
        .insert_observations(&[observation(2), observation(6)])
        .await
        .unwrap();

    // Item 2 already has daily history
    let series = feed.timeseries(2, Resolution::OneDay).await.unwrap();
    feed.timeseries_calls.lock().unwrap().clear();
    let rows = buckets_from_series(2, Resolution::OneDay, &series, None);
    store.insert_buckets(&rows.buckets).await.unwrap();

    let backfiller = Backfiller::new(
        feed.clone(),
        store.clone(),
        BackfillerConfig {
            resolutions: vec![Resolution::OneDay],
            item_delay: Duration::from_millis(1),
            batch_size: 100,
        },
    );
    let outcome = backfiller.run(&CancellationToken::new()).await.unwrap();

    assert_eq!(outcome, RunOutcome::Completed);
    assert_eq!(feed.timeseries_calls(), vec![(6, Resolution::OneDay)]);
    let progress = backfiller.progress().await;
    assert_eq!(progress.skipped_items, 1);
    assert_eq!(progress.processed_items, 1);
    assert_eq!(store.bucket_count(Resolution::OneDay).await.unwrap(), 6);
}

/// Catalog sync, live poll and volume polling feed the same store.
#[tokio::test]
async fn catalog_poll_and_volume_flow() {
    let feed = Arc::new(StaticFeed::default());
    let store = Arc::new(MemoryStore::new());
    let cancel = CancellationToken::new();

    let syncer = ItemSyncer::new(feed.clone(), store.clone(), ItemSyncerConfig::default());
    syncer.start(&cancel).await.unwrap();
    assert_eq!(store.item_count().await.unwrap(), 3);

    let poller = PricePoller::new(feed.clone(), store.clone(), PollerConfig::default());
    assert_eq!(poller.poll_once().await.unwrap(), 3);
    assert!(store
        .is_data_fresh(chrono::Duration::minutes(5))
        .await
        .unwrap());

    store.set_poll_volume(&[4151], true).await.unwrap();
    let volume = VolumePoller::new(
        feed.clone(),
        store.clone(),
        Arc::new(RateLimiter::new(Duration::from_millis(1))),
        RetentionPolicy::standard(),
        VolumePollerConfig::default(),
    );
    volume.poll_cycle(&cancel).await.unwrap();

    assert_eq!(feed.timeseries_calls(), vec![(4151, Resolution::FiveMinutes)]);
    assert_eq!(store.bucket_count(Resolution::FiveMinutes).await.unwrap(), 3);

    let coverage = store.coverage_stats(Resolution::FiveMinutes).await.unwrap();
    assert_eq!(coverage.total_items, 3);
    assert_eq!(coverage.items_with_data, 1);
    assert_eq!(coverage.items_with_no_data, 2);
}
