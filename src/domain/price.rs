use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use super::resolution::Resolution;

/// Source tag for rows taken straight from the upstream feed
pub const SOURCE_API: &str = "api";

/// One point-in-time reading of an item's instant buy/sell prices.
///
/// `high_price` is the insta-buy price, `low_price` the insta-sell price.
/// Observations are append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceObservation {
    pub item_id: i32,
    pub observed_at: DateTime<Utc>,
    pub high_price: Option<i64>,
    pub high_time: Option<DateTime<Utc>>,
    pub low_price: Option<i64>,
    pub low_time: Option<DateTime<Utc>>,
}

/// Aggregated prices and volumes for one item over one bucket window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceBucket {
    pub item_id: i32,
    pub bucket_start: DateTime<Utc>,
    pub resolution: Resolution,
    pub avg_high_price: Option<i64>,
    pub high_price_volume: Option<i64>,
    pub avg_low_price: Option<i64>,
    pub low_price_volume: Option<i64>,
    pub source: String,
}

impl PriceBucket {
    /// Rows with neither price carry nothing worth storing
    pub fn has_prices(&self) -> bool {
        self.avg_high_price.is_some() || self.avg_low_price.is_some()
    }

    /// Storage key; at most one row exists per key
    pub fn key(&self) -> (Resolution, i32, DateTime<Utc>) {
        (self.resolution, self.item_id, self.bucket_start)
    }

    pub fn is_from_api(&self) -> bool {
        self.source == SOURCE_API
    }

    /// Whether this row may replace `existing` on upsert.
    /// Feed rows always win; derived rows never overwrite feed rows.
    pub fn supersedes(&self, existing: &PriceBucket) -> bool {
        !existing.is_from_api() || self.is_from_api()
    }
}

/// Split a batch per resolution and collapse duplicate keys, last one wins.
///
/// A single upsert statement may not touch the same row twice, so every
/// store runs batches through this first. Row order follows first appearance.
pub fn group_for_upsert(batch: &[PriceBucket]) -> BTreeMap<Resolution, Vec<PriceBucket>> {
    let mut grouped: BTreeMap<Resolution, Vec<PriceBucket>> = BTreeMap::new();
    let mut positions: HashMap<(Resolution, i32, DateTime<Utc>), usize> = HashMap::new();

    for bucket in batch.iter().filter(|b| b.has_prices()) {
        let rows = grouped.entry(bucket.resolution).or_default();
        match positions.get(&bucket.key()) {
            Some(&idx) => rows[idx] = bucket.clone(),
            None => {
                positions.insert(bucket.key(), rows.len());
                rows.push(bucket.clone());
            }
        }
    }
    grouped
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn bucket(item_id: i32, high: Option<i64>, low: Option<i64>) -> PriceBucket {
        PriceBucket {
            item_id,
            bucket_start: Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap(),
            resolution: Resolution::OneHour,
            avg_high_price: high,
            high_price_volume: None,
            avg_low_price: low,
            low_price_volume: None,
            source: SOURCE_API.to_string(),
        }
    }

    #[test]
    fn test_group_for_upsert_last_duplicate_wins() {
        let batch = vec![
            bucket(2, Some(100), None),
            bucket(6, Some(50), Some(45)),
            bucket(2, Some(120), None),
        ];
        let grouped = group_for_upsert(&batch);
        let rows = &grouped[&Resolution::OneHour];

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].item_id, 2);
        assert_eq!(rows[0].avg_high_price, Some(120));
        assert_eq!(rows[1].item_id, 6);
    }

    #[test]
    fn test_group_for_upsert_drops_priceless_rows() {
        let grouped = group_for_upsert(&[bucket(2, None, None)]);
        assert!(grouped.is_empty());
    }

    #[test]
    fn test_feed_rows_are_not_overwritten_by_derived_rows() {
        let api = bucket(2, Some(100), None);
        let mut derived = bucket(2, Some(90), None);
        derived.source = "computed".to_string();

        assert!(!derived.supersedes(&api));
        assert!(api.supersedes(&derived));
        assert!(api.supersedes(&api.clone()));
    }
}
