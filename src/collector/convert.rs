//! Feed responses to canonical rows.

use chrono::{DateTime, Utc};
use tracing::warn;

use super::source::{BulkPriceResponse, LatestPricesResponse, TimeseriesResponse};
use crate::domain::{PriceBucket, PriceObservation, Resolution, SOURCE_API};

/// Build observations from a live snapshot, all stamped `observed_at`.
/// Keys that are not item ids are skipped with a warning.
pub fn observations_from_latest(
    resp: &LatestPricesResponse,
    observed_at: DateTime<Utc>,
) -> Vec<PriceObservation> {
    let mut observations: Vec<PriceObservation> = resp
        .data
        .iter()
        .filter_map(|(key, price)| {
            let item_id = match key.parse::<i32>() {
                Ok(id) => id,
                Err(e) => {
                    warn!(item_id = %key, error = %e, "invalid item id, skipping");
                    return None;
                }
            };

            Some(PriceObservation {
                item_id,
                observed_at,
                high_price: price.high,
                high_time: price.high_time.and_then(unix_time),
                low_price: price.low,
                low_time: price.low_time.and_then(unix_time),
            })
        })
        .collect();

    observations.sort_by_key(|o| o.item_id);
    observations
}

/// Build one bucket per item from an all-items snapshot.
///
/// The response timestamp is the bucket start for every row. Non-positive or
/// malformed ids and rows without prices are dropped.
pub fn buckets_from_bulk(resp: &BulkPriceResponse, resolution: Resolution) -> Vec<PriceBucket> {
    let Some(bucket_start) = unix_time(resp.timestamp) else {
        warn!(timestamp = resp.timestamp, "bulk response timestamp out of range");
        return Vec::new();
    };

    let mut buckets: Vec<PriceBucket> = resp
        .data
        .iter()
        .filter_map(|(key, point)| {
            let item_id = key.parse::<i32>().ok().filter(|id| *id > 0)?;
            let bucket = PriceBucket {
                item_id,
                bucket_start,
                resolution,
                avg_high_price: point.avg_high_price,
                high_price_volume: point.high_price_volume,
                avg_low_price: point.avg_low_price,
                low_price_volume: point.low_price_volume,
                source: SOURCE_API.to_string(),
            };
            bucket.has_prices().then_some(bucket)
        })
        .collect();

    buckets.sort_by_key(|b| b.item_id);
    buckets
}

/// Rows built from one item's series, plus how many fell before `cutoff`
#[derive(Debug, Default)]
pub struct SeriesBuckets {
    pub buckets: Vec<PriceBucket>,
    pub outside_retention: usize,
}

/// Build buckets from one item's series, dropping points older than `cutoff`
pub fn buckets_from_series(
    item_id: i32,
    resolution: Resolution,
    resp: &TimeseriesResponse,
    cutoff: Option<DateTime<Utc>>,
) -> SeriesBuckets {
    let mut out = SeriesBuckets::default();

    for point in &resp.data {
        let Some(bucket_start) = unix_time(point.timestamp) else {
            continue;
        };
        if cutoff.is_some_and(|c| bucket_start < c) {
            out.outside_retention += 1;
            continue;
        }
        if point.avg_high_price.is_none() && point.avg_low_price.is_none() {
            continue;
        }

        out.buckets.push(PriceBucket {
            item_id,
            bucket_start,
            resolution,
            avg_high_price: point.avg_high_price,
            high_price_volume: point.high_price_volume,
            avg_low_price: point.avg_low_price,
            low_price_volume: point.low_price_volume,
            source: SOURCE_API.to_string(),
        });
    }

    out
}

fn unix_time(secs: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
}
