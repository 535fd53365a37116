//! Upstream price feed seam.
//!
//! The collector services only see [`PriceSource`]; the wiki HTTP client and
//! the test doubles both implement it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::domain::{CatalogItem, Resolution};
use crate::error::Result;

/// Latest insta-buy/insta-sell snapshot, keyed by item id as a string
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LatestPricesResponse {
    #[serde(default)]
    pub data: HashMap<String, LatestPrice>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatestPrice {
    pub high: Option<i64>,
    pub high_time: Option<i64>,
    pub low: Option<i64>,
    pub low_time: Option<i64>,
}

/// Per-item historical series at one resolution
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimeseriesResponse {
    #[serde(default)]
    pub data: Vec<TimeseriesPoint>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeseriesPoint {
    pub timestamp: i64,
    pub avg_high_price: Option<i64>,
    pub avg_low_price: Option<i64>,
    pub high_price_volume: Option<i64>,
    pub low_price_volume: Option<i64>,
}

/// All-items snapshot for one bucket.
///
/// `timestamp` is the canonical bucket start for every entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BulkPriceResponse {
    #[serde(default)]
    pub data: HashMap<String, BulkPricePoint>,
    #[serde(default)]
    pub timestamp: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkPricePoint {
    pub avg_high_price: Option<i64>,
    pub high_price_volume: Option<i64>,
    pub avg_low_price: Option<i64>,
    pub low_price_volume: Option<i64>,
}

/// Read-only access to the upstream price feed
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PriceSource: Send + Sync {
    /// Full item catalog
    async fn item_catalog(&self) -> Result<Vec<CatalogItem>>;

    /// Current snapshot for every item, or for one item when given
    async fn latest_prices(&self, item_id: Option<i32>) -> Result<LatestPricesResponse>;

    /// Up to 365 points of one item's history at a resolution
    async fn timeseries(&self, item_id: i32, resolution: Resolution)
        -> Result<TimeseriesResponse>;

    /// Every item's aggregate for one bucket; the latest bucket when no timestamp
    async fn bulk_prices(
        &self,
        resolution: Resolution,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<BulkPriceResponse>;
}
