use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How much of the catalog has any data at one resolution
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCoverageStats {
    pub total_items: i64,
    pub items_with_data: i64,
    pub items_with_no_data: i64,
    pub oldest_bucket: Option<DateTime<Utc>>,
    pub newest_bucket: Option<DateTime<Utc>>,
}

impl SyncCoverageStats {
    /// Share of catalog items with at least one bucket, in percent
    pub fn coverage_pct(&self) -> f64 {
        pct(self.items_with_data, self.total_items)
    }

    pub fn missing_pct(&self) -> f64 {
        pct(self.items_with_no_data, self.total_items)
    }
}

/// Histogram of items by share of expected buckets present in the window
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletenessDistribution {
    pub complete_90_plus: i64,
    pub complete_50_to_89: i64,
    pub complete_10_to_49: i64,
    pub complete_lt_10: i64,
    pub complete_zero: i64,
}

impl CompletenessDistribution {
    /// Place one item into its histogram slot
    pub fn record(&mut self, actual: i64, expected: i64) {
        if actual <= 0 {
            self.complete_zero += 1;
            return;
        }
        let ratio = if expected > 0 {
            actual as f64 / expected as f64 * 100.0
        } else {
            100.0
        };
        if ratio >= 90.0 {
            self.complete_90_plus += 1;
        } else if ratio >= 50.0 {
            self.complete_50_to_89 += 1;
        } else if ratio >= 10.0 {
            self.complete_10_to_49 += 1;
        } else {
            self.complete_lt_10 += 1;
        }
    }

    pub fn max_count(&self) -> i64 {
        [
            self.complete_90_plus,
            self.complete_50_to_89,
            self.complete_10_to_49,
            self.complete_lt_10,
            self.complete_zero,
        ]
        .into_iter()
        .max()
        .unwrap_or(0)
    }

    /// Labelled rows in display order
    pub fn rows(&self) -> [(&'static str, i64); 5] {
        [
            ("90%+ complete", self.complete_90_plus),
            ("50-89%", self.complete_50_to_89),
            ("10-49%", self.complete_10_to_49),
            ("<10%", self.complete_lt_10),
            ("0% (no data)", self.complete_zero),
        ]
    }
}

/// Catalog item with no buckets at a resolution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZeroDataItem {
    pub item_id: i32,
    pub name: String,
}

/// Number of buckets a fully covered item has between `start` and `now`
pub fn expected_buckets(start: DateTime<Utc>, now: DateTime<Utc>, step_secs: i64) -> i64 {
    if step_secs <= 0 || now <= start {
        return 0;
    }
    (now - start).num_seconds() / step_secs
}

/// Threshold below which an item counts as incomplete (90% of expected)
pub fn incomplete_threshold(expected: i64) -> f64 {
    expected as f64 * 0.9
}

fn pct(part: i64, total: i64) -> f64 {
    if total > 0 {
        part as f64 / total as f64 * 100.0
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_completeness_record_slots() {
        let mut dist = CompletenessDistribution::default();
        dist.record(0, 100);
        dist.record(95, 100);
        dist.record(60, 100);
        dist.record(20, 100);
        dist.record(5, 100);
        dist.record(90, 100);

        assert_eq!(dist.complete_zero, 1);
        assert_eq!(dist.complete_90_plus, 2);
        assert_eq!(dist.complete_50_to_89, 1);
        assert_eq!(dist.complete_10_to_49, 1);
        assert_eq!(dist.complete_lt_10, 1);
        assert_eq!(dist.max_count(), 2);
    }

    #[test]
    fn test_expected_buckets() {
        let now = Utc::now();
        assert_eq!(expected_buckets(now - Duration::hours(1), now, 300), 12);
        assert_eq!(expected_buckets(now, now, 300), 0);
    }

    #[test]
    fn test_coverage_pct_handles_empty_catalog() {
        let stats = SyncCoverageStats::default();
        assert_eq!(stats.coverage_pct(), 0.0);
    }
}
