use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::CollectorError;

/// Number of points the upstream timeseries endpoint returns per request.
/// Also bounds how far back an unlimited-retention resolution is scanned.
pub const UPSTREAM_SERIES_POINTS: i64 = 365;

/// Bucket window size of an aggregated price row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Resolution {
    #[serde(rename = "5m")]
    FiveMinutes,
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "24h")]
    OneDay,
}

impl Resolution {
    /// All resolutions, finest first
    pub const ALL: [Resolution; 3] = [
        Resolution::FiveMinutes,
        Resolution::OneHour,
        Resolution::OneDay,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::FiveMinutes => "5m",
            Resolution::OneHour => "1h",
            Resolution::OneDay => "24h",
        }
    }

    /// Width of one bucket
    pub fn step(&self) -> Duration {
        Duration::seconds(self.step_secs())
    }

    pub fn step_secs(&self) -> i64 {
        match self {
            Resolution::FiveMinutes => 300,
            Resolution::OneHour => 3_600,
            Resolution::OneDay => 86_400,
        }
    }

    /// Postgres table holding this resolution's buckets
    pub fn table(&self) -> &'static str {
        match self {
            Resolution::FiveMinutes => "price_buckets_5m",
            Resolution::OneHour => "price_buckets_1h",
            Resolution::OneDay => "price_buckets_24h",
        }
    }

    /// Start of the bucket containing `ts`
    pub fn align(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let secs = ts.timestamp();
        let aligned = secs - secs.rem_euclid(self.step_secs());
        DateTime::from_timestamp(aligned, 0).unwrap_or(ts)
    }

    /// Start of the most recent bucket that has fully closed at `now`
    pub fn last_closed_bucket(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.align(now) - self.step()
    }

    /// Oldest instant scanned for missing data under `retention`.
    ///
    /// A zero retention is unlimited and falls back to the span the
    /// upstream series endpoint can still serve.
    pub fn window_start(&self, retention: Duration, now: DateTime<Utc>) -> DateTime<Utc> {
        if retention > Duration::zero() {
            now - retention
        } else {
            now - Duration::seconds(self.step_secs() * UPSTREAM_SERIES_POINTS)
        }
    }

    /// Bucket starts inside `[window_start, last closed bucket]`, newest first
    pub fn expected_bucket_starts(
        &self,
        retention: Duration,
        now: DateTime<Utc>,
    ) -> Vec<DateTime<Utc>> {
        let start = self.window_start(retention, now);
        let mut first = self.align(start);
        if first < start {
            first += self.step();
        }

        let mut out = Vec::new();
        let mut ts = self.last_closed_bucket(now);
        while ts >= first {
            out.push(ts);
            ts -= self.step();
        }
        out
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Resolution {
    type Err = CollectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "5m" => Ok(Resolution::FiveMinutes),
            "1h" => Ok(Resolution::OneHour),
            "24h" => Ok(Resolution::OneDay),
            other => Err(CollectorError::UnknownResolution(other.to_string())),
        }
    }
}

/// Maximum age worth keeping fresh, per resolution.
///
/// A zero duration means the resolution is kept indefinitely. Retention only
/// narrows what gets fetched; stored rows are never deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    five_minutes: Duration,
    one_hour: Duration,
    one_day: Duration,
}

impl RetentionPolicy {
    /// 7 days of 5m buckets, a year of 1h buckets, 24h buckets forever
    pub fn standard() -> Self {
        Self::from_days(7, 365, 0)
    }

    pub fn from_days(five_minutes: u32, one_hour: u32, one_day: u32) -> Self {
        Self {
            five_minutes: Duration::days(five_minutes as i64),
            one_hour: Duration::days(one_hour as i64),
            one_day: Duration::days(one_day as i64),
        }
    }

    /// Raw retention for a resolution; zero means unlimited
    pub fn retention(&self, resolution: Resolution) -> Duration {
        match resolution {
            Resolution::FiveMinutes => self.five_minutes,
            Resolution::OneHour => self.one_hour,
            Resolution::OneDay => self.one_day,
        }
    }

    /// Retention window, or `None` when unlimited
    pub fn window(&self, resolution: Resolution) -> Option<Duration> {
        let retention = self.retention(resolution);
        (retention > Duration::zero()).then_some(retention)
    }

    pub fn is_unlimited(&self, resolution: Resolution) -> bool {
        self.window(resolution).is_none()
    }

    /// Oldest timestamp still inside the window
    pub fn cutoff(&self, resolution: Resolution, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.window(resolution).map(|w| now - w)
    }

    /// Whether a bucket starting at `ts` is still worth keeping fresh
    pub fn retains(&self, resolution: Resolution, ts: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match self.cutoff(resolution, now) {
            Some(cutoff) => ts >= cutoff,
            None => true,
        }
    }

    /// Start of the range scanned for missing data
    pub fn scan_start(&self, resolution: Resolution, now: DateTime<Utc>) -> DateTime<Utc> {
        resolution.window_start(self.retention(resolution), now)
    }

    /// Retention in whole days, for logging
    pub fn days(&self, resolution: Resolution) -> i64 {
        self.retention(resolution).num_days()
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::standard()
    }
}
