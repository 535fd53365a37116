use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder, Row};
use std::collections::HashSet;
use tracing::{debug, info, instrument};

use crate::collector::repository::PriceRepository;
use crate::domain::{
    expected_buckets, group_for_upsert, incomplete_threshold, CatalogItem,
    CompletenessDistribution, PriceBucket, PriceObservation, Resolution, SyncCoverageStats,
    ZeroDataItem,
};
use crate::error::Result;

/// Rows per multi-row INSERT; keeps bind parameters under the protocol limit
const INSERT_CHUNK: usize = 5_000;
const ITEM_CHUNK: usize = 1_000;

/// PostgreSQL storage adapter
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new PostgreSQL store
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .connect(database_url)
            .await?;

        info!(max_connections, min_connections, "Connected to PostgreSQL");
        Ok(Self { pool })
    }

    /// Create a PostgreSQL store from an existing connection pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    /// Get the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn upsert_bucket_rows(
        &self,
        resolution: Resolution,
        rows: &[PriceBucket],
    ) -> Result<u64> {
        let table = resolution.table();
        let mut written = 0u64;

        for chunk in rows.chunks(INSERT_CHUNK) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                "INSERT INTO {} (item_id, bucket_start, avg_high_price, high_price_volume, \
                 avg_low_price, low_price_volume, source) ",
                table
            ));

            qb.push_values(chunk.iter(), |mut b, row| {
                b.push_bind(row.item_id)
                    .push_bind(row.bucket_start)
                    .push_bind(row.avg_high_price)
                    .push_bind(row.high_price_volume)
                    .push_bind(row.avg_low_price)
                    .push_bind(row.low_price_volume)
                    .push_bind(&row.source);
            });

            // Feed rows always win; derived rows never replace feed rows
            qb.push(format!(
                r#"
                ON CONFLICT (item_id, bucket_start) DO UPDATE SET
                    avg_high_price = EXCLUDED.avg_high_price,
                    high_price_volume = EXCLUDED.high_price_volume,
                    avg_low_price = EXCLUDED.avg_low_price,
                    low_price_volume = EXCLUDED.low_price_volume,
                    source = EXCLUDED.source,
                    ingested_at = NOW()
                WHERE {table}.source <> 'api' OR EXCLUDED.source = 'api'
                "#,
                table = table
            ));

            let result = qb.build().execute(&self.pool).await?;
            written += result.rows_affected();
        }

        Ok(written)
    }

    /// Per-item bucket counts since `since`, for every catalog item
    async fn catalog_bucket_counts(
        &self,
        resolution: Resolution,
        since: DateTime<Utc>,
    ) -> Result<Vec<(i32, i64)>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT i.item_id, COALESCE(b.actual, 0) AS actual
            FROM items i
            LEFT JOIN (
                SELECT item_id, COUNT(*) AS actual
                FROM {}
                WHERE bucket_start > $1
                GROUP BY item_id
            ) b ON b.item_id = i.item_id
            ORDER BY i.item_id
            "#,
            resolution.table()
        ))
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| (row.get("item_id"), row.get("actual")))
            .collect())
    }
}

#[async_trait]
impl PriceRepository for PostgresStore {
    // ==================== Writes ====================

    #[instrument(skip(self, batch), fields(rows = batch.len()))]
    async fn insert_observations(&self, batch: &[PriceObservation]) -> Result<u64> {
        let mut written = 0u64;

        for chunk in batch.chunks(INSERT_CHUNK) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                r#"
                INSERT INTO price_observations (
                    item_id,
                    observed_at,
                    high_price,
                    high_time,
                    low_price,
                    low_time
                )
                "#,
            );

            qb.push_values(chunk.iter(), |mut b, obs| {
                b.push_bind(obs.item_id)
                    .push_bind(obs.observed_at)
                    .push_bind(obs.high_price)
                    .push_bind(obs.high_time)
                    .push_bind(obs.low_price)
                    .push_bind(obs.low_time);
            });

            let result = qb.build().execute(&self.pool).await?;
            written += result.rows_affected();
        }

        debug!(written, "Inserted price observations");
        Ok(written)
    }

    #[instrument(skip(self, batch), fields(rows = batch.len()))]
    async fn insert_buckets(&self, batch: &[PriceBucket]) -> Result<u64> {
        let mut written = 0u64;
        for (resolution, rows) in group_for_upsert(batch) {
            written += self.upsert_bucket_rows(resolution, &rows).await?;
        }
        Ok(written)
    }

    #[instrument(skip(self, items), fields(items = items.len()))]
    async fn upsert_items(&self, items: &[CatalogItem]) -> Result<u64> {
        let mut affected = 0u64;

        for chunk in items.chunks(ITEM_CHUNK) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                r#"
                INSERT INTO items (
                    item_id, name, examine, members, buy_limit,
                    high_alch, low_alch, ge_value, icon, updated_at
                )
                "#,
            );

            qb.push_values(chunk.iter(), |mut b, item| {
                b.push_bind(item.id)
                    .push_bind(&item.name)
                    .push_bind(&item.examine)
                    .push_bind(item.members)
                    .push_bind(item.buy_limit_opt())
                    .push_bind(item.high_alch_opt())
                    .push_bind(item.low_alch_opt())
                    .push_bind(item.value_opt())
                    .push_bind(&item.icon)
                    .push("NOW()");
            });

            qb.push(
                r#"
                ON CONFLICT (item_id) DO UPDATE SET
                    name = EXCLUDED.name,
                    examine = EXCLUDED.examine,
                    members = EXCLUDED.members,
                    buy_limit = EXCLUDED.buy_limit,
                    high_alch = EXCLUDED.high_alch,
                    low_alch = EXCLUDED.low_alch,
                    ge_value = EXCLUDED.ge_value,
                    icon = EXCLUDED.icon,
                    updated_at = NOW()
                "#,
            );

            let result = qb.build().execute(&self.pool).await?;
            affected += result.rows_affected();
        }

        Ok(affected)
    }

    #[instrument(skip(self))]
    async fn set_poll_volume(&self, item_ids: &[i32], poll_volume: bool) -> Result<u64> {
        if item_ids.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query(
            r#"
            UPDATE items SET poll_volume = $1, updated_at = NOW()
            WHERE item_id = ANY($2)
            "#,
        )
        .bind(poll_volume)
        .bind(item_ids)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    // ==================== Discovery ====================

    #[instrument(skip(self))]
    async fn missing_or_incomplete_timestamps(
        &self,
        resolution: Resolution,
        retention: Duration,
        min_items: usize,
        limit: usize,
    ) -> Result<Vec<DateTime<Utc>>> {
        let expected = resolution.expected_bucket_starts(retention, Utc::now());
        let (Some(newest), Some(oldest)) = (expected.first().copied(), expected.last().copied())
        else {
            return Ok(Vec::new());
        };

        let timestamps: Vec<DateTime<Utc>> = sqlx::query_scalar(&format!(
            r#"
            SELECT e.bucket_start
            FROM UNNEST($1::timestamptz[]) AS e(bucket_start)
            LEFT JOIN (
                SELECT bucket_start, COUNT(*) AS n
                FROM {}
                WHERE bucket_start >= $2 AND bucket_start <= $3
                GROUP BY bucket_start
            ) c ON c.bucket_start = e.bucket_start
            WHERE COALESCE(c.n, 0) = 0 OR c.n < $4
            ORDER BY e.bucket_start DESC
            LIMIT $5
            "#,
            resolution.table()
        ))
        .bind(&expected)
        .bind(oldest)
        .bind(newest)
        .bind(min_items as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(timestamps)
    }

    #[instrument(skip(self))]
    async fn items_needing_sync(
        &self,
        resolution: Resolution,
        retention: Duration,
        limit: usize,
    ) -> Result<Vec<i32>> {
        let now = Utc::now();
        let since = resolution.window_start(retention, now);
        let threshold = incomplete_threshold(expected_buckets(since, now, resolution.step_secs()));

        let items: Vec<i32> = sqlx::query_scalar(&format!(
            r#"
            WITH bucket_counts AS (
                SELECT item_id, COUNT(*) AS actual
                FROM {}
                WHERE bucket_start > $1
                GROUP BY item_id
            ),
            recent_activity AS (
                SELECT item_id, MAX(observed_at) AS last_seen
                FROM price_observations
                WHERE observed_at > $1
                GROUP BY item_id
            )
            SELECT i.item_id
            FROM items i
            LEFT JOIN bucket_counts b ON b.item_id = i.item_id
            LEFT JOIN recent_activity r ON r.item_id = i.item_id
            WHERE COALESCE(b.actual, 0) < $2::float8
            ORDER BY r.last_seen DESC NULLS LAST, i.item_id
            LIMIT $3
            "#,
            resolution.table()
        ))
        .bind(since)
        .bind(threshold)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(items)
    }

    #[instrument(skip(self))]
    async fn items_with_gaps(
        &self,
        resolution: Resolution,
        retention: Duration,
        limit: usize,
    ) -> Result<Vec<i32>> {
        let now = Utc::now();
        let since = resolution.window_start(retention, now);
        let threshold = incomplete_threshold(expected_buckets(since, now, resolution.step_secs()));

        let items: Vec<i32> = sqlx::query_scalar(&format!(
            r#"
            WITH bucket_counts AS (
                SELECT item_id, COUNT(*) AS actual
                FROM {}
                WHERE bucket_start > $1
                GROUP BY item_id
            ),
            recent_activity AS (
                SELECT item_id, MAX(observed_at) AS last_seen
                FROM price_observations
                WHERE observed_at > $1
                GROUP BY item_id
            )
            SELECT b.item_id
            FROM bucket_counts b
            LEFT JOIN recent_activity r ON r.item_id = b.item_id
            WHERE b.actual < $2::float8
            ORDER BY r.last_seen DESC NULLS LAST, b.item_id
            LIMIT $3
            "#,
            resolution.table()
        ))
        .bind(since)
        .bind(threshold)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(items)
    }

    async fn distinct_observed_item_ids(&self) -> Result<Vec<i32>> {
        let items: Vec<i32> = sqlx::query_scalar(
            "SELECT DISTINCT item_id FROM price_observations ORDER BY item_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(items)
    }

    async fn backfilled_items(&self, resolution: Resolution) -> Result<HashSet<i32>> {
        let items: Vec<i32> = sqlx::query_scalar(&format!(
            "SELECT DISTINCT item_id FROM {}",
            resolution.table()
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(items.into_iter().collect())
    }

    async fn items_flagged_for_volume_polling(&self) -> Result<Vec<i32>> {
        let items: Vec<i32> = sqlx::query_scalar(
            "SELECT item_id FROM items WHERE poll_volume = TRUE ORDER BY item_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(items)
    }

    // ==================== Status ====================

    async fn item_count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM items")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn observation_count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM price_observations")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn latest_observation_time(&self) -> Result<Option<DateTime<Utc>>> {
        let latest: Option<DateTime<Utc>> =
            sqlx::query_scalar("SELECT MAX(observed_at) FROM price_observations")
                .fetch_one(&self.pool)
                .await?;
        Ok(latest)
    }

    async fn bucket_count(&self, resolution: Resolution) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", resolution.table()))
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    #[instrument(skip(self))]
    async fn coverage_stats(&self, resolution: Resolution) -> Result<SyncCoverageStats> {
        let row = sqlx::query(&format!(
            r#"
            SELECT
                (SELECT COUNT(*) FROM items) AS total_items,
                (SELECT COUNT(*) FROM items i
                    WHERE EXISTS (SELECT 1 FROM {table} b WHERE b.item_id = i.item_id)
                ) AS items_with_data,
                (SELECT MIN(bucket_start) FROM {table}) AS oldest_bucket,
                (SELECT MAX(bucket_start) FROM {table}) AS newest_bucket
            "#,
            table = resolution.table()
        ))
        .fetch_one(&self.pool)
        .await?;

        let total_items: i64 = row.get("total_items");
        let items_with_data: i64 = row.get("items_with_data");
        Ok(SyncCoverageStats {
            total_items,
            items_with_data,
            items_with_no_data: total_items - items_with_data,
            oldest_bucket: row.get("oldest_bucket"),
            newest_bucket: row.get("newest_bucket"),
        })
    }

    #[instrument(skip(self))]
    async fn completeness_distribution(
        &self,
        resolution: Resolution,
        retention: Duration,
    ) -> Result<CompletenessDistribution> {
        let now = Utc::now();
        let since = resolution.window_start(retention, now);
        let expected = expected_buckets(since, now, resolution.step_secs());

        let mut dist = CompletenessDistribution::default();
        for (_, actual) in self.catalog_bucket_counts(resolution, since).await? {
            dist.record(actual, expected);
        }
        Ok(dist)
    }

    async fn items_with_zero_data(
        &self,
        resolution: Resolution,
        limit: usize,
    ) -> Result<Vec<ZeroDataItem>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT i.item_id, i.name
            FROM items i
            WHERE NOT EXISTS (SELECT 1 FROM {} b WHERE b.item_id = i.item_id)
            ORDER BY i.item_id
            LIMIT $1
            "#,
            resolution.table()
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| ZeroDataItem {
                item_id: row.get("item_id"),
                name: row.get("name"),
            })
            .collect())
    }
}
