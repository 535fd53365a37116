//! Catalog refresh from the upstream mapping endpoint.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::lifecycle::cancellable;
use super::repository::PriceRepository;
use super::source::PriceSource;
use crate::error::Result;

const SERVICE: &str = "item_syncer";

#[derive(Debug, Clone)]
pub struct ItemSyncerConfig {
    pub sync_on_start: bool,
    /// Zero disables periodic refresh
    pub sync_interval: Duration,
}

impl Default for ItemSyncerConfig {
    fn default() -> Self {
        Self {
            sync_on_start: true,
            sync_interval: Duration::from_secs(24 * 60 * 60),
        }
    }
}

pub struct ItemSyncer {
    source: Arc<dyn PriceSource>,
    repo: Arc<dyn PriceRepository>,
    config: ItemSyncerConfig,
}

impl ItemSyncer {
    pub fn new(
        source: Arc<dyn PriceSource>,
        repo: Arc<dyn PriceRepository>,
        config: ItemSyncerConfig,
    ) -> Self {
        Self { source, repo, config }
    }

    /// Fetch the catalog and upsert it. Idempotent.
    pub async fn sync(&self, cancel: &CancellationToken) -> Result<u64> {
        info!(service = SERVICE, "starting item sync");

        let items = cancellable(cancel, self.source.item_catalog())
            .await
            .map_err(|e| {
                error!(service = SERVICE, error = %e, "failed to fetch item catalog");
                e
            })?;
        debug!(service = SERVICE, items_fetched = items.len(), "fetched item catalog");

        let affected = cancellable(cancel, self.repo.upsert_items(&items))
            .await
            .map_err(|e| {
                error!(service = SERVICE, error = %e, "failed to upsert items");
                e
            })?;

        info!(
            service = SERVICE,
            items_fetched = items.len(),
            rows_affected = affected,
            "item sync completed"
        );
        Ok(affected)
    }

    /// Initial sync when `sync_on_start` is set
    pub async fn start(&self, cancel: &CancellationToken) -> Result<()> {
        if self.config.sync_on_start {
            self.sync(cancel).await?;
        }
        Ok(())
    }

    /// Re-sync every `sync_interval` until cancelled. The first sync happens
    /// one interval after the call; failures are logged and retried next tick.
    pub async fn run_periodic(&self, cancel: CancellationToken) {
        if self.config.sync_interval.is_zero() {
            return;
        }

        let period = self.config.sync_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            match self.sync(&cancel).await {
                Ok(_) => {}
                Err(e) if e.is_cancelled() => return,
                Err(e) => error!(service = SERVICE, error = %e, "periodic sync failed"),
            }
        }
    }
}
