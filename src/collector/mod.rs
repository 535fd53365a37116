//! Collection services for the Grand Exchange price feed
//!
//! A live poller records the all-items snapshot every minute, a volume poller
//! keeps flagged items' 5m series fresh, and background sync, gap filling and
//! backfill repair historical buckets through one shared rate limiter.

pub mod backfiller;
pub mod background_sync;
mod convert;
pub mod gap_filler;
pub mod item_syncer;
pub mod lifecycle;
pub mod price_poller;
pub mod rate_limiter;
pub mod repository;
pub mod source;
pub mod volume_poller;

pub use backfiller::{BackfillProgress, Backfiller, BackfillerConfig, RunOutcome};
pub use background_sync::{
    BackgroundSync, BackgroundSyncConfig, BackgroundSyncProgress, CycleTally, DiscoveryStrategy,
    SyncTarget,
};
pub use convert::{buckets_from_bulk, buckets_from_series, observations_from_latest, SeriesBuckets};
pub use gap_filler::{GapFillProgress, GapFiller, GapFillerConfig};
pub use item_syncer::{ItemSyncer, ItemSyncerConfig};
pub use lifecycle::ServiceState;
pub use price_poller::{backoff_delay, PollerConfig, PollerStats, PricePoller};
pub use rate_limiter::RateLimiter;
pub use repository::PriceRepository;
pub use source::PriceSource;
pub use volume_poller::{VolumePoller, VolumePollerConfig, VolumePollerProgress};
