pub mod adapters;
pub mod cli;
pub mod collector;
pub mod config;
pub mod domain;
pub mod error;

pub use adapters::{MemoryStore, PostgresStore, WikiPriceClient};
pub use collector::{
    Backfiller, BackgroundSync, GapFiller, ItemSyncer, PricePoller, PriceRepository, PriceSource,
    RateLimiter, VolumePoller,
};
pub use config::AppConfig;
pub use error::{CollectorError, Result};
