use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::collector::{
    BackfillerConfig, BackgroundSyncConfig, DiscoveryStrategy, GapFillerConfig, ItemSyncerConfig,
    PollerConfig, VolumePollerConfig,
};
use crate::domain::{Resolution, RetentionPolicy};

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub poller: PollerSettings,
    #[serde(default)]
    pub volume_poller: VolumePollerSettings,
    #[serde(default)]
    pub sync: SyncSettings,
    #[serde(default)]
    pub backfill: BackfillSettings,
    #[serde(default)]
    pub gap_fill: GapFillSettings,
    #[serde(default)]
    pub item_sync: ItemSyncSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    /// Base URL of the real-time prices API
    #[serde(default = "default_feed_url")]
    pub base_url: String,
    /// Identifying User-Agent; the API rejects anonymous clients
    #[serde(default)]
    pub user_agent: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Minimum gap between rate-limited requests, shared by all services
    #[serde(default = "default_rate_limit_ms")]
    pub rate_limit_ms: u64,
}

fn default_feed_url() -> String {
    crate::adapters::DEFAULT_WIKI_API_BASE.to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_rate_limit_ms() -> u64 {
    100
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            base_url: default_feed_url(),
            user_agent: String::new(),
            timeout_secs: default_timeout_secs(),
            rate_limit_ms: default_rate_limit_ms(),
        }
    }
}

impl FeedConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn rate_limit(&self) -> Duration {
        Duration::from_millis(self.rate_limit_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    #[serde(default)]
    pub url: String,
    /// Maximum connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

fn default_max_connections() -> u32 {
    25
}

fn default_min_connections() -> u32 {
    5
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
        }
    }
}

/// Days to keep fresh per resolution; 0 keeps forever
#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_retention_5m")]
    pub five_minute_days: u32,
    #[serde(default = "default_retention_1h")]
    pub one_hour_days: u32,
    #[serde(default)]
    pub one_day_days: u32,
}

fn default_retention_5m() -> u32 {
    7
}

fn default_retention_1h() -> u32 {
    365
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            five_minute_days: default_retention_5m(),
            one_hour_days: default_retention_1h(),
            one_day_days: 0,
        }
    }
}

impl RetentionConfig {
    pub fn policy(&self) -> RetentionPolicy {
        RetentionPolicy::from_days(self.five_minute_days, self.one_hour_days, self.one_day_days)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PollerSettings {
    #[serde(default = "default_poll_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: u64,
}

fn default_poll_interval_secs() -> u64 {
    60
}

fn default_retry_delay_secs() -> u64 {
    10
}

fn default_max_retries() -> u32 {
    5
}

fn default_backoff_max_secs() -> u64 {
    300
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_poll_interval_secs(),
            retry_delay_secs: default_retry_delay_secs(),
            max_retries: default_max_retries(),
            backoff_max_secs: default_backoff_max_secs(),
        }
    }
}

impl PollerSettings {
    pub fn to_poller_config(&self) -> PollerConfig {
        PollerConfig {
            interval: Duration::from_secs(self.interval_secs),
            retry_delay: Duration::from_secs(self.retry_delay_secs),
            max_retries: self.max_retries,
            backoff_max: Duration::from_secs(self.backoff_max_secs),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct VolumePollerSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_volume_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_volume_interval_secs() -> u64 {
    300
}

impl Default for VolumePollerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_volume_interval_secs(),
            retry_delay_secs: default_retry_delay_secs(),
            max_retries: default_max_retries(),
            backoff_max_secs: default_backoff_max_secs(),
        }
    }
}

impl VolumePollerSettings {
    pub fn to_volume_poller_config(&self) -> VolumePollerConfig {
        VolumePollerConfig {
            poll_interval: Duration::from_secs(self.interval_secs),
            retry_delay: Duration::from_secs(self.retry_delay_secs),
            max_retries: self.max_retries,
            backoff_max: Duration::from_secs(self.backoff_max_secs),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_resolutions")]
    pub resolutions: Vec<Resolution>,
    #[serde(default = "default_sync_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_targets_per_cycle")]
    pub targets_per_cycle: usize,
    #[serde(default = "default_min_item_threshold")]
    pub min_item_threshold: usize,
    #[serde(default = "default_strategies")]
    pub strategies: Vec<DiscoveryStrategy>,
}

fn default_resolutions() -> Vec<Resolution> {
    Resolution::ALL.to_vec()
}

fn default_sync_interval_secs() -> u64 {
    300
}

fn default_targets_per_cycle() -> usize {
    50
}

fn default_min_item_threshold() -> usize {
    100
}

fn default_strategies() -> Vec<DiscoveryStrategy> {
    vec![DiscoveryStrategy::Timestamps]
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            resolutions: default_resolutions(),
            interval_secs: default_sync_interval_secs(),
            targets_per_cycle: default_targets_per_cycle(),
            min_item_threshold: default_min_item_threshold(),
            strategies: default_strategies(),
        }
    }
}

impl SyncSettings {
    pub fn to_sync_config(&self) -> BackgroundSyncConfig {
        BackgroundSyncConfig {
            resolutions: self.resolutions.clone(),
            run_interval: Duration::from_secs(self.interval_secs),
            targets_per_cycle: self.targets_per_cycle,
            min_item_threshold: self.min_item_threshold,
            strategies: self.strategies.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackfillSettings {
    #[serde(default = "default_resolutions")]
    pub resolutions: Vec<Resolution>,
    /// Fixed pause between items
    #[serde(default = "default_rate_limit_ms")]
    pub item_delay_ms: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_batch_size() -> usize {
    100
}

impl Default for BackfillSettings {
    fn default() -> Self {
        Self {
            resolutions: default_resolutions(),
            item_delay_ms: default_rate_limit_ms(),
            batch_size: default_batch_size(),
        }
    }
}

impl BackfillSettings {
    pub fn to_backfiller_config(&self) -> BackfillerConfig {
        BackfillerConfig {
            resolutions: self.resolutions.clone(),
            item_delay: Duration::from_millis(self.item_delay_ms),
            batch_size: self.batch_size,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GapFillSettings {
    #[serde(default = "default_resolutions")]
    pub resolutions: Vec<Resolution>,
    #[serde(default = "default_items_per_run")]
    pub items_per_run: usize,
}

fn default_items_per_run() -> usize {
    150
}

impl Default for GapFillSettings {
    fn default() -> Self {
        Self {
            resolutions: default_resolutions(),
            items_per_run: default_items_per_run(),
        }
    }
}

impl GapFillSettings {
    pub fn to_gap_filler_config(&self) -> GapFillerConfig {
        GapFillerConfig {
            resolutions: self.resolutions.clone(),
            items_per_run: self.items_per_run,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ItemSyncSettings {
    #[serde(default = "default_true")]
    pub sync_on_start: bool,
    /// 0 disables periodic refresh
    #[serde(default = "default_item_sync_interval_secs")]
    pub interval_secs: u64,
}

fn default_item_sync_interval_secs() -> u64 {
    24 * 60 * 60
}

impl Default for ItemSyncSettings {
    fn default() -> Self {
        Self {
            sync_on_start: true,
            interval_secs: default_item_sync_interval_secs(),
        }
    }
}

impl ItemSyncSettings {
    pub fn to_item_syncer_config(&self) -> ItemSyncerConfig {
        ItemSyncerConfig {
            sync_on_start: self.sync_on_start,
            sync_interval: Duration::from_secs(self.interval_secs),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("GE_COLLECTOR_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (GE_COLLECTOR__FEED__USER_AGENT, etc.)
            .add_source(
                Environment::with_prefix("GE_COLLECTOR")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            // Conventional variable names win over everything else
            .set_override_option("feed.user_agent", non_empty_env("OSRS_API_USER_AGENT"))?
            .set_override_option("database.url", non_empty_env("DATABASE_URL"))?;

        builder.build()?.try_deserialize()
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.feed.user_agent.trim().is_empty() {
            errors.push(
                "feed.user_agent is required (set OSRS_API_USER_AGENT); the prices API rejects anonymous clients"
                    .to_string(),
            );
        }
        if let Err(e) = url::Url::parse(&self.feed.base_url) {
            errors.push(format!("feed.base_url is not a valid URL: {e}"));
        }
        if self.feed.timeout_secs == 0 {
            errors.push("feed.timeout_secs must be positive".to_string());
        }
        if self.feed.rate_limit_ms == 0 {
            errors.push("feed.rate_limit_ms must be positive".to_string());
        }

        if self.database.max_connections == 0 {
            errors.push("database.max_connections must be positive".to_string());
        }
        if self.database.min_connections > self.database.max_connections {
            errors.push("database.min_connections must not exceed max_connections".to_string());
        }

        if self.poller.interval_secs == 0 {
            errors.push("poller.interval_secs must be positive".to_string());
        }
        if self.volume_poller.interval_secs == 0 {
            errors.push("volume_poller.interval_secs must be positive".to_string());
        }
        if self.sync.interval_secs == 0 {
            errors.push("sync.interval_secs must be positive".to_string());
        }
        if self.sync.targets_per_cycle == 0 {
            errors.push("sync.targets_per_cycle must be positive".to_string());
        }
        if self.sync.strategies.is_empty() {
            errors.push("sync.strategies must name at least one strategy".to_string());
        }
        if self.sync.resolutions.is_empty() {
            errors.push("sync.resolutions must name at least one resolution".to_string());
        }
        if self.gap_fill.items_per_run == 0 {
            errors.push("gap_fill.items_per_run must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Database URL, checked to be a Postgres connection string
    pub fn database_url(&self) -> Result<&str, String> {
        if self.database.url.is_empty() {
            return Err("database.url is required (set DATABASE_URL)".to_string());
        }
        match url::Url::parse(&self.database.url) {
            Ok(u) if matches!(u.scheme(), "postgres" | "postgresql") => Ok(&self.database.url),
            Ok(u) => Err(format!("database.url has unsupported scheme: {}", u.scheme())),
            Err(e) => Err(format!("database.url is not a valid URL: {e}")),
        }
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> AppConfig {
        AppConfig {
            feed: FeedConfig {
                user_agent: "ge-collector tests".to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults_match_service_defaults() {
        let config = AppConfig::default();

        assert_eq!(config.retention.policy(), RetentionPolicy::standard());
        assert_eq!(config.poller.to_poller_config().interval, Duration::from_secs(60));
        assert_eq!(config.sync.to_sync_config().targets_per_cycle, 50);
        assert_eq!(config.gap_fill.items_per_run, 150);
        assert_eq!(config.feed.rate_limit(), Duration::from_millis(100));
        assert_eq!(config.database.max_connections, 25);
        assert_eq!(config.database.min_connections, 5);
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json);
    }

    #[test]
    fn test_missing_user_agent_is_rejected() {
        let errors = AppConfig::default().validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("user_agent")));

        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_zero_intervals_are_rejected() {
        let mut config = valid();
        config.poller.interval_secs = 0;
        config.sync.strategies.clear();

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn test_database_url_scheme() {
        let mut config = valid();
        assert!(config.database_url().is_err());

        config.database.url = "postgres://collector@localhost/ge".to_string();
        assert!(config.database_url().is_ok());

        config.database.url = "mysql://localhost/ge".to_string();
        assert!(config.database_url().is_err());
    }

    #[test]
    fn test_load_from_toml() {
        let dir = std::env::temp_dir().join(format!("ge-collector-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("default.toml"),
            r#"
[feed]
user_agent = "toml agent"

[retention]
five_minute_days = 3

[sync]
resolutions = ["1h", "24h"]
strategies = ["timestamps", "new_items"]
"#,
        )
        .unwrap();

        let config = AppConfig::load_from(&dir).unwrap();
        std::fs::remove_dir_all(&dir).unwrap();

        assert_eq!(config.retention.five_minute_days, 3);
        assert_eq!(config.retention.one_hour_days, 365);
        assert_eq!(config.sync.resolutions, vec![Resolution::OneHour, Resolution::OneDay]);
        assert_eq!(
            config.sync.strategies,
            vec![DiscoveryStrategy::Timestamps, DiscoveryStrategy::NewItems]
        );
    }
}
