use thiserror::Error;

/// Main error type for the collector
#[derive(Error, Debug)]
pub enum CollectorError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Upstream {endpoint} returned status {status}")]
    UpstreamStatus { endpoint: String, status: u16 },

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Feed data errors
    #[error("Invalid feed data: {0}")]
    InvalidFeedData(String),

    #[error("Unknown resolution: {0} (valid: 5m, 1h, 24h)")]
    UnknownResolution(String),

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl CollectorError {
    /// Cancellation is a clean exit, not a failure worth counting
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CollectorError::Cancelled)
    }
}

/// Result type alias for CollectorError
pub type Result<T> = std::result::Result<T, CollectorError>;
