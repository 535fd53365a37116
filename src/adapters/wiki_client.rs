//! RuneScape Wiki real-time prices API client.
//!
//! Every request carries the configured `User-Agent`; the API rejects
//! anonymous clients.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, instrument};

use crate::collector::source::{
    BulkPriceResponse, LatestPricesResponse, PriceSource, TimeseriesResponse,
};
use crate::domain::{CatalogItem, Resolution};
use crate::error::{CollectorError, Result};

pub const DEFAULT_WIKI_API_BASE: &str = "https://prices.runescape.wiki/api/v1/osrs";
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct WikiPriceClient {
    http: Client,
    base_url: String,
}

impl WikiPriceClient {
    pub fn new(user_agent: &str) -> Result<Self> {
        Self::with_options(DEFAULT_WIKI_API_BASE, user_agent, DEFAULT_HTTP_TIMEOUT)
    }

    pub fn with_options(base_url: &str, user_agent: &str, timeout: Duration) -> Result<Self> {
        if user_agent.trim().is_empty() {
            return Err(CollectorError::Validation(
                "a User-Agent is required by the prices API".to_string(),
            ));
        }

        let http = Client::builder()
            .user_agent(user_agent.trim())
            .timeout(timeout)
            .build()
            .map_err(|e| {
                CollectorError::Internal(format!("failed to build prices HTTP client: {}", e))
            })?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self.http.get(&url);
        if !query.is_empty() {
            req = req.query(query);
        }

        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(CollectorError::UpstreamStatus {
                endpoint: path.to_string(),
                status: status.as_u16(),
            });
        }

        let body = resp.bytes().await?;
        debug!(endpoint = path, bytes = body.len(), "prices API response");
        Ok(serde_json::from_slice(&body)?)
    }
}

#[async_trait]
impl PriceSource for WikiPriceClient {
    #[instrument(skip(self))]
    async fn item_catalog(&self) -> Result<Vec<CatalogItem>> {
        self.get_json("/mapping", &[]).await
    }

    #[instrument(skip(self))]
    async fn latest_prices(&self, item_id: Option<i32>) -> Result<LatestPricesResponse> {
        let query: Vec<(&str, String)> = item_id
            .map(|id| vec![("id", id.to_string())])
            .unwrap_or_default();
        self.get_json("/latest", &query).await
    }

    #[instrument(skip(self))]
    async fn timeseries(
        &self,
        item_id: i32,
        resolution: Resolution,
    ) -> Result<TimeseriesResponse> {
        let query = [
            ("id", item_id.to_string()),
            ("timestep", resolution.as_str().to_string()),
        ];
        self.get_json("/timeseries", &query).await
    }

    #[instrument(skip(self))]
    async fn bulk_prices(
        &self,
        resolution: Resolution,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<BulkPriceResponse> {
        let path = format!("/{}", resolution.as_str());
        let query: Vec<(&str, String)> = timestamp
            .map(|ts| vec![("timestamp", ts.timestamp().to_string())])
            .unwrap_or_default();
        self.get_json(&path, &query).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_user_agent_is_rejected() {
        assert!(WikiPriceClient::new("  ").is_err());
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let client = WikiPriceClient::with_options(
            "https://prices.example/api/v1/osrs/",
            "ge-collector tests",
            DEFAULT_HTTP_TIMEOUT,
        )
        .unwrap();
        assert_eq!(client.base_url(), "https://prices.example/api/v1/osrs");
    }
}
