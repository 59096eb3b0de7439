use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use crate::error::{AppError, Result};

/// Wraps a destination URL in a monetized short link.
#[async_trait]
pub trait AdLinkShortener: Send + Sync {
    async fn create_ads_link(&self, destination: &str) -> Result<String>;
}

/// Client for the LinkShortify `api?api=<key>&url=<dest>&type=ads` endpoint.
pub struct LinkShortifyClient {
    client: Client,
    base_url: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct ShortenResponse {
    status: String,
    #[serde(rename = "shortenedUrl")]
    shortened_url: Option<String>,
    #[serde(default)]
    message: Option<serde_json::Value>,
}

impl LinkShortifyClient {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::ExternalService(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.to_string(),
            api_key: api_key.to_string(),
        })
    }
}

#[async_trait]
impl AdLinkShortener for LinkShortifyClient {
    async fn create_ads_link(&self, destination: &str) -> Result<String> {
        // The destination embeds the token payload and must stay out of the logs.
        tracing::debug!(shortener = %self.base_url, "requesting ads link");
        let response = self
            .client
            .get(&self.base_url)
            .query(&[
                ("api", self.api_key.as_str()),
                ("url", destination),
                ("type", "ads"),
            ])
            .send()
            .await
            .map_err(|e| AppError::ExternalService(e.without_url().to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::ExternalService(format!("HTTP {status}: {body}")));
        }

        let body: ShortenResponse = response
            .json()
            .await
            .map_err(|e| AppError::ExternalService(e.without_url().to_string()))?;
        match body.shortened_url {
            Some(url) if body.status == "success" && !url.is_empty() => Ok(url),
            _ => Err(AppError::ExternalService(format!(
                "shortener refused: status={} message={:?}",
                body.status, body.message
            ))),
        }
    }
}

/// Used when no shortener credentials are configured.
pub struct DisabledShortener;

#[async_trait]
impl AdLinkShortener for DisabledShortener {
    async fn create_ads_link(&self, _destination: &str) -> Result<String> {
        Err(AppError::ExternalService("ads shortener not configured".into()))
    }
}
