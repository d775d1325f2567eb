//! API client for communicating with the GoBarber REST API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client};
use serde_json::Value;
use tracing::debug;

use super::{ApiError, AuthApi};
use crate::config::Config;

/// API client for GoBarber.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
}

impl ApiClient {
    /// Create a new API client rooted at `base_url`
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ApiError> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    /// Create a client from the application configuration
    pub fn from_config(config: &Config) -> Result<Self, ApiError> {
        Self::new(
            config.api_base_url.clone(),
            Duration::from_secs(config.request_timeout_secs),
        )
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// Check if response is successful, returning an error with body if not.
    async fn check_response(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }
}

#[async_trait]
impl AuthApi for ApiClient {
    async fn post(&self, path: &str, body: Value) -> Result<Value, ApiError> {
        let url = self.url(path);
        debug!(url = %url, "POST");

        let response = self
            .client
            .post(&url)
            .header(header::ACCEPT, "application/json")
            .json(&body)
            .send()
            .await?;

        let response = Self::check_response(response).await?;
        let text = response.text().await?;

        serde_json::from_str(&text)
            .map_err(|e| ApiError::InvalidResponse(format!("Response from {} is not JSON: {}", path, e)))
    }
}
