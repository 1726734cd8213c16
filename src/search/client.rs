use async_trait::async_trait;
use reqwest::Client;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

use super::{SearchBackend, SearchRequest, SearchResponse};
use crate::config::{RequestConfig, SearchConfig};
use crate::error::{SearchApiResult, SearchError};

/// HTTP client for the search execution backend
#[derive(Clone)]
pub struct SearchClient {
    client: Client,
    base_url: String,
    api_key: String,
    request_config: RequestConfig,
}

impl SearchClient {
    /// Create a new search client
    pub fn new(config: &SearchConfig, request_config: RequestConfig) -> SearchApiResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(request_config.timeout_ms))
            .build()
            .map_err(SearchError::Http)?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            request_config,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn execute_request(&self, request: &SearchRequest) -> SearchApiResult<SearchResponse> {
        let url = format!("{}/v1/search", self.base_url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SearchError::Timeout {
                        timeout_ms: self.request_config.timeout_ms,
                    }
                } else {
                    SearchError::Http(e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            return Err(SearchError::Api {
                status: status.as_u16(),
                message: error_body,
            });
        }

        response
            .json::<SearchResponse>()
            .await
            .map_err(|e| SearchError::InvalidResponse {
                message: format!("Failed to parse search response: {}", e),
            })
    }
}

#[async_trait]
impl SearchBackend for SearchClient {
    async fn search(&self, request: SearchRequest) -> SearchApiResult<SearchResponse> {
        let max_retries = self.request_config.max_retries;
        let mut last_error = None;

        for attempt in 0..=max_retries {
            if attempt > 0 {
                let delay =
                    Duration::from_millis(self.request_config.retry_delay_ms << (attempt - 1));
                warn!(
                    query = %request.query,
                    retry = attempt,
                    delay_ms = delay.as_millis(),
                    "Retrying search request"
                );
                tokio::time::sleep(delay).await;
            }

            let start = Instant::now();
            match self.execute_request(&request).await {
                Ok(response) => {
                    debug!(
                        query = %request.query,
                        results = response.results.len(),
                        latency_ms = start.elapsed().as_millis(),
                        "Search succeeded"
                    );
                    return Ok(response);
                }
                Err(SearchError::Api { status, message })
                    if (400..500).contains(&status) && status != 429 =>
                {
                    error!(query = %request.query, status, "Search backend rejected request");
                    return Err(SearchError::Api { status, message });
                }
                Err(e) => {
                    error!(
                        query = %request.query,
                        error = %e,
                        retry = attempt,
                        "Search request failed"
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(SearchError::Unavailable {
            message: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "Unknown error".to_string()),
            retries: max_retries,
        })
    }
}
