//! Upstream model provider client
//!
//! Non-streaming calls retry on connection errors and 5xx responses, with
//! exponential backoff. Streaming calls never retry: once bytes have been
//! forwarded, a replay would duplicate output.

use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

pub struct UpstreamClient {
    client: reqwest::Client,
    base_url: String,
    max_retries: u32,
    base_backoff: Duration,
}

impl UpstreamClient {
    pub fn new(base_url: &str, max_retries: u32, base_backoff: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .context("building upstream HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            max_retries,
            base_backoff,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// POST a JSON body and return (status, response body). Retries
    /// connection failures and 5xx responses.
    pub async fn post_json(&self, path: &str, body: &Value) -> Result<(u16, Value)> {
        let url = format!("{}{}", self.base_url, path);
        let mut attempt = 0;

        loop {
            let outcome = self.try_post(&url, body).await;

            match outcome {
                Ok((status, value)) if status < 500 => {
                    debug!("Upstream responded {} for {}", status, path);
                    return Ok((status, value));
                }
                Ok((status, _)) if attempt < self.max_retries => {
                    warn!(
                        "Upstream returned {} for {}, retry {} of {}",
                        status,
                        path,
                        attempt + 1,
                        self.max_retries
                    );
                }
                Ok((status, value)) => {
                    warn!("Upstream returned {} for {}, out of retries", status, path);
                    return Ok((status, value));
                }
                Err(e) if attempt < self.max_retries => {
                    warn!(
                        "Upstream request to {} failed, retry {} of {}: {}",
                        path,
                        attempt + 1,
                        self.max_retries,
                        e
                    );
                }
                Err(e) => {
                    return Err(e.context(format!("upstream request to {} failed", url)));
                }
            }

            tokio::time::sleep(self.base_backoff * 2u32.pow(attempt)).await;
            attempt += 1;
        }
    }

    async fn try_post(&self, url: &str, body: &Value) -> Result<(u16, Value)> {
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| anyhow!("sending request: {}", e))?;

        let status = response.status().as_u16();
        let value: Value = response
            .json()
            .await
            .map_err(|e| anyhow!("reading response body: {}", e))?;
        Ok((status, value))
    }

    /// POST for a streaming response. The caller drains chunks via
    /// `reqwest::Response::chunk`. No retries.
    pub async fn post_stream(&self, path: &str, body: &Value) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .with_context(|| format!("upstream stream request to {} failed", url))?;

        debug!("Upstream stream opened, status {}", response.status());
        Ok(response)
    }
}
