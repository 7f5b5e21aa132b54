//! Web-fetch collaborator.
//!
//! The [`WebFetcher`] trait hands the router extracted text passages plus
//! their source URLs for a query. The shipped implementation calls the
//! Tavily search API; anything that can turn a query into text works.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::config::WebConfig;
use crate::models::WebContent;

/// Trait for web search/fetch providers.
#[async_trait]
pub trait WebFetcher: Send + Sync {
    /// Fetch extracted text and source URLs for a query. An empty result
    /// set is returned as empty content, not an error.
    async fn fetch(&self, query: &str) -> Result<WebContent>;
}

/// A no-op fetcher that always returns errors.
pub struct DisabledFetcher;

#[async_trait]
impl WebFetcher for DisabledFetcher {
    async fn fetch(&self, _query: &str) -> Result<WebContent> {
        bail!("Web search provider is disabled. Set [web] provider in config.")
    }
}

/// Web search via the Tavily API.
pub struct TavilySearcher {
    max_results: usize,
    max_passage_chars: usize,
    api_key: String,
    client: reqwest::Client,
}

impl TavilySearcher {
    pub fn new(config: &WebConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env)
            .map_err(|_| anyhow::anyhow!("{} environment variable not set", config.api_key_env))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            max_results: config.max_results,
            max_passage_chars: config.max_passage_chars,
            api_key,
            client,
        })
    }
}

#[async_trait]
impl WebFetcher for TavilySearcher {
    async fn fetch(&self, query: &str) -> Result<WebContent> {
        let body = serde_json::json!({
            "api_key": self.api_key,
            "query": query,
            "max_results": self.max_results,
        });

        let response = self
            .client
            .post("https://api.tavily.com/search")
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("Tavily API error {}: {}", status, body_text);
        }

        let json: serde_json::Value = response.json().await?;
        let results = json
            .get("results")
            .and_then(|r| r.as_array())
            .cloned()
            .unwrap_or_default();

        let mut content = WebContent::default();
        for result in &results {
            let text = result.get("content").and_then(|c| c.as_str()).unwrap_or("");
            let url = result
                .get("url")
                .and_then(|u| u.as_str())
                .unwrap_or("unknown");

            if text.is_empty() {
                warn!(url, "web result has no content");
                continue;
            }

            let passage: String = text.chars().take(self.max_passage_chars).collect();
            content.passages.push(passage);
            content.sources.push(url.to_string());
        }

        Ok(content)
    }
}

/// Create the appropriate [`WebFetcher`] based on configuration.
pub fn create_fetcher(config: &WebConfig) -> Result<Arc<dyn WebFetcher>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledFetcher)),
        "tavily" => Ok(Arc::new(TavilySearcher::new(config)?)),
        other => bail!("Unknown web provider: {}", other),
    }
}
