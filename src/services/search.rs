//! Web search provider
//!
//! [`SearchProvider`] is the injectable seam the research pipeline searches
//! through; [`SerperClient`] is the production implementation against the
//! Serper API (google.serper.dev). Ranking is the provider's business; we
//! keep result order as returned.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::env;
use tracing::debug;

use crate::config::ArachneConfig;
use crate::error::{ArachneError, Result};

/// One ranked search result
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchHit {
    pub url: String,
    pub title: String,
    #[serde(default)]
    pub snippet: String,
    #[serde(default)]
    pub image: Option<String>,
}

/// Web search collaborator, safe for concurrent use by all sessions
#[async_trait]
pub trait SearchProvider: Send + Sync {
    /// Run one query and return ranked hits.
    async fn search(&self, query: &str) -> Result<Vec<SearchHit>>;
}

/// Configuration for the Serper client
#[derive(Debug, Clone)]
pub struct SerperConfig {
    /// Serper API key
    pub api_key: String,
    /// Maximum results per query
    pub num_results: usize,
}

impl Default for SerperConfig {
    fn default() -> Self {
        Self {
            api_key: env::var("SERPER_API_KEY").unwrap_or_default(),
            num_results: 10,
        }
    }
}

impl From<&ArachneConfig> for SerperConfig {
    fn from(config: &ArachneConfig) -> Self {
        Self {
            api_key: config.serper_api_key.clone(),
            ..Self::default()
        }
    }
}

/// Serper API search client
pub struct SerperClient {
    config: SerperConfig,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct SerperRequest<'a> {
    q: &'a str,
    num: usize,
}

#[derive(Debug, Deserialize)]
struct SerperResponse {
    #[serde(default)]
    organic: Vec<SerperOrganic>,
}

#[derive(Debug, Deserialize)]
struct SerperOrganic {
    link: String,
    title: String,
    #[serde(default)]
    snippet: String,
    #[serde(rename = "imageUrl")]
    #[serde(default)]
    image_url: Option<String>,
}

impl SerperClient {
    /// Create a new Serper client
    pub fn new(config: SerperConfig) -> Result<Self> {
        if config.api_key.is_empty() {
            return Err(ArachneError::Config(config::ConfigError::Message(
                "SERPER_API_KEY not set".to_string(),
            )));
        }

        Ok(Self {
            config,
            client: reqwest::Client::new(),
        })
    }
}

#[async_trait]
impl SearchProvider for SerperClient {
    async fn search(&self, query: &str) -> Result<Vec<SearchHit>> {
        debug!(query, "calling Serper API");

        let request = SerperRequest {
            q: query,
            num: self.config.num_results,
        };

        let response = self
            .client
            .post("https://google.serper.dev/search")
            .header("X-API-KEY", &self.config.api_key)
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(ArachneError::Http)?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(ArachneError::SearchApi(format!(
                "Search request failed with status {}: {}",
                status, error_text
            )));
        }

        let api_response: SerperResponse = response
            .json()
            .await
            .map_err(|e| ArachneError::SearchApi(format!("Failed to parse response: {}", e)))?;

        let hits = api_response
            .organic
            .into_iter()
            .map(|o| SearchHit {
                url: o.link,
                title: o.title,
                snippet: o.snippet,
                image: o.image_url,
            })
            .collect::<Vec<_>>();

        debug!(count = hits.len(), "search results received");
        Ok(hits)
    }
}
