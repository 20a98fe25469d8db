//! Perplexity search API provider.

use super::{query_with_exclusions, SearchKind, SearchProvider};
use crate::error::SearchError;
use crate::types::SearchResult;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

const ENDPOINT: &str = "https://api.perplexity.ai/search";
const TIMEOUT: Duration = Duration::from_secs(30);

/// Perplexity provider. Perplexity exposes a single ranked web index, so
/// news and scholar are steered through a search-mode hint plus the query
/// operators.
pub struct PerplexityProvider {
    client: reqwest::Client,
    api_key: String,
}

impl PerplexityProvider {
    pub fn new(api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
        }
    }

    fn native_mode(kind: SearchKind) -> &'static str {
        match kind {
            SearchKind::Web => "web",
            SearchKind::News => "news",
            SearchKind::Scholar => "academic",
        }
    }

    fn parse_response(data: &Value) -> Vec<SearchResult> {
        let mut results: Vec<SearchResult> = data["results"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| {
                        let url = item["url"].as_str()?.to_string();
                        Some(SearchResult {
                            url,
                            title: item["title"].as_str().unwrap_or("").to_string(),
                            snippet: item["snippet"].as_str().unwrap_or("").to_string(),
                            rank: 0,
                            provider_tag: "perplexity".to_string(),
                            relevance_score: None,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        for (i, result) in results.iter_mut().enumerate() {
            result.rank = (i + 1) as u32;
        }
        results
    }
}

#[async_trait]
impl SearchProvider for PerplexityProvider {
    fn tag(&self) -> &'static str {
        "perplexity"
    }

    async fn search(
        &self,
        query: &str,
        kind: SearchKind,
        n: usize,
        exclude_domains: &[String],
    ) -> Result<Vec<SearchResult>, SearchError> {
        let q = query_with_exclusions(query, exclude_domains);
        let payload = serde_json::json!({
            "query": q,
            "search_mode": Self::native_mode(kind),
            "max_results": n,
        });

        debug!(query, kind = ?kind, "Calling Perplexity API");

        let response = self
            .client
            .post(ENDPOINT)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .timeout(TIMEOUT)
            .send()
            .await
            .map_err(|e| SearchError::RequestFailed {
                provider: "perplexity".into(),
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(SearchError::RequestFailed {
                provider: "perplexity".into(),
                message: format!("HTTP {status}"),
            });
        }

        let data: Value = response.json().await.map_err(|e| SearchError::BadResponse {
            provider: "perplexity".into(),
            message: e.to_string(),
        })?;

        Ok(Self::parse_response(&data))
    }
}
