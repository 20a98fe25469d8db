//! Tavily search API provider.

use super::{SearchKind, SearchProvider};
use crate::error::SearchError;
use crate::types::SearchResult;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

const ENDPOINT: &str = "https://api.tavily.com/search";
const TIMEOUT: Duration = Duration::from_secs(30);

/// Tavily provider. Tavily takes exclusions as a native parameter rather
/// than query operators, and has no scholar vertical; scholar queries run
/// against the general topic.
pub struct TavilyProvider {
    client: reqwest::Client,
    api_key: String,
}

impl TavilyProvider {
    pub fn new(api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
        }
    }

    fn native_topic(kind: SearchKind) -> &'static str {
        match kind {
            SearchKind::News => "news",
            SearchKind::Web | SearchKind::Scholar => "general",
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
                            snippet: item["content"].as_str().unwrap_or("").to_string(),
                            rank: 0,
                            provider_tag: "tavily".to_string(),
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
impl SearchProvider for TavilyProvider {
    fn tag(&self) -> &'static str {
        "tavily"
    }

    async fn search(
        &self,
        query: &str,
        kind: SearchKind,
        n: usize,
        exclude_domains: &[String],
    ) -> Result<Vec<SearchResult>, SearchError> {
        let payload = serde_json::json!({
            "api_key": self.api_key,
            "query": query,
            "topic": Self::native_topic(kind),
            "max_results": n,
            "exclude_domains": exclude_domains,
        });

        debug!(query, kind = ?kind, "Calling Tavily API");

        let response = self
            .client
            .post(ENDPOINT)
            .json(&payload)
            .timeout(TIMEOUT)
            .send()
            .await
            .map_err(|e| SearchError::RequestFailed {
                provider: "tavily".into(),
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(SearchError::RequestFailed {
                provider: "tavily".into(),
                message: format!("HTTP {status}"),
            });
        }

        let data: Value = response.json().await.map_err(|e| SearchError::BadResponse {
            provider: "tavily".into(),
            message: e.to_string(),
        })?;

        Ok(Self::parse_response(&data))
    }
}
