//! Serper-style SERP API provider.

use super::{query_with_exclusions, SearchKind, SearchProvider};
use crate::error::SearchError;
use crate::types::SearchResult;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

const ENDPOINT: &str = "https://google.serper.dev/search";
const TIMEOUT: Duration = Duration::from_secs(30);

/// Google SERP provider via the Serper API.
pub struct SerpProvider {
    client: reqwest::Client,
    api_key: String,
}

impl SerpProvider {
    pub fn new(api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
        }
    }

    /// Map the search kind onto Serper's `type` parameter.
    fn native_type(kind: SearchKind) -> &'static str {
        match kind {
            SearchKind::Web => "search",
            SearchKind::News => "news",
            SearchKind::Scholar => "scholar",
        }
    }

    /// Parse a Serper response into results with 1-based contiguous ranks.
    fn parse_response(data: &Value, kind: SearchKind) -> Vec<SearchResult> {
        // News results live under "news"; web and scholar under "organic".
        let items = match kind {
            SearchKind::News => data["news"].as_array(),
            _ => data["organic"].as_array(),
        };

        let mut results: Vec<SearchResult> = items
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| {
                        let url = item["link"].as_str()?.to_string();
                        Some(SearchResult {
                            url,
                            title: item["title"].as_str().unwrap_or("").to_string(),
                            snippet: item["snippet"].as_str().unwrap_or("").to_string(),
                            rank: 0,
                            provider_tag: "serp".to_string(),
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
impl SearchProvider for SerpProvider {
    fn tag(&self) -> &'static str {
        "serp"
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
            "q": q,
            "num": n,
            "type": Self::native_type(kind),
        });

        debug!(query, kind = ?kind, "Calling Serper API");

        let response = self
            .client
            .post(ENDPOINT)
            .header("X-API-KEY", &self.api_key)
            .json(&payload)
            .timeout(TIMEOUT)
            .send()
            .await
            .map_err(|e| SearchError::RequestFailed {
                provider: "serp".into(),
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(SearchError::RequestFailed {
                provider: "serp".into(),
                message: format!("HTTP {status}"),
            });
        }

        let data: Value = response.json().await.map_err(|e| SearchError::BadResponse {
            provider: "serp".into(),
            message: e.to_string(),
        })?;

        Ok(Self::parse_response(&data, kind))
    }
}
