//! Research planning stage.

use crate::error::PipelineError;
use crate::llm::LlmClient;
use crate::types::{Query, ResearchPlan, SearchQuery};
use serde_json::Value;
use tracing::{debug, info};

/// Produces report sections and prioritized search queries for a query.
///
/// An empty `sections` or `search_queries` list fails the run; there is no
/// outer retry beyond the gateway's.
pub struct Planner {
    llm: LlmClient,
    model: String,
}

impl Planner {
    pub fn new(llm: LlmClient, model: impl Into<String>) -> Self {
        Self {
            llm,
            model: model.into(),
        }
    }

    /// Create a research plan for a classified query.
    pub async fn plan(&self, query: &Query) -> Result<ResearchPlan, PipelineError> {
        let prompt = build_prompt(query);

        let response = self
            .llm
            .complete_json(&prompt, &self.model, 0.3, Some(2000))
            .await?;

        let sections = parse_sections(&response);
        let search_queries = parse_search_queries(&response);
        let rationale = response["rationale"].as_str().unwrap_or("").to_string();

        if sections.is_empty() || search_queries.is_empty() {
            return Err(PipelineError::PlanningFailed {
                reason: "model returned empty sections or search queries".into(),
            });
        }

        info!(
            sections = sections.len(),
            queries = search_queries.len(),
            "Research plan created"
        );
        debug!(?sections, "Planned sections");

        Ok(ResearchPlan {
            query: query.clone(),
            sections,
            search_queries,
            rationale,
        })
    }
}

fn parse_sections(response: &Value) -> Vec<String> {
    response["sections"]
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|s| s.as_str())
                .map(str::to_string)
                .filter(|s| !s.trim().is_empty())
                .collect()
        })
        .unwrap_or_default()
}

pub(crate) fn parse_search_queries(response: &Value) -> Vec<SearchQuery> {
    response["search_queries"]
        .as_array()
        .or_else(|| response["additional_queries"].as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    let text = item["query"].as_str()?.trim();
                    if text.is_empty() {
                        return None;
                    }
                    Some(SearchQuery::new(
                        text,
                        item["purpose"].as_str().unwrap_or(""),
                        item["priority"].as_u64().unwrap_or(3) as u8,
                    ))
                })
                .collect()
        })
        .unwrap_or_default()
}

fn build_prompt(query: &Query) -> String {
    format!(
        r#"You are a research planner. Given a user query and its intent, create a comprehensive research plan.

Operational rules:
- Do not mention knowledge cutoff or browsing limitations.
- Assume web search will be performed; prefer recent sources for time-sensitive topics.
- When relevant, generate queries targeting fresh information (recent years, site filters).

Query: "{}"
Intent: {}

Create a research plan with:
1. A list of report sections that should be covered
2. Specific search queries to gather information for each section
3. Rationale for the overall approach

Consider:
- What information is needed to fully answer the query?
- For code intent: focus on documentation, examples, and best practices
- For news intent: prioritize recent sources and multiple perspectives
- For research intent: include academic sources and in-depth analysis

Respond with a JSON object:
{{
  "sections": ["Section 1 title", "Section 2 title"],
  "search_queries": [
    {{"query": "search query 1", "purpose": "what this query aims to find", "priority": 1}},
    {{"query": "search query 2", "purpose": "what this query aims to find", "priority": 2}}
  ],
  "rationale": "Explanation of the research approach"
}}

Priority is 1 (highest) to 5 (lowest)."#,
        query.text, query.intent
    )
}
