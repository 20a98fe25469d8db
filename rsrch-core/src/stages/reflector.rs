//! Reflection stage: gap analysis over accumulated summaries.

use crate::llm::LlmClient;
use crate::stages::planner::parse_search_queries;
use crate::types::{Query, ReflectionResult, Summary};
use tracing::{debug, info, warn};

/// Follow-up queries are capped per reflection round.
const MAX_ADDITIONAL_QUERIES: usize = 5;

/// Judges whether the gathered research suffices, and emits follow-up
/// queries when it does not.
///
/// Never retries its own JSON parsing beyond the gateway's retries. A
/// failed reflection terminates the loop rather than blocking the report.
pub struct Reflector {
    llm: LlmClient,
    model: String,
}

impl Reflector {
    pub fn new(llm: LlmClient, model: impl Into<String>) -> Self {
        Self {
            llm,
            model: model.into(),
        }
    }

    /// Assess completeness of the research gathered so far.
    pub async fn reflect(
        &self,
        query: &Query,
        sections: &[String],
        summaries: &[Summary],
    ) -> ReflectionResult {
        let prompt = build_prompt(query, sections, summaries);

        let response = match self
            .llm
            .complete_json(&prompt, &self.model, 0.3, Some(1500))
            .await
        {
            Ok(response) => response,
            Err(err) => {
                warn!(
                    stage = "reflect",
                    error = %err,
                    "Reflection failed; proceeding with available research"
                );
                return ReflectionResult::completed(format!(
                    "Reflection unavailable, proceeding with available research: {err}"
                ));
            }
        };

        let complete = response["is_complete"].as_bool().unwrap_or(false);
        let confidence = response["confidence"].as_f64().unwrap_or(0.5);
        let gaps: Vec<String> = response["missing_information"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|g| g.as_str())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let mut additional_queries = parse_search_queries(&response);
        additional_queries.truncate(MAX_ADDITIONAL_QUERIES);
        let rationale = response["rationale"].as_str().unwrap_or("").to_string();

        // Incomplete with nothing to search for cannot make progress; treat
        // as complete so the loop terminates.
        let complete = if !complete && additional_queries.is_empty() {
            warn!(
                stage = "reflect",
                gaps = gaps.len(),
                "Reflection reported gaps but no follow-up queries; terminating loop"
            );
            true
        } else {
            complete
        };

        if complete {
            info!(confidence, "Research deemed complete");
        } else {
            info!(
                gaps = gaps.len(),
                follow_ups = additional_queries.len(),
                confidence,
                "Research incomplete; follow-up queries suggested"
            );
        }
        debug!(rationale = rationale.as_str(), "Reflection rationale");

        ReflectionResult {
            complete,
            confidence,
            gaps,
            additional_queries,
            rationale,
        }
    }
}

fn build_prompt(query: &Query, sections: &[String], summaries: &[Summary]) -> String {
    let summaries_text: String = summaries
        .iter()
        .enumerate()
        .map(|(i, s)| {
            let preview: String = s.text.chars().take(500).collect();
            format!("Source {}: {}\n{preview}…", i + 1, s.source_url)
        })
        .collect::<Vec<_>>()
        .join("\n\n");
    let sections_list: String = sections
        .iter()
        .map(|s| format!("- {s}"))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        r#"You are a research quality analyst. Analyze the research gathered so far and determine if it is sufficient to answer the user's query comprehensively.

Original Query: "{}"
Intent: {}

Planned Report Sections:
{sections_list}

Research Gathered ({} sources):
{summaries_text}

Evaluate whether the gathered research can:
1. Fully answer the original query
2. Cover all planned report sections with adequate depth
3. Provide authoritative and diverse perspectives

Identify specific information gaps such as missing perspectives, insufficient
technical depth, lack of recent information, or unexplored aspects.

Respond with a JSON object:
{{
  "is_complete": true,
  "confidence": 0.0,
  "missing_information": ["specific gap"],
  "additional_queries": [
    {{"query": "specific search query", "purpose": "what this will find", "priority": 1}}
  ],
  "rationale": "explanation of the completeness assessment"
}}

Suggest at most {MAX_ADDITIONAL_QUERIES} additional queries. Be critical but
realistic: minor gaps are acceptable if the core query is well-addressed."#,
        query.text,
        query.intent,
        summaries.len()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::{Scripted, ScriptedTransport};
    use crate::llm::LlmOptions;
    use crate::types::{ContentType, IntentKind};
    use std::collections::BTreeSet;
    use std::sync::Arc;

    fn reflector(script: Vec<Scripted>) -> Reflector {
        let transport = Arc::new(ScriptedTransport::new(script));
        Reflector::new(LlmClient::new(transport, LlmOptions::default()), "test-model")
    }

    fn summary(url: &str) -> Summary {
        Summary {
            source_url: url.to_string(),
            title: "t".into(),
            text: "summary text".into(),
            citations: BTreeSet::from([url.to_string()]),
            content_type: ContentType::General,
            preserved_tables: Vec::new(),
            compacted_tables: Vec::new(),
            relevance_score: 0.0,
        }
    }

    fn query() -> Query {
        Query::with_intent("What is HTTP/3?", IntentKind::Informational)
    }

    #[tokio::test]
    async fn test_complete_reflection() {
        let reflector = reflector(vec![Scripted::Ok(
            r#"{"is_complete": true, "confidence": 0.9, "missing_information": [], "additional_queries": [], "rationale": "covered"}"#,
        )]);
        let result = reflector
            .reflect(&query(), &["Overview".into()], &[summary("https://a.example")])
            .await;
        assert!(result.complete);
        assert!(result.additional_queries.is_empty());
    }

    #[tokio::test]
    async fn test_incomplete_with_queries() {
        let reflector = reflector(vec![Scripted::Ok(
            r#"{
                "is_complete": false,
                "confidence": 0.4,
                "missing_information": ["deployment details"],
                "additional_queries": [{"query": "http/3 deployment statistics", "purpose": "adoption", "priority": 1}],
                "rationale": "missing adoption data"
            }"#,
        )]);
        let result = reflector
            .reflect(&query(), &["Overview".into()], &[summary("https://a.example")])
            .await;
        assert!(!result.complete);
        assert_eq!(result.additional_queries.len(), 1);
        assert_eq!(result.gaps, vec!["deployment details"]);
    }

    #[tokio::test]
    async fn test_incomplete_without_queries_terminates() {
        let reflector = reflector(vec![Scripted::Ok(
            r#"{"is_complete": false, "confidence": 0.3, "missing_information": ["gap"], "additional_queries": [], "rationale": "stuck"}"#,
        )]);
        let result = reflector.reflect(&query(), &[], &[]).await;
        // No follow-ups means no forward progress: loop must terminate.
        assert!(result.complete);
        assert_eq!(result.gaps, vec!["gap"]);
    }

    #[tokio::test]
    async fn test_query_count_capped() {
        let queries: Vec<String> = (0..8)
            .map(|i| format!(r#"{{"query": "q{i}", "purpose": "p", "priority": 1}}"#))
            .collect();
        let body = format!(
            r#"{{"is_complete": false, "confidence": 0.4, "missing_information": ["g"], "additional_queries": [{}], "rationale": ""}}"#,
            queries.join(",")
        );
        let reflector = reflector(vec![Scripted::OkOwned(body)]);
        let result = reflector.reflect(&query(), &[], &[]).await;
        assert_eq!(result.additional_queries.len(), MAX_ADDITIONAL_QUERIES);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reflection_failure_is_complete() {
        let reflector = reflector(vec![
            Scripted::Transient("down"),
            Scripted::Transient("down"),
            Scripted::Transient("down"),
        ]);
        let result = reflector.reflect(&query(), &[], &[]).await;
        assert!(result.complete);
        assert!(result.rationale.contains("Reflection unavailable"));
    }
}
