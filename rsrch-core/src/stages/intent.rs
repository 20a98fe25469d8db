//! Intent classification stage.

use crate::error::LlmError;
use crate::llm::LlmClient;
use crate::types::{IntentKind, Query};
use tracing::{debug, info, warn};

/// Classifies a query into one of the seven intents via a JSON-mode call.
///
/// Classification errors are not fatal: the query defaults to `general`
/// with a logged warning. The one exception is an authentication failure,
/// which surfaces immediately so a dead credential aborts the run at the
/// first stage rather than much later.
pub struct IntentClassifier {
    llm: LlmClient,
    model: String,
}

impl IntentClassifier {
    pub fn new(llm: LlmClient, model: impl Into<String>) -> Self {
        Self {
            llm,
            model: model.into(),
        }
    }

    /// Classify the intent of a query.
    pub async fn classify(&self, query: &Query) -> Result<IntentKind, LlmError> {
        let prompt = build_prompt(&query.text);

        match self.llm.complete_json(&prompt, &self.model, 0.3, None).await {
            Ok(response) => {
                let label = response["intent"].as_str().unwrap_or("general");
                let intent = IntentKind::from_label(label);
                let confidence = response["confidence"].as_f64().unwrap_or(0.5);
                info!(intent = %intent, confidence, "Intent classified");
                if let Some(reasoning) = response["reasoning"].as_str() {
                    debug!(reasoning, "Intent classification reasoning");
                }
                Ok(intent)
            }
            Err(err @ LlmError::AuthFailed { .. }) => Err(err),
            Err(err) => {
                warn!(
                    stage = "classify",
                    error = %err,
                    "Intent classification failed; defaulting to general"
                );
                Ok(IntentKind::General)
            }
        }
    }
}

fn build_prompt(query_text: &str) -> String {
    format!(
        r#"Analyze the following user query and classify its intent into one of these categories:

- informational: general questions seeking factual information
- comparative: questions comparing multiple things
- news: questions about current events or recent news
- code: questions about programming, code examples, or technical implementation
- tutorial: questions seeking step-by-step instructions or how-to guides
- research: academic or in-depth research questions
- general: general conversational queries

Query: "{query_text}"

Respond with a JSON object containing:
- "intent": the category (one of the above)
- "confidence": a number between 0 and 1
- "reasoning": brief explanation for the classification

Example: {{"intent": "news", "confidence": 0.95, "reasoning": "asks about latest developments"}}"#
    )
}
