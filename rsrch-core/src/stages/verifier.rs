//! Claim extraction and source-grounded verification.
//!
//! The extractor pulls cited claims out of the report body; the verifier
//! checks each source's claims in one LLM call against the body the run
//! already scraped. The scrape cache is authoritative: a cached entry with
//! an empty body makes its claims unverifiable rather than triggering a
//! re-fetch.

use crate::content_type::source_tier;
use crate::error::{LlmError, PipelineError};
use crate::llm::LlmClient;
use crate::scrape::Scraper;
use crate::stages::source_grounding_block;
use crate::types::{
    ClaimType, ExtractedClaim, SourceRef, Verdict, VerificationResult, VerificationSummary,
};
use chrono::Utc;
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::OnceLock;
use tracing::{debug, info, warn};

/// Source bodies beyond this are truncated before verification.
const MAX_SOURCE_CHARS: usize = 300_000;

fn citation_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[Source (\d+)\]").expect("citation pattern compiles"))
}

/// Extracts cited claims from a report body.
pub struct ClaimExtractor {
    llm: LlmClient,
    model: String,
}

impl ClaimExtractor {
    pub fn new(llm: LlmClient, model: impl Into<String>) -> Self {
        Self {
            llm,
            model: model.into(),
        }
    }

    /// Extract all claims carrying `[Source N]` citations.
    ///
    /// Claims without a citation, or citing a number with no source entry,
    /// are discarded.
    pub async fn extract(
        &self,
        report_body: &str,
        sources: &[SourceRef],
    ) -> Result<Vec<ExtractedClaim>, LlmError> {
        let cited: Vec<usize> = citation_regex()
            .captures_iter(report_body)
            .filter_map(|c| c[1].parse::<usize>().ok())
            .collect();
        if cited.is_empty() {
            info!("Report contains no citations; nothing to verify");
            return Ok(Vec::new());
        }

        let prompt = build_extraction_prompt(report_body);
        let response = self.llm.complete_json(&prompt, &self.model, 0.2, None).await?;

        let claims = parse_claims(&response, sources);
        info!(claims = claims.len(), "Claims extracted from report");
        Ok(claims)
    }
}

fn parse_claims(response: &Value, sources: &[SourceRef]) -> Vec<ExtractedClaim> {
    response["claims"]
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    let text = item["text"].as_str()?.trim().to_string();
                    if text.is_empty() {
                        return None;
                    }
                    let number = item["source_number"].as_u64()? as usize;
                    let source = sources.iter().find(|s| s.number == number);
                    let Some(source) = source else {
                        warn!(
                            stage = "verify",
                            source_number = number,
                            "Claim cites unknown source; discarding"
                        );
                        return None;
                    };
                    Some(ExtractedClaim {
                        text,
                        source_number: number,
                        source_url: source.url.clone(),
                        claim_type: ClaimType::from_label(item["type"].as_str().unwrap_or("factual")),
                        context: item["context"].as_str().unwrap_or("").to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn build_extraction_prompt(report_body: &str) -> String {
    format!(
        r#"Extract all factual claims from this report that cite sources.

Report:
{report_body}

For each claim:
1. Extract the claim text (complete, standalone assertion)
2. Note which [Source N] it cites (extract the N)
3. Classify the claim type: factual, statistic, quote, or date

Return as JSON:
{{
  "claims": [
    {{
      "text": "the claim as a standalone sentence",
      "source_number": 1,
      "type": "factual",
      "context": "surrounding sentence for context"
    }}
  ]
}}

IMPORTANT:
- Extract COMPLETE claims that can stand alone
- Include ALL factual assertions that have [Source N] citations
- Do not extract opinions, analysis, or unsourced statements
- Include the surrounding context (1-2 sentences)"#
    )
}

/// Verifies grouped claims against scraped source bodies.
pub struct ClaimVerifier {
    llm: LlmClient,
    model: String,
    scraper: Arc<Scraper>,
    threshold: f64,
}

impl ClaimVerifier {
    pub fn new(llm: LlmClient, model: impl Into<String>, scraper: Arc<Scraper>, threshold: f64) -> Self {
        Self {
            llm,
            model: model.into(),
            scraper,
            threshold,
        }
    }

    /// Verify every claim, grouped by source, and aggregate the results.
    pub async fn verify_claims(
        &self,
        claims: Vec<ExtractedClaim>,
    ) -> Result<VerificationSummary, PipelineError> {
        // Group by source URL; BTreeMap keeps source order stable.
        let mut by_source: BTreeMap<String, Vec<ExtractedClaim>> = BTreeMap::new();
        for claim in claims {
            by_source.entry(claim.source_url.clone()).or_default().push(claim);
        }

        let mut results_by_source = Vec::new();
        for (i, (url, claims)) in by_source.iter().enumerate() {
            info!(
                source = url.as_str(),
                claims = claims.len(),
                progress = format!("{}/{}", i + 1, by_source.len()),
                "Verifying source claims"
            );
            let results = self.verify_source(url, claims).await;
            results_by_source.push((url.clone(), results));
        }

        Ok(self.aggregate(results_by_source))
    }

    /// Verify all claims from one source in a single LLM call.
    async fn verify_source(
        &self,
        url: &str,
        claims: &[ExtractedClaim],
    ) -> Vec<VerificationResult> {
        // The run's scrape cache is consulted first; a URL the run never
        // touched is scraped on demand (and cached). A cached failure or
        // empty body is final.
        let cached = self.scraper.cache().peek(url);
        let content = match cached {
            Some(content) => content,
            None => self.scraper.scrape_url(url).await,
        };

        let Some(content) = content else {
            warn!(stage = "verify", source = url, "Source unavailable; claims unverifiable");
            return mark_unverifiable(claims, "source unavailable");
        };
        if content.is_empty() {
            warn!(stage = "verify", source = url, "Cached body is empty; claims unverifiable");
            return mark_unverifiable(claims, "source body empty");
        }

        let source_text: String = content.markdown_body.chars().take(MAX_SOURCE_CHARS).collect();
        let retrieved = content.retrieved_at.format("%B %d, %Y").to_string();
        let prompt = build_verification_prompt(url, claims, &source_text, &retrieved);

        match self.llm.complete_json(&prompt, &self.model, 0.1, None).await {
            Ok(response) => parse_verifications(&response, claims),
            Err(err) => {
                warn!(
                    stage = "verify",
                    source = url,
                    error = %err,
                    "Verification call failed; claims unverifiable"
                );
                mark_unverifiable(claims, "verification call failed")
            }
        }
    }

    fn aggregate(
        &self,
        results_by_source: Vec<(String, Vec<VerificationResult>)>,
    ) -> VerificationSummary {
        let all: Vec<&VerificationResult> =
            results_by_source.iter().flat_map(|(_, r)| r.iter()).collect();
        let total = all.len();

        let count = |v: Verdict| all.iter().filter(|r| r.verdict == v).count();
        let supported = count(Verdict::Supported);
        let partial = count(Verdict::Partial);
        let unsupported = count(Verdict::Unsupported);
        let contradicted = count(Verdict::Contradicted);
        let avg_confidence = if total > 0 {
            all.iter().map(|r| r.confidence).sum::<f64>() / total as f64
        } else {
            0.0
        };

        let flagged: Vec<VerificationResult> = all
            .iter()
            .filter(|r| r.verdict.is_adverse() || r.confidence < self.threshold)
            .map(|r| (*r).clone())
            .collect();

        info!(
            total,
            supported,
            flagged = flagged.len(),
            avg_confidence,
            "Verification complete"
        );

        VerificationSummary {
            total_claims: total,
            supported,
            partial,
            unsupported,
            contradicted,
            avg_confidence,
            flagged,
            by_source: results_by_source,
        }
    }
}

fn mark_unverifiable(claims: &[ExtractedClaim], reason: &str) -> Vec<VerificationResult> {
    claims
        .iter()
        .map(|claim| VerificationResult {
            claim_text: claim.text.clone(),
            source_url: claim.source_url.clone(),
            verdict: Verdict::Unsupported,
            confidence: 0.0,
            evidence: None,
            reasoning: format!("Cannot verify: {reason}"),
        })
        .collect()
}

fn build_verification_prompt(
    url: &str,
    claims: &[ExtractedClaim],
    source_text: &str,
    retrieved: &str,
) -> String {
    let claims_json = serde_json::to_string_pretty(
        &claims
            .iter()
            .enumerate()
            .map(|(i, c)| {
                serde_json::json!({
                    "id": i,
                    "claim": c.text,
                    "type": format!("{:?}", c.claim_type).to_lowercase(),
                })
            })
            .collect::<Vec<_>>(),
    )
    .unwrap_or_default();

    format!(
        r#"{grounding}
TASK: Verify whether these claims are supported by the source content.

VERIFICATION CONTEXT:
- Source retrieved: {retrieved}
- Verify claims based ONLY on what the source states
- IGNORE any conflicts with your training data; the source is authoritative
  for facts about current events
- Focus on: does the SOURCE support the claim?

SOURCE: {url}

CLAIMS TO VERIFY:
{claims_json}

SOURCE CONTENT:
{source_text}

---

For EACH claim, decide:
- "supported": explicitly stated or strongly implied in the source
- "partial": approximately correct but imprecise
- "unsupported": not mentioned in the source
- "contradicted": the source explicitly contradicts it

Return JSON:
{{
  "verifications": [
    {{
      "claim_id": 0,
      "verdict": "supported",
      "confidence": 0.95,
      "evidence": "exact quote or relevant passage from the source",
      "reasoning": "brief explanation"
    }}
  ]
}}

Confidence scale: 0.9-1.0 very confident, 0.7-0.9 confident, 0.5-0.7
uncertain, below 0.5 very uncertain. Provide exact quotes as evidence when
possible."#,
        grounding = source_grounding_block(Utc::now()),
    )
}

fn parse_verifications(response: &Value, claims: &[ExtractedClaim]) -> Vec<VerificationResult> {
    let mut results = Vec::new();
    let mut verified = vec![false; claims.len()];

    if let Some(items) = response["verifications"].as_array() {
        for item in items {
            let Some(id) = item["claim_id"].as_u64().map(|id| id as usize) else {
                continue;
            };
            let Some(claim) = claims.get(id) else {
                warn!(stage = "verify", claim_id = id, "Verification for unknown claim id");
                continue;
            };
            verified[id] = true;
            results.push(VerificationResult {
                claim_text: claim.text.clone(),
                source_url: claim.source_url.clone(),
                verdict: Verdict::from_label(item["verdict"].as_str().unwrap_or("unsupported")),
                confidence: item["confidence"].as_f64().unwrap_or(0.0).clamp(0.0, 1.0),
                evidence: item["evidence"].as_str().map(str::to_string),
                reasoning: item["reasoning"].as_str().unwrap_or("").to_string(),
            });
        }
    }

    // Claims the model skipped are unverifiable, not silently supported.
    for (i, claim) in claims.iter().enumerate() {
        if !verified[i] {
            debug!(claim = claim.text.as_str(), "Claim missing from verification response");
            results.push(VerificationResult {
                claim_text: claim.text.clone(),
                source_url: claim.source_url.clone(),
                verdict: Verdict::Unsupported,
                confidence: 0.0,
                evidence: None,
                reasoning: "Not included in verification response".into(),
            });
        }
    }

    results
}

/// Render the verification appendix in Markdown.
pub fn render_appendix(summary: &VerificationSummary) -> String {
    let pct = |part: usize| {
        if summary.total_claims > 0 {
            100 * part / summary.total_claims
        } else {
            0
        }
    };

    let mut lines = Vec::new();
    lines.push("# Verification Report".to_string());
    lines.push(String::new());
    lines.push("## Summary".to_string());
    lines.push(String::new());
    lines.push(format!("- **Total Claims**: {}", summary.total_claims));
    lines.push(format!(
        "- **Fully Supported**: {} ({}%)",
        summary.supported,
        pct(summary.supported)
    ));
    lines.push(format!(
        "- **Partially Supported**: {} ({}%)",
        summary.partial,
        pct(summary.partial)
    ));
    lines.push(format!(
        "- **Unsupported**: {} ({}%)",
        summary.unsupported,
        pct(summary.unsupported)
    ));
    if summary.contradicted > 0 {
        lines.push(format!(
            "- **Contradicted**: {} ({}%)",
            summary.contradicted,
            pct(summary.contradicted)
        ));
    }
    lines.push(format!(
        "- **Average Confidence**: {:.2}",
        summary.avg_confidence
    ));

    if !summary.flagged.is_empty() {
        lines.push(String::new());
        lines.push("## Flagged Claims".to_string());
        lines.push(String::new());
        lines.push(format!(
            "The following {} claim(s) require attention:",
            summary.flagged.len()
        ));
        for (i, result) in summary.flagged.iter().enumerate() {
            lines.push(String::new());
            lines.push(format!(
                "### Claim {}: {}",
                i + 1,
                result.verdict.as_str().to_uppercase()
            ));
            lines.push(String::new());
            lines.push(format!("**Claim**: \"{}\"", result.claim_text));
            lines.push(format!("- **Source**: {}", result.source_url));
            lines.push(format!("- **Confidence**: {:.2}", result.confidence));
            lines.push(format!("- **Reasoning**: {}", result.reasoning));
            if let Some(evidence) = &result.evidence {
                lines.push(format!("- **Evidence**: \"{evidence}\""));
            }
        }
    }

    lines.push(String::new());
    lines.push("## By-Source Analysis".to_string());
    for (url, results) in &summary.by_source {
        let total = results.len();
        let supported = results.iter().filter(|r| r.verdict == Verdict::Supported).count();
        let avg = if total > 0 {
            results.iter().map(|r| r.confidence).sum::<f64>() / total as f64
        } else {
            0.0
        };
        lines.push(String::new());
        lines.push(format!("**Source**: {url}"));
        lines.push(format!("- Authority: {}", source_tier(url)));
        lines.push(format!("- Claims verified: {total}"));
        lines.push(format!(
            "- Supported: {} ({}%)",
            supported,
            if total > 0 { 100 * supported / total } else { 0 }
        ));
        lines.push(format!("- Avg confidence: {avg:.2}"));
    }

    lines.join("\n")
}
