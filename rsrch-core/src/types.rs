//! Core data model for the research pipeline.
//!
//! Artifacts flow forward through the pipeline stages and are created
//! monotonically: stages receive read-only views of their inputs and return
//! new values. Mutable accumulators live only in the orchestrator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use url::Url;

/// The classified intent of a research query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentKind {
    Informational,
    News,
    Code,
    Research,
    Comparative,
    Tutorial,
    #[default]
    General,
}

impl IntentKind {
    /// Parse an intent label as returned by the classifier model.
    ///
    /// Unknown labels map to `General`.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "informational" => IntentKind::Informational,
            "news" => IntentKind::News,
            "code" => IntentKind::Code,
            "research" => IntentKind::Research,
            "comparative" => IntentKind::Comparative,
            "tutorial" => IntentKind::Tutorial,
            _ => IntentKind::General,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IntentKind::Informational => "informational",
            IntentKind::News => "news",
            IntentKind::Code => "code",
            IntentKind::Research => "research",
            IntentKind::Comparative => "comparative",
            IntentKind::Tutorial => "tutorial",
            IntentKind::General => "general",
        }
    }
}

impl std::fmt::Display for IntentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A research query. Immutable once the intent has been classified.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Query {
    pub text: String,
    pub intent: IntentKind,
}

impl Query {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            intent: IntentKind::General,
        }
    }

    pub fn with_intent(text: impl Into<String>, intent: IntentKind) -> Self {
        Self {
            text: text.into(),
            intent,
        }
    }
}

/// A single planned search query with purpose and priority (1 = highest).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchQuery {
    pub text: String,
    pub purpose: String,
    pub priority: u8,
}

impl SearchQuery {
    pub fn new(text: impl Into<String>, purpose: impl Into<String>, priority: u8) -> Self {
        Self {
            text: text.into(),
            purpose: purpose.into(),
            priority: priority.clamp(1, 5),
        }
    }
}

/// A research plan produced by the planner stage.
///
/// Both `sections` and `search_queries` are nonempty by construction; the
/// planner rejects either list being empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchPlan {
    pub query: Query,
    pub sections: Vec<String>,
    pub search_queries: Vec<SearchQuery>,
    pub rationale: String,
}

/// A single result from a search provider.
///
/// Ranks start at 1 and are contiguous within one provider response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub url: String,
    pub title: String,
    pub snippet: String,
    pub rank: u32,
    pub provider_tag: String,
    /// Filled in by the URL reranker when enabled.
    pub relevance_score: Option<f64>,
}

/// Which scraper tier ultimately produced a piece of content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractorTier {
    Primary,
    Fallback1,
    Fallback2,
}

impl std::fmt::Display for ExtractorTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExtractorTier::Primary => write!(f, "primary"),
            ExtractorTier::Fallback1 => write!(f, "fallback1"),
            ExtractorTier::Fallback2 => write!(f, "fallback2"),
        }
    }
}

/// Markdown content extracted from a URL.
///
/// An empty `markdown_body` is a permitted value; downstream stages must
/// treat it as "content unavailable" and skip the document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapedContent {
    pub url: String,
    pub title: String,
    pub markdown_body: String,
    pub retrieved_at: DateTime<Utc>,
    pub extractor_tier: ExtractorTier,
    pub tables_found: usize,
    pub tables_converted: usize,
}

impl ScrapedContent {
    /// Whether the body carries usable content.
    pub fn is_empty(&self) -> bool {
        self.markdown_body.trim().is_empty()
    }
}

/// Content type derived from URL heuristics, used for model routing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Code,
    Research,
    News,
    Documentation,
    #[default]
    General,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Code => "code",
            ContentType::Research => "research",
            ContentType::News => "news",
            ContentType::Documentation => "documentation",
            ContentType::General => "general",
        }
    }
}

impl std::fmt::Display for ContentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A Markdown pipe table kept verbatim through summarization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkdownTable {
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl MarkdownTable {
    pub fn column_count(&self) -> usize {
        self.header.len()
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

/// A large table reduced to its header, a salient subset of rows, and a
/// deterministically computed aggregate note.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactedTable {
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
    pub note: String,
}

/// A per-source summary produced by the summarizer stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Summary {
    pub source_url: String,
    pub title: String,
    pub text: String,
    pub citations: BTreeSet<String>,
    pub content_type: ContentType,
    pub preserved_tables: Vec<MarkdownTable>,
    pub compacted_tables: Vec<CompactedTable>,
    /// Cosine relevance against the query, set during context assembly.
    pub relevance_score: f64,
}

/// The ranked selection of summaries handed to report generation.
#[derive(Debug, Clone, Default)]
pub struct ContextPackage {
    /// Selected summaries ordered by descending relevance score.
    pub selected_summaries: Vec<Summary>,
    /// Score per summary source URL, each in [0, 1].
    pub scores: HashMap<String, f64>,
    /// How many accumulated summaries were not selected.
    pub excluded_count: usize,
}

/// Result of the reflection stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReflectionResult {
    pub complete: bool,
    pub confidence: f64,
    pub gaps: Vec<String>,
    pub additional_queries: Vec<SearchQuery>,
    pub rationale: String,
}

impl ReflectionResult {
    /// A reflection that terminates the loop, used when the stage fails.
    pub fn completed(rationale: impl Into<String>) -> Self {
        Self {
            complete: true,
            confidence: 0.0,
            gaps: Vec::new(),
            additional_queries: Vec::new(),
            rationale: rationale.into(),
        }
    }
}

/// A numbered source reference in the final report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRef {
    /// 1-based number used by `[Source N]` citations.
    pub number: usize,
    pub url: String,
    pub title: String,
}

/// The assembled research report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub query: Query,
    pub intent: IntentKind,
    /// Report body sections: (title, markdown body).
    pub sections: Vec<(String, String)>,
    pub sources: Vec<SourceRef>,
    pub generated_at: DateTime<Utc>,
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Type of an extracted claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClaimType {
    Factual,
    Statistic,
    Quote,
    Date,
}

impl ClaimType {
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "statistic" => ClaimType::Statistic,
            "quote" => ClaimType::Quote,
            "date" => ClaimType::Date,
            _ => ClaimType::Factual,
        }
    }
}

/// A cited claim extracted from the report body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedClaim {
    pub text: String,
    pub source_number: usize,
    pub source_url: String,
    pub claim_type: ClaimType,
    pub context: String,
}

/// Verdict of verifying one claim against its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Supported,
    Partial,
    Unsupported,
    Contradicted,
}

impl Verdict {
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "supported" => Verdict::Supported,
            "partial" => Verdict::Partial,
            "contradicted" => Verdict::Contradicted,
            _ => Verdict::Unsupported,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Supported => "supported",
            Verdict::Partial => "partial",
            Verdict::Unsupported => "unsupported",
            Verdict::Contradicted => "contradicted",
        }
    }

    /// Adverse verdicts always flag a claim regardless of confidence.
    pub fn is_adverse(&self) -> bool {
        matches!(self, Verdict::Unsupported | Verdict::Contradicted)
    }
}

/// Verification outcome for a single claim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResult {
    pub claim_text: String,
    pub source_url: String,
    pub verdict: Verdict,
    pub confidence: f64,
    pub evidence: Option<String>,
    pub reasoning: String,
}

/// Aggregate verification statistics plus the flagged subset.
#[derive(Debug, Clone, Default)]
pub struct VerificationSummary {
    pub total_claims: usize,
    pub supported: usize,
    pub partial: usize,
    pub unsupported: usize,
    pub contradicted: usize,
    pub avg_confidence: f64,
    pub flagged: Vec<VerificationResult>,
    pub by_source: Vec<(String, Vec<VerificationResult>)>,
}

/// Canonicalize a URL for deduplication.
///
/// Lowercases scheme and host, drops the fragment, and trims a trailing
/// slash. Unparseable inputs are returned trimmed so that identical raw
/// strings still deduplicate.
pub fn canonical_url(raw: &str) -> String {
    let trimmed = raw.trim();
    let Ok(mut parsed) = Url::parse(trimmed) else {
        return trimmed.to_string();
    };
    parsed.set_fragment(None);
    // Url already lowercases scheme and host during parsing.
    let mut out = parsed.to_string();
    if out.ends_with('/') {
        out.pop();
    }
    out
}

/// Extract the lowercase host of a URL, if any.
pub fn url_host(raw: &str) -> Option<String> {
    Url::parse(raw.trim())
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intent_from_label() {
        assert_eq!(IntentKind::from_label("NEWS"), IntentKind::News);
        assert_eq!(IntentKind::from_label("code"), IntentKind::Code);
        assert_eq!(IntentKind::from_label(" research "), IntentKind::Research);
        assert_eq!(IntentKind::from_label("nonsense"), IntentKind::General);
    }

    #[test]
    fn test_search_query_priority_clamped() {
        let q = SearchQuery::new("a", "b", 9);
        assert_eq!(q.priority, 5);
        let q = SearchQuery::new("a", "b", 0);
        assert_eq!(q.priority, 1);
    }

    #[test]
    fn test_canonical_url_lowercases_scheme_and_host() {
        assert_eq!(
            canonical_url("HTTPS://Example.COM/Path"),
            "https://example.com/Path"
        );
    }

    #[test]
    fn test_canonical_url_strips_fragment() {
        assert_eq!(
            canonical_url("https://example.com/page#section-2"),
            "https://example.com/page"
        );
    }

    #[test]
    fn test_canonical_url_trims_trailing_slash() {
        assert_eq!(
            canonical_url("https://example.com/docs/"),
            "https://example.com/docs"
        );
    }

    #[test]
    fn test_canonical_url_root_forms_dedupe() {
        assert_eq!(canonical_url("https://example.com/"), "https://example.com");
        assert_eq!(canonical_url("https://example.com"), "https://example.com");
    }

    #[test]
    fn test_canonical_url_identical_inputs_dedupe() {
        let a = canonical_url("https://Example.com/a#x");
        let b = canonical_url("https://example.com/a");
        assert_eq!(a, b);
    }

    #[test]
    fn test_canonical_url_unparseable_passthrough() {
        assert_eq!(canonical_url("  not a url  "), "not a url");
    }

    #[test]
    fn test_url_host() {
        assert_eq!(
            url_host("https://News.Example.com/x"),
            Some("news.example.com".to_string())
        );
        assert_eq!(url_host("garbage"), None);
    }

    #[test]
    fn test_verdict_parsing_and_flagging() {
        assert_eq!(Verdict::from_label("Supported"), Verdict::Supported);
        assert_eq!(Verdict::from_label("unknown"), Verdict::Unsupported);
        assert!(Verdict::Contradicted.is_adverse());
        assert!(!Verdict::Partial.is_adverse());
    }

    #[test]
    fn test_scraped_content_empty() {
        let content = ScrapedContent {
            url: "https://example.com".into(),
            title: "t".into(),
            markdown_body: "   \n".into(),
            retrieved_at: Utc::now(),
            extractor_tier: ExtractorTier::Fallback2,
            tables_found: 0,
            tables_converted: 0,
        };
        assert!(content.is_empty());
    }
}
