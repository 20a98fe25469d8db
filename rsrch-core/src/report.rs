//! Report generation, citation validation, and file output.

use crate::error::PipelineError;
use crate::llm::LlmClient;
use crate::stages::source_grounding_block;
use crate::types::{ContextPackage, Query, ReflectionResult, Report, ResearchPlan, SourceRef};
use chrono::{DateTime, Utc};
use regex::Regex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{info, warn};

fn citation_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[Source (\d+)\]").expect("citation pattern compiles"))
}

/// Generates the final Markdown report from the assembled context.
pub struct ReportGenerator {
    llm: LlmClient,
    model: String,
    max_tokens: u32,
}

impl ReportGenerator {
    pub fn new(llm: LlmClient, model: impl Into<String>, max_tokens: u32) -> Self {
        Self {
            llm,
            model: model.into(),
            max_tokens,
        }
    }

    /// Generate the report. Every `[Source N]` citation in the result
    /// resolves to an entry in `sources`; unresolvable citations are
    /// stripped with a warning.
    pub async fn generate(
        &self,
        query: &Query,
        plan: &ResearchPlan,
        context: &ContextPackage,
        reflection: Option<&ReflectionResult>,
    ) -> Result<Report, PipelineError> {
        let sources: Vec<SourceRef> = context
            .selected_summaries
            .iter()
            .enumerate()
            .map(|(i, s)| SourceRef {
                number: i + 1,
                url: s.source_url.clone(),
                title: s.title.clone(),
            })
            .collect();

        let prompt = build_report_prompt(query, plan, context);
        let body = self
            .llm
            .complete_text(&prompt, &self.model, 0.2, Some(self.max_tokens))
            .await?;

        let (body, removed) = validate_citations(&body, sources.len());
        if removed > 0 {
            warn!(
                stage = "report",
                removed,
                "Stripped citations with no matching source entry"
            );
        }

        let research_complete = reflection.map(|r| r.complete).unwrap_or(true);
        let mut metadata: HashMap<String, serde_json::Value> = HashMap::new();
        metadata.insert("intent".into(), query.intent.as_str().into());
        metadata.insert("num_sources".into(), sources.len().into());
        metadata.insert("research_complete".into(), research_complete.into());
        metadata.insert(
            "status".into(),
            if research_complete { "complete" } else { "incomplete" }.into(),
        );
        if let Some(reflection) = reflection {
            metadata.insert(
                "missing_information".into(),
                serde_json::to_value(&reflection.gaps).unwrap_or_default(),
            );
            metadata.insert(
                "reflection_rationale".into(),
                reflection.rationale.clone().into(),
            );
        }

        let report = Report {
            query: query.clone(),
            intent: query.intent,
            sections: split_sections(&body),
            sources,
            generated_at: Utc::now(),
            metadata,
        };
        info!(
            sections = report.sections.len(),
            sources = report.sources.len(),
            "Report generated"
        );
        Ok(report)
    }
}

fn build_report_prompt(query: &Query, plan: &ResearchPlan, context: &ContextPackage) -> String {
    let sections_list: String = plan
        .sections
        .iter()
        .map(|s| format!("- {s}"))
        .collect::<Vec<_>>()
        .join("\n");
    let sources_text: String = context
        .selected_summaries
        .iter()
        .enumerate()
        .map(|(i, s)| {
            format!(
                "Source {}: {}\nTitle: {}\n{}",
                i + 1,
                s.source_url,
                s.title,
                s.text
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n");

    format!(
        r###"{grounding}
Generate a comprehensive research report based on the following research.

Query: "{query}"
Intent: {intent}

Report Sections to Cover:
{sections_list}

Research Summaries:
{sources_text}

QUALITY GUIDELINES:
1. You are writing a FACTUAL research report, not a creative story
2. Do not invent contradictions or disputes not present in the sources
3. If all sources agree on something, report it as established fact
4. Only report what the sources actually say
5. Use [Source N] citations for every factual claim

Structure the report as Markdown with:
1. An executive summary
2. One "## " section per listed report section
3. Key findings with [Source N] citations
4. A conclusion based on the evidence"###,
        grounding = source_grounding_block(Utc::now()),
        query = query.text,
        intent = query.intent,
    )
}

/// Remove `[Source N]` citations whose N has no source entry.
///
/// Returns the cleaned body and the number of citations removed, so the
/// every-citation-resolves invariant holds for anything written to disk.
pub fn validate_citations(body: &str, source_count: usize) -> (String, usize) {
    let mut removed = 0;
    let cleaned = citation_regex().replace_all(body, |caps: &regex::Captures<'_>| {
        let number: usize = caps[1].parse().unwrap_or(0);
        if number >= 1 && number <= source_count {
            caps[0].to_string()
        } else {
            removed += 1;
            String::new()
        }
    });
    (cleaned.into_owned(), removed)
}

/// Split a Markdown body into `(title, body)` pairs on `## ` headings.
///
/// Text before the first heading becomes an "Executive Summary" section.
fn split_sections(body: &str) -> Vec<(String, String)> {
    let mut sections: Vec<(String, String)> = Vec::new();
    let mut title = "Executive Summary".to_string();
    let mut buffer: Vec<&str> = Vec::new();

    for line in body.lines() {
        if let Some(heading) = line.strip_prefix("## ") {
            let text = buffer.join("\n").trim().to_string();
            if !text.is_empty() {
                sections.push((std::mem::take(&mut title), text));
            }
            title = heading.trim().to_string();
            buffer.clear();
        } else {
            buffer.push(line);
        }
    }
    let text = buffer.join("\n").trim().to_string();
    if !text.is_empty() {
        sections.push((title, text));
    }

    if sections.is_empty() {
        sections.push(("Report".to_string(), String::new()));
    }
    sections
}

/// Render the full report file as Markdown.
///
/// Structure: H1 title, metadata block, section bodies, `## Sources`,
/// optional `## Research Limitations`, optional verification appendix.
pub fn render_report(report: &Report, verification_appendix: Option<&str>) -> String {
    let mut out = String::new();
    out.push_str("# Research Report\n\n");
    out.push_str(&format!("**Query:** {}\n\n", report.query.text));
    out.push_str(&format!("**Intent:** {}\n\n", report.intent));
    out.push_str(&format!(
        "**Generated:** {}\n\n",
        report.generated_at.format("%Y-%m-%d %H:%M:%S")
    ));
    out.push_str("---\n\n");

    for (i, (title, body)) in report.sections.iter().enumerate() {
        out.push_str(&format!("## {title}\n\n{body}\n"));
        if i + 1 < report.sections.len() {
            out.push('\n');
        }
    }

    if !report.sources.is_empty() {
        out.push_str("\n---\n\n## Sources\n\n");
        for source in &report.sources {
            out.push_str(&format!(
                "**[Source {}]** {}\n- URL: {}\n\n",
                source.number, source.title, source.url
            ));
        }
    }

    let research_complete = report
        .metadata
        .get("research_complete")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);
    if !research_complete {
        let gaps: Vec<String> = report
            .metadata
            .get("missing_information")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();
        if !gaps.is_empty() {
            out.push_str("\n---\n\n## Research Limitations\n\n");
            out.push_str(
                "This report used the maximum number of research iterations, but the \
                 following information gaps were identified:\n\n",
            );
            for (i, gap) in gaps.iter().enumerate() {
                out.push_str(&format!("{}. {gap}\n", i + 1));
            }
            if let Some(rationale) = report
                .metadata
                .get("reflection_rationale")
                .and_then(|v| v.as_str())
                .filter(|r| !r.is_empty())
            {
                out.push_str(&format!("\n**Assessment:** {rationale}\n"));
            }
        }
    }

    if let Some(appendix) = verification_appendix {
        out.push_str(&format!("\n---\n\n{appendix}\n"));
    }

    out
}

/// Write the rendered report to `<output_dir>/report_YYYYMMDD_HHMMSS.md`.
pub fn write_report(
    output_dir: &Path,
    rendered: &str,
    generated_at: DateTime<Utc>,
) -> Result<PathBuf, PipelineError> {
    std::fs::create_dir_all(output_dir)?;
    let filename = format!("report_{}.md", generated_at.format("%Y%m%d_%H%M%S"));
    let path = output_dir.join(filename);
    std::fs::write(&path, rendered)?;
    info!(path = %path.display(), "Report written");
    Ok(path)
}
