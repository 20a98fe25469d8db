//! Content-type and source-authority classification from URL heuristics.
//!
//! Pure functions over hostname and path; no network. Content type drives
//! summarizer model routing, authority tiers weight the verification
//! report's by-source analysis.

use crate::types::ContentType;
use serde::{Deserialize, Serialize};
use url::Url;

/// Research and academic hosts.
const RESEARCH_DOMAINS: &[&str] = &[
    "arxiv.org",
    "scholar.google.com",
    "plos.org",
    "nature.com",
    "science.org",
    "sciencedirect.com",
    "springer.com",
    "ieee.org",
    "acm.org",
    "pubmed.ncbi.nlm.nih.gov",
    "nih.gov",
    "doi.org",
    "jstor.org",
    "researchgate.net",
    "biorxiv.org",
    "medrxiv.org",
];

/// Code hosting, Q&A, and package registries.
const CODE_DOMAINS: &[&str] = &[
    "github.com",
    "gitlab.com",
    "stackoverflow.com",
    "stackexchange.com",
    "bitbucket.org",
    "codepen.io",
    "repl.it",
    "codesandbox.io",
    "glitch.com",
    "pypi.org",
    "npmjs.com",
    "crates.io",
    "packagist.org",
    "rubygems.org",
    "maven.org",
    "nuget.org",
];

/// News and media hosts.
const NEWS_DOMAINS: &[&str] = &[
    "nytimes.com",
    "apnews.com",
    "reuters.com",
    "bbc.com",
    "cnn.com",
    "theguardian.com",
    "washingtonpost.com",
    "wsj.com",
    "bloomberg.com",
    "ft.com",
    "npr.org",
    "axios.com",
    "politico.com",
    "techcrunch.com",
    "theverge.com",
    "wired.com",
    "arstechnica.com",
    "forbes.com",
    "businessinsider.com",
];

/// Hostname prefixes that indicate documentation sites.
const DOCS_HOST_PREFIXES: &[&str] = &["docs.", "developer.", "dev.", "api."];

/// Path segments that indicate documentation pages.
const DOCS_PATH_SEGMENTS: &[&str] = &["documentation", "reference", "manual", "wiki"];

/// Exact or subdomain match against a domain list.
fn match_domain(host: &str, domains: &[&str]) -> bool {
    domains
        .iter()
        .any(|d| host == *d || host.ends_with(&format!(".{d}")))
}

/// URL-based content classifier, extensible with configured extra domains.
#[derive(Debug, Clone, Default)]
pub struct ContentClassifier {
    extra_research: Vec<String>,
    extra_code: Vec<String>,
    extra_news: Vec<String>,
}

impl ContentClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extend the built-in domain lists from configuration.
    pub fn with_extra_domains(
        research: Vec<String>,
        code: Vec<String>,
        news: Vec<String>,
    ) -> Self {
        Self {
            extra_research: research,
            extra_code: code,
            extra_news: news,
        }
    }

    /// Classify a URL into a content type.
    ///
    /// Uses parsed hostname and path so that a domain name appearing inside
    /// a path does not cause a false positive.
    pub fn classify(&self, url: &str) -> ContentType {
        let Ok(parsed) = Url::parse(url.trim()) else {
            return ContentType::General;
        };
        let Some(host) = parsed.host_str().map(|h| h.to_ascii_lowercase()) else {
            return ContentType::General;
        };
        let path = parsed.path().to_ascii_lowercase();

        let extra = |list: &[String]| {
            list.iter()
                .any(|d| host == *d || host.ends_with(&format!(".{d}")))
        };

        if match_domain(&host, RESEARCH_DOMAINS) || extra(&self.extra_research) {
            return ContentType::Research;
        }
        if match_domain(&host, CODE_DOMAINS) || extra(&self.extra_code) {
            return ContentType::Code;
        }
        if match_domain(&host, NEWS_DOMAINS) || extra(&self.extra_news) {
            return ContentType::News;
        }
        if DOCS_HOST_PREFIXES.iter().any(|p| host.starts_with(p)) {
            return ContentType::Documentation;
        }
        let path_parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
        if DOCS_PATH_SEGMENTS
            .iter()
            .any(|segment| path_parts.contains(segment))
        {
            return ContentType::Documentation;
        }

        ContentType::General
    }
}

/// Authority tier of a source domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceTier {
    /// Peer-reviewed, government, primary databases.
    Tier1,
    /// Major news, official documentation, established organizations.
    Tier2,
    /// Wikis, forums, user-generated content.
    Tier3,
    /// Unknown blogs, unclassifiable.
    Tier4,
}

impl std::fmt::Display for SourceTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceTier::Tier1 => write!(f, "tier 1 (authoritative)"),
            SourceTier::Tier2 => write!(f, "tier 2 (professional)"),
            SourceTier::Tier3 => write!(f, "tier 3 (community)"),
            SourceTier::Tier4 => write!(f, "tier 4 (unvetted)"),
        }
    }
}

const TIER_1_DOMAINS: &[&str] = &[
    "nature.com",
    "science.org",
    "sciencedirect.com",
    "springer.com",
    "ieee.org",
    "acm.org",
    "pubmed.ncbi.nlm.nih.gov",
    "nih.gov",
    "doi.org",
    "jstor.org",
    "plos.org",
    "biorxiv.org",
    "medrxiv.org",
    "nejm.org",
    "thelancet.com",
    "bmj.com",
    "cell.com",
    "pnas.org",
    "wiley.com",
    "oxfordjournals.org",
    "academic.oup.com",
    "annualreviews.org",
    "jamanetwork.com",
    "acc.org",
    "ahajournals.org",
    "who.int",
    "europa.eu",
    "clinicaltrials.gov",
];

const TIER_1_TLDS: &[&str] = &[".gov", ".edu", ".mil"];

const TIER_2_DOMAINS: &[&str] = &[
    "nytimes.com",
    "apnews.com",
    "reuters.com",
    "bbc.com",
    "bbc.co.uk",
    "washingtonpost.com",
    "wsj.com",
    "bloomberg.com",
    "ft.com",
    "npr.org",
    "economist.com",
    "cnn.com",
    "theguardian.com",
    "techcrunch.com",
    "theverge.com",
    "wired.com",
    "arstechnica.com",
    "forbes.com",
    "developer.mozilla.org",
    "learn.microsoft.com",
    "cloud.google.com",
    "aws.amazon.com",
    "arxiv.org",
    "researchgate.net",
    "scholar.google.com",
    "medscape.com",
    "statnews.com",
    "fiercepharma.com",
];

const TIER_3_DOMAINS: &[&str] = &[
    "wikipedia.org",
    "reddit.com",
    "stackoverflow.com",
    "stackexchange.com",
    "medium.com",
    "quora.com",
    "github.com",
    "gitlab.com",
    "dev.to",
    "hashnode.dev",
    "substack.com",
    "wordpress.com",
    "blogspot.com",
    "fandom.com",
    "healthline.com",
    "webmd.com",
    "verywellhealth.com",
];

/// Classify a source URL into an authority tier.
pub fn source_tier(url: &str) -> SourceTier {
    let Some(host) = Url::parse(url.trim())
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
    else {
        return SourceTier::Tier4;
    };

    if TIER_1_TLDS.iter().any(|tld| host.ends_with(tld)) {
        return SourceTier::Tier1;
    }
    if match_domain(&host, TIER_1_DOMAINS) {
        return SourceTier::Tier1;
    }
    if match_domain(&host, TIER_2_DOMAINS) {
        return SourceTier::Tier2;
    }
    if DOCS_HOST_PREFIXES.iter().any(|p| host.starts_with(p)) {
        return SourceTier::Tier2;
    }
    if match_domain(&host, TIER_3_DOMAINS) {
        return SourceTier::Tier3;
    }
    SourceTier::Tier4
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_research_domains() {
        let classifier = ContentClassifier::new();
        assert_eq!(
            classifier.classify("https://arxiv.org/abs/2301.00001"),
            ContentType::Research
        );
        assert_eq!(
            classifier.classify("https://www.nature.com/articles/x"),
            ContentType::Research
        );
    }

    #[test]
    fn test_code_domains() {
        let classifier = ContentClassifier::new();
        assert_eq!(
            classifier.classify("https://github.com/rust-lang/rust"),
            ContentType::Code
        );
        assert_eq!(
            classifier.classify("https://stackoverflow.com/questions/1"),
            ContentType::Code
        );
    }

    #[test]
    fn test_news_domains() {
        let classifier = ContentClassifier::new();
        assert_eq!(
            classifier.classify("https://www.reuters.com/world/x"),
            ContentType::News
        );
    }

    #[test]
    fn test_docs_host_prefix() {
        let classifier = ContentClassifier::new();
        assert_eq!(
            classifier.classify("https://docs.python.org/3/library/"),
            ContentType::Documentation
        );
        assert_eq!(
            classifier.classify("https://api.example.com/v2"),
            ContentType::Documentation
        );
    }

    #[test]
    fn test_docs_path_segment() {
        let classifier = ContentClassifier::new();
        assert_eq!(
            classifier.classify("https://example.com/reference/types"),
            ContentType::Documentation
        );
        assert_eq!(
            classifier.classify("https://example.com/product/manual"),
            ContentType::Documentation
        );
    }

    #[test]
    fn test_domain_in_path_is_not_matched() {
        let classifier = ContentClassifier::new();
        // "arxiv.org" inside the path must not classify as research.
        assert_eq!(
            classifier.classify("https://example.com/blog/arxiv.org-roundup"),
            ContentType::General
        );
    }

    #[test]
    fn test_subdomain_match() {
        let classifier = ContentClassifier::new();
        assert_eq!(
            classifier.classify("https://gist.github.com/u/abc"),
            ContentType::Code
        );
    }

    #[test]
    fn test_unparseable_defaults_general() {
        let classifier = ContentClassifier::new();
        assert_eq!(classifier.classify("not a url"), ContentType::General);
    }

    #[test]
    fn test_extra_domains_extend_lists() {
        let classifier = ContentClassifier::with_extra_domains(
            vec!["papers.example.org".into()],
            vec![],
            vec![],
        );
        assert_eq!(
            classifier.classify("https://papers.example.org/p/42"),
            ContentType::Research
        );
    }

    #[test]
    fn test_source_tier_gov_tld() {
        assert_eq!(source_tier("https://www.cdc.gov/flu"), SourceTier::Tier1);
        assert_eq!(source_tier("https://mit.edu/research"), SourceTier::Tier1);
    }

    #[test]
    fn test_source_tier_journals_without_gov_tld() {
        // Journal publishers carry no .gov/.edu TLD; the domain list alone
        // must place them in tier 1.
        assert_eq!(
            source_tier("https://jamanetwork.com/journals/jama/article/1"),
            SourceTier::Tier1
        );
        assert_eq!(
            source_tier("https://academic.oup.com/brain/article/2"),
            SourceTier::Tier1
        );
        assert_eq!(source_tier("https://www.cell.com/issue"), SourceTier::Tier1);
    }

    #[test]
    fn test_source_tier_news_is_tier2() {
        assert_eq!(
            source_tier("https://www.reuters.com/article/x"),
            SourceTier::Tier2
        );
    }

    #[test]
    fn test_source_tier_community_is_tier3() {
        assert_eq!(
            source_tier("https://en.wikipedia.org/wiki/HTTP/3"),
            SourceTier::Tier3
        );
        assert_eq!(
            source_tier("https://github.com/example/repo"),
            SourceTier::Tier3
        );
        assert_eq!(
            source_tier("https://www.webmd.com/a-to-z-guides/x"),
            SourceTier::Tier3
        );
    }

    #[test]
    fn test_source_tier_unknown_is_tier4() {
        assert_eq!(source_tier("https://random-blog.example.com"), SourceTier::Tier4);
        assert_eq!(source_tier("garbage"), SourceTier::Tier4);
    }
}
