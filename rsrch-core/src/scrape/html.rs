//! HTML to Markdown conversion with pipe-table preservation.
//!
//! Best-effort DOM walk: headings, paragraphs, lists, links, emphasis,
//! code blocks, blockquotes, images, rules, and tables. Non-content
//! elements (script, style, nav, chrome) are dropped. Conversion is
//! deterministic; no I/O happens here.

use regex::Regex;
use scraper::{ElementRef, Html, Node};
use std::sync::OnceLock;

/// Cell text longer than this is truncated with a trailing ellipsis.
const MAX_CELL_CHARS: usize = 200;

/// Elements dropped entirely during conversion.
const SKIP_ELEMENTS: &[&str] = &["script", "style", "nav", "footer", "header", "aside", "noscript"];

/// Result of converting one HTML document.
#[derive(Debug, Clone)]
pub struct Converted {
    pub markdown: String,
    pub title: Option<String>,
    pub tables_found: usize,
    pub tables_converted: usize,
}

/// HTML to Markdown converter.
#[derive(Debug, Clone)]
pub struct HtmlToMarkdown {
    preserve_tables: bool,
}

impl HtmlToMarkdown {
    pub fn new(preserve_tables: bool) -> Self {
        Self { preserve_tables }
    }

    /// Convert a full HTML document.
    pub fn convert(&self, html: &str) -> Converted {
        let document = Html::parse_document(html);

        let title = document
            .select(&selector("title"))
            .next()
            .map(|el| collapse_ws(&el.text().collect::<String>()))
            .filter(|t| !t.is_empty());

        // Count every table in the document, including nested ones that
        // only flatten into a parent cell.
        let tables_found = document.select(&selector("table")).count();

        let mut stats = TableStats::default();
        let root = document
            .select(&selector("body"))
            .next()
            .map(|body| self.render_children(body, &mut stats, 0, false))
            .unwrap_or_default();

        Converted {
            markdown: normalize_blank_lines(&root),
            title,
            tables_found,
            tables_converted: stats.converted,
        }
    }

    fn render_children(
        &self,
        element: ElementRef<'_>,
        stats: &mut TableStats,
        list_depth: usize,
        ordered: bool,
    ) -> String {
        let mut out = String::new();
        let mut item_index = 1;
        for child in element.children() {
            match child.value() {
                Node::Text(text) => out.push_str(text),
                Node::Element(_) => {
                    if let Some(child_el) = ElementRef::wrap(child) {
                        out.push_str(&self.render_element(
                            child_el, stats, list_depth, ordered, item_index,
                        ));
                        if child_el.value().name() == "li" {
                            item_index += 1;
                        }
                    }
                }
                _ => {}
            }
        }
        out
    }

    fn render_element(
        &self,
        element: ElementRef<'_>,
        stats: &mut TableStats,
        list_depth: usize,
        ordered: bool,
        item_index: usize,
    ) -> String {
        let name = element.value().name();

        if SKIP_ELEMENTS.contains(&name) {
            return String::new();
        }

        match name {
            "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
                let level = name[1..].parse::<usize>().unwrap_or(1);
                let text = collapse_ws(&self.render_children(element, stats, list_depth, ordered));
                format!("\n\n{} {}\n\n", "#".repeat(level), text)
            }
            "p" => {
                let body = self.render_children(element, stats, list_depth, ordered);
                format!("\n\n{}\n\n", body.trim())
            }
            "br" => "\n".to_string(),
            "a" => {
                let text = collapse_ws(&self.render_children(element, stats, list_depth, ordered));
                match element.value().attr("href") {
                    Some(href) if !href.is_empty() => format!("[{text}]({href})"),
                    _ => text,
                }
            }
            "strong" | "b" => {
                let text = collapse_ws(&self.render_children(element, stats, list_depth, ordered));
                format!("**{text}**")
            }
            "em" | "i" => {
                let text = collapse_ws(&self.render_children(element, stats, list_depth, ordered));
                format!("*{text}*")
            }
            "code" => {
                let inside_pre = element
                    .parent()
                    .and_then(ElementRef::wrap)
                    .map(|p| p.value().name() == "pre")
                    .unwrap_or(false);
                let text = element.text().collect::<String>();
                if inside_pre {
                    text
                } else {
                    format!("`{}`", text.trim())
                }
            }
            "pre" => {
                let text = element.text().collect::<String>();
                format!("\n\n```\n{}\n```\n\n", text.trim())
            }
            "blockquote" => {
                let body = self.render_children(element, stats, list_depth, ordered);
                let quoted: String = body
                    .trim()
                    .lines()
                    .map(|line| {
                        if line.trim().is_empty() {
                            ">".to_string()
                        } else {
                            format!("> {line}")
                        }
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                format!("\n\n{quoted}\n\n")
            }
            "hr" => "\n\n---\n\n".to_string(),
            "img" => {
                let alt = element.value().attr("alt").unwrap_or("");
                let src = element.value().attr("src").unwrap_or("");
                format!("![{alt}]({src})")
            }
            "ul" => {
                let body = self.render_children(element, stats, list_depth + 1, false);
                format!("\n\n{}\n", body.trim_end())
            }
            "ol" => {
                let body = self.render_children(element, stats, list_depth + 1, true);
                format!("\n\n{}\n", body.trim_end())
            }
            "li" => {
                let body = self.render_children(element, stats, list_depth, ordered);
                let prefix = if ordered {
                    format!("{item_index}. ")
                } else {
                    "- ".to_string()
                };
                let indent = "  ".repeat(list_depth.saturating_sub(1));
                let lines: Vec<&str> = body
                    .trim()
                    .lines()
                    .filter(|l| !l.trim().is_empty())
                    .collect();
                if lines.is_empty() {
                    return String::new();
                }
                let mut item = format!("{indent}{prefix}{}\n", lines[0].trim_start());
                for line in &lines[1..] {
                    item.push_str(&format!("{indent}  {}\n", line.trim_start()));
                }
                item
            }
            "table" => {
                if self.preserve_tables {
                    match table_to_markdown(element) {
                        Some(md) => {
                            stats.converted += 1;
                            format!("\n\n{md}\n\n")
                        }
                        None => String::new(),
                    }
                } else {
                    let text = collapse_ws(&element.text().collect::<Vec<_>>().join(" "));
                    format!("\n\n{text}\n\n")
                }
            }
            _ => self.render_children(element, stats, list_depth, ordered),
        }
    }
}

#[derive(Debug, Default)]
struct TableStats {
    converted: usize,
}

/// Convert a `<table>` element to a Markdown pipe table.
///
/// Header comes from `thead th`, else the first row. Body rows are
/// normalized to the header width. Nested tables are flattened to their
/// text. Returns `None` for tables with no rows.
fn table_to_markdown(table: ElementRef<'_>) -> Option<String> {
    let row_selector = selector("tr");
    let rows: Vec<ElementRef<'_>> = table
        .select(&row_selector)
        .filter(|tr| {
            // Skip rows that belong to a nested table.
            nearest_ancestor_table(*tr).map(|t| t.id()) == Some(table.id())
        })
        .collect();
    if rows.is_empty() {
        return None;
    }

    let mut header: Vec<String> = Vec::new();
    let mut body_rows = &rows[..];

    if let Some(thead) = table.select(&selector("thead")).next() {
        header = thead
            .select(&selector("th"))
            .map(|th| cell_text(th))
            .collect();
    }
    if header.is_empty() {
        header = cells_of(rows[0]);
        body_rows = &rows[1..];
    } else {
        // Drop the header row if it also appears in the tr list.
        if !body_rows.is_empty() && cells_of(body_rows[0]) == header {
            body_rows = &body_rows[1..];
        }
    }

    let col_count = header.len().max(1);
    let mut lines = Vec::with_capacity(body_rows.len() + 2);
    lines.push(format!("| {} |", header.join(" | ")));
    lines.push(format!("| {} |", vec!["---"; col_count].join(" | ")));

    for tr in body_rows {
        let mut cells = cells_of(*tr);
        cells.resize(col_count, String::new());
        cells.truncate(col_count);
        lines.push(format!("| {} |", cells.join(" | ")));
    }

    Some(lines.join("\n"))
}

/// The closest enclosing table of an element, if any.
fn nearest_ancestor_table(element: ElementRef<'_>) -> Option<ElementRef<'_>> {
    let mut current = element.parent();
    while let Some(node) = current {
        if let Some(el) = ElementRef::wrap(node) {
            if el.value().name() == "table" {
                return Some(el);
            }
        }
        current = node.parent();
    }
    None
}

fn cells_of(tr: ElementRef<'_>) -> Vec<String> {
    tr.select(&selector("th, td")).map(cell_text).collect()
}

/// Render a table cell: inline links preserved, whitespace collapsed,
/// pipes escaped, long content truncated with an ellipsis.
fn cell_text(cell: ElementRef<'_>) -> String {
    let mut out = String::new();
    render_inline(cell, &mut out);
    let collapsed = collapse_ws(&out).replace('|', "\\|");
    truncate_chars(&collapsed, MAX_CELL_CHARS)
}

/// Flatten cell content, keeping `[text](href)` links inline.
fn render_inline(element: ElementRef<'_>, out: &mut String) {
    for child in element.children() {
        match child.value() {
            Node::Text(text) => out.push_str(text),
            Node::Element(el) => {
                let Some(child_el) = ElementRef::wrap(child) else {
                    continue;
                };
                if el.name() == "a" {
                    let mut text = String::new();
                    render_inline(child_el, &mut text);
                    let text = collapse_ws(&text);
                    match el.attr("href") {
                        Some(href) if !href.is_empty() => {
                            out.push_str(&format!("[{text}]({href})"));
                        }
                        _ => out.push_str(&text),
                    }
                } else {
                    render_inline(child_el, out);
                }
            }
            _ => {}
        }
        out.push(' ');
    }
}

fn collapse_ws(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let truncated: String = text.chars().take(max).collect();
        format!("{truncated}…")
    }
}

fn normalize_blank_lines(text: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"\n{3,}").expect("blank-line pattern compiles"));
    let collapsed = re.replace_all(text, "\n\n");
    let trimmed: Vec<&str> = collapsed.lines().map(str::trim_end).collect();
    format!("{}\n", trimmed.join("\n").trim())
}

fn selector(css: &str) -> scraper::Selector {
    scraper::Selector::parse(css).expect("static selector parses")
}

/// Extract plain text (no Markdown syntax) from an HTML document.
///
/// Used when the scraper is configured for `text` output: non-content
/// elements are dropped and block text is emitted one line per element.
pub fn extract_text(html: &str) -> Converted {
    let document = Html::parse_document(html);

    let title = document
        .select(&selector("title"))
        .next()
        .map(|el| collapse_ws(&el.text().collect::<String>()))
        .filter(|t| !t.is_empty());
    let tables_found = document.select(&selector("table")).count();

    let mut lines: Vec<String> = Vec::new();
    if let Some(body) = document.select(&selector("body")).next() {
        collect_text_lines(body, &mut lines);
    }

    Converted {
        markdown: format!("{}\n", lines.join("\n")),
        title,
        tables_found,
        tables_converted: 0,
    }
}

fn collect_text_lines(element: ElementRef<'_>, lines: &mut Vec<String>) {
    if SKIP_ELEMENTS.contains(&element.value().name()) {
        return;
    }
    let mut inline = String::new();
    for child in element.children() {
        match child.value() {
            Node::Text(text) => inline.push_str(text),
            Node::Element(_) => {
                if let Some(child_el) = ElementRef::wrap(child) {
                    let flushed = collapse_ws(&inline);
                    if !flushed.is_empty() {
                        lines.push(flushed);
                    }
                    inline.clear();
                    collect_text_lines(child_el, lines);
                }
            }
            _ => {}
        }
    }
    let flushed = collapse_ws(&inline);
    if !flushed.is_empty() {
        lines.push(flushed);
    }
}
