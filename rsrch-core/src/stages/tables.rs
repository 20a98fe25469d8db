//! Deterministic Markdown pipe-table parsing and compaction.
//!
//! Small tables pass through summarizer prompts verbatim. Large tables are
//! reduced to the header plus the top rows of the strongest numeric column,
//! with aggregates computed here rather than by the model. Everything in
//! this module is pure: same input and options, byte-identical output.

use crate::types::{CompactedTable, MarkdownTable};

/// Options controlling verbatim/compaction behavior.
#[derive(Debug, Clone, Copy)]
pub struct TableOptions {
    /// Rows kept when compacting.
    pub topk_rows: usize,
    /// Tables at or below this row count stay verbatim.
    pub max_rows_verbatim: usize,
    /// Tables at or below this column count stay verbatim.
    pub max_cols_verbatim: usize,
}

impl Default for TableOptions {
    fn default() -> Self {
        Self {
            topk_rows: 10,
            max_rows_verbatim: 15,
            max_cols_verbatim: 8,
        }
    }
}

/// A pipe table located in a Markdown document.
#[derive(Debug, Clone)]
pub struct TableScan {
    pub table: MarkdownTable,
    /// First line of the table (the header row), 0-based.
    pub start_line: usize,
    /// One past the last table line.
    pub end_line: usize,
}

/// Find every pipe table in a Markdown document.
///
/// A table is a header row immediately followed by a `---` separator row
/// and zero or more contiguous body rows.
pub fn find_tables(text: &str) -> Vec<TableScan> {
    let lines: Vec<&str> = text.lines().collect();
    let mut tables = Vec::new();
    let mut i = 0;

    while i + 1 < lines.len() {
        if !is_row_line(lines[i]) || !is_separator_line(lines[i + 1]) {
            i += 1;
            continue;
        }

        let header = split_row(lines[i]);
        let start = i;
        let mut end = i + 2;
        let mut rows = Vec::new();
        while end < lines.len() && is_row_line(lines[end]) && !is_separator_line(lines[end]) {
            let mut cells = split_row(lines[end]);
            cells.resize(header.len(), String::new());
            cells.truncate(header.len());
            rows.push(cells);
            end += 1;
        }

        tables.push(TableScan {
            table: MarkdownTable { header, rows },
            start_line: start,
            end_line: end,
        });
        i = end;
    }

    tables
}

fn is_row_line(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.starts_with('|') && trimmed.len() > 1
}

fn is_separator_line(line: &str) -> bool {
    let trimmed = line.trim();
    if !trimmed.starts_with('|') {
        return false;
    }
    let cells = split_row(trimmed);
    !cells.is_empty()
        && cells.iter().all(|c| {
            let c = c.trim();
            !c.is_empty()
                && c.chars().all(|ch| ch == '-' || ch == ':')
                && c.contains('-')
        })
}

/// Split a pipe row into trimmed cells, honoring `\|` escapes.
fn split_row(line: &str) -> Vec<String> {
    let trimmed = line.trim();
    let mut cells = Vec::new();
    let mut current = String::new();
    let mut escaped = false;

    for ch in trimmed.chars() {
        if escaped {
            current.push(ch);
            escaped = false;
        } else if ch == '\\' {
            escaped = true;
        } else if ch == '|' {
            cells.push(current.trim().to_string());
            current.clear();
        } else {
            current.push(ch);
        }
    }
    cells.push(current.trim().to_string());

    // Leading and trailing pipes produce empty edge cells.
    if cells.first().map(|c| c.is_empty()).unwrap_or(false) {
        cells.remove(0);
    }
    if cells.last().map(|c| c.is_empty()).unwrap_or(false) {
        cells.pop();
    }
    cells
}

/// Parse a cell as a number, tolerating thousands separators, currency,
/// and percent signs.
pub fn parse_numeric(cell: &str) -> Option<f64> {
    let cleaned: String = cell
        .trim()
        .chars()
        .filter(|c| !matches!(c, ',' | '$' | '%'))
        .collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok()
}

/// Fraction of body cells in a column that parse as numeric.
fn numeric_density(table: &MarkdownTable, col: usize) -> f64 {
    if table.rows.is_empty() {
        return 0.0;
    }
    let numeric = table
        .rows
        .iter()
        .filter(|row| row.get(col).map(|c| parse_numeric(c).is_some()).unwrap_or(false))
        .count();
    numeric as f64 / table.rows.len() as f64
}

/// Index of the strongest numeric column; leftmost wins density ties.
fn strongest_numeric_column(table: &MarkdownTable) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for col in 0..table.column_count() {
        let density = numeric_density(table, col);
        if density <= 0.0 {
            continue;
        }
        match best {
            Some((_, best_density)) if density <= best_density => {}
            _ => best = Some((col, density)),
        }
    }
    best.map(|(col, _)| col)
}

/// Whether a table is small enough to keep verbatim.
pub fn is_verbatim(table: &MarkdownTable, options: &TableOptions) -> bool {
    table.row_count() <= options.max_rows_verbatim
        && table.column_count() <= options.max_cols_verbatim
}

/// Compact a large table: header, top rows by the strongest numeric
/// column (value descending, row index ascending on ties), and a note line
/// with aggregates computed here.
pub fn compact_table(table: &MarkdownTable, options: &TableOptions) -> CompactedTable {
    let total = table.row_count();

    let Some(col) = strongest_numeric_column(table) else {
        // No numeric column at all: keep the first K rows by position.
        let rows: Vec<Vec<String>> = table.rows.iter().take(options.topk_rows).cloned().collect();
        let note = format!("{}/{} rows shown; selection=first rows", rows.len(), total);
        return CompactedTable {
            header: table.header.clone(),
            rows,
            note,
        };
    };
    let col_name = table.header.get(col).cloned().unwrap_or_default();

    // Rows with no numeric value in the selection column sort below all
    // numeric rows.
    let mut indexed: Vec<(usize, Option<f64>)> = table
        .rows
        .iter()
        .enumerate()
        .map(|(i, row)| (i, row.get(col).and_then(|c| parse_numeric(c))))
        .collect();
    indexed.sort_by(|a, b| match (a.1, b.1) {
        (Some(x), Some(y)) => y.partial_cmp(&x).unwrap_or(std::cmp::Ordering::Equal).then(a.0.cmp(&b.0)),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => a.0.cmp(&b.0),
    });

    let selected: Vec<Vec<String>> = indexed
        .iter()
        .take(options.topk_rows)
        .map(|(i, _)| table.rows[*i].clone())
        .collect();

    let values: Vec<f64> = indexed.iter().filter_map(|(_, v)| *v).collect();
    let mean = values.iter().sum::<f64>() / values.len().max(1) as f64;
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);

    let note = format!(
        "{}/{} rows shown; selection=max by {}; {}: mean={}, max={}",
        selected.len(),
        total,
        col_name,
        col_name,
        format_number(mean),
        format_number(max),
    );

    CompactedTable {
        header: table.header.clone(),
        rows: selected,
        note,
    }
}

/// Render a table back to pipe-table Markdown.
pub fn render_table(header: &[String], rows: &[Vec<String>]) -> String {
    let mut lines = Vec::with_capacity(rows.len() + 2);
    lines.push(format!("| {} |", header.join(" | ")));
    lines.push(format!("| {} |", vec!["---"; header.len().max(1)].join(" | ")));
    for row in rows {
        lines.push(format!("| {} |", row.join(" | ")));
    }
    lines.join("\n")
}

/// Render a compacted table with its trailing note line.
pub fn render_compacted(table: &CompactedTable) -> String {
    format!(
        "{}\n> Note: {}",
        render_table(&table.header, &table.rows),
        table.note
    )
}

/// Round to four decimals and print the shortest representation.
fn format_number(value: f64) -> String {
    let rounded = (value * 10_000.0).round() / 10_000.0;
    format!("{rounded}")
}

/// Result of table-aware preprocessing over one document.
#[derive(Debug, Clone, Default)]
pub struct PreprocessedTables {
    pub text: String,
    pub preserved: Vec<MarkdownTable>,
    pub compacted: Vec<CompactedTable>,
}

/// Rewrite a document: small tables untouched, large tables replaced by
/// their compacted form plus note.
pub fn preprocess_tables(text: &str, options: &TableOptions) -> PreprocessedTables {
    let scans = find_tables(text);
    if scans.is_empty() {
        return PreprocessedTables {
            text: text.to_string(),
            ..Default::default()
        };
    }

    let lines: Vec<&str> = text.lines().collect();
    let mut out: Vec<String> = Vec::with_capacity(lines.len());
    let mut preserved = Vec::new();
    let mut compacted = Vec::new();
    let mut cursor = 0;

    for scan in scans {
        for line in &lines[cursor..scan.start_line] {
            out.push((*line).to_string());
        }
        if is_verbatim(&scan.table, options) {
            for line in &lines[scan.start_line..scan.end_line] {
                out.push((*line).to_string());
            }
            preserved.push(scan.table);
        } else {
            let compact = compact_table(&scan.table, options);
            out.push(render_compacted(&compact));
            compacted.push(compact);
        }
        cursor = scan.end_line;
    }
    for line in &lines[cursor..] {
        out.push((*line).to_string());
    }

    PreprocessedTables {
        text: out.join("\n"),
        preserved,
        compacted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_table_doc() -> &'static str {
        "Some intro text.\n\n\
         | Model | Dataset | Score |\n\
         | --- | --- | --- |\n\
         | A | X | 0.91 |\n\
         | B | Y | 0.87 |\n\n\
         Conclusion."
    }

    /// 25 rows with ascending Accuracy 0.50, 0.52, ... 0.98.
    fn large_table_doc() -> String {
        let mut doc = String::from("Intro text\n\n| Model | Dataset | Accuracy | Notes |\n| --- | --- | --- | --- |\n");
        for i in 0..25 {
            let acc = 0.50 + (i as f64) * 0.02;
            doc.push_str(&format!("| M{i} | D{} | {acc:.2} | row{i} |\n", i % 3));
        }
        doc.push_str("\nMore text");
        doc
    }

    #[test]
    fn test_find_tables() {
        let tables = find_tables(small_table_doc());
        assert_eq!(tables.len(), 1);
        let table = &tables[0].table;
        assert_eq!(table.header, vec!["Model", "Dataset", "Score"]);
        assert_eq!(table.row_count(), 2);
        assert_eq!(table.rows[0], vec!["A", "X", "0.91"]);
    }

    #[test]
    fn test_find_tables_none() {
        assert!(find_tables("just some | pipes inline, no table").is_empty());
    }

    #[test]
    fn test_split_row_escaped_pipe() {
        let cells = split_row(r"| a\|b | c |");
        assert_eq!(cells, vec!["a|b", "c"]);
    }

    #[test]
    fn test_parse_numeric() {
        assert_eq!(parse_numeric("0.91"), Some(0.91));
        assert_eq!(parse_numeric(" 1,234.5 "), Some(1234.5));
        assert_eq!(parse_numeric("45%"), Some(45.0));
        assert_eq!(parse_numeric("$3.20"), Some(3.2));
        assert_eq!(parse_numeric("row0"), None);
        assert_eq!(parse_numeric(""), None);
    }

    #[test]
    fn test_small_table_preserved() {
        let result = preprocess_tables(small_table_doc(), &TableOptions::default());
        assert!(result.text.contains("| Model | Dataset | Score |"));
        assert!(result.text.contains("| A | X | 0.91 |"));
        assert_eq!(result.preserved.len(), 1);
        assert!(result.compacted.is_empty());
    }

    #[test]
    fn test_large_table_compacted() {
        let doc = large_table_doc();
        let result = preprocess_tables(&doc, &TableOptions::default());

        assert_eq!(result.compacted.len(), 1);
        let compact = &result.compacted[0];
        // Header + exactly topk rows.
        assert_eq!(compact.header, vec!["Model", "Dataset", "Accuracy", "Notes"]);
        assert_eq!(compact.rows.len(), 10);

        // Highest-accuracy row present, lowest absent.
        assert!(result.text.contains("| M24 | D0 | 0.98 | row24 |"));
        assert!(!result.text.contains("| M0 | D0 | 0.50 | row0 |"));

        // Note line with aggregates computed here, not by a model.
        // mean of 0.50..=0.98 step 0.02 is exactly 0.74.
        assert!(compact.note.contains("10/25 rows shown"));
        assert!(compact.note.contains("selection=max by Accuracy"));
        assert!(compact.note.contains("Accuracy: mean=0.74, max=0.98"));
        assert!(result.text.contains("> Note: 10/25 rows shown"));
    }

    #[test]
    fn test_compaction_deterministic() {
        let doc = large_table_doc();
        let options = TableOptions::default();
        let a = preprocess_tables(&doc, &options);
        let b = preprocess_tables(&doc, &options);
        assert_eq!(a.text, b.text);
        assert_eq!(a.compacted, b.compacted);
    }

    #[test]
    fn test_selection_tie_breaks_by_row_index() {
        let table = MarkdownTable {
            header: vec!["Name".into(), "Score".into()],
            rows: (0..20)
                .map(|i| vec![format!("r{i}"), "5.0".to_string()])
                .collect(),
        };
        let compact = compact_table(&table, &TableOptions::default());
        // All scores equal: the first ten rows win by index.
        assert_eq!(compact.rows.len(), 10);
        assert_eq!(compact.rows[0][0], "r0");
        assert_eq!(compact.rows[9][0], "r9");
    }

    #[test]
    fn test_density_tie_prefers_leftmost_column() {
        // Two fully numeric columns; the left one must drive selection.
        let table = MarkdownTable {
            header: vec!["Left".into(), "Right".into()],
            rows: (0..20)
                .map(|i| vec![format!("{}", i), format!("{}", 100 - i)])
                .collect(),
        };
        let compact = compact_table(&table, &TableOptions::default());
        assert!(compact.note.contains("selection=max by Left"));
        // Max of the Left column is 19.
        assert_eq!(compact.rows[0][0], "19");
    }

    #[test]
    fn test_non_numeric_rows_sort_last() {
        let mut rows: Vec<Vec<String>> = (0..18)
            .map(|i| vec![format!("r{i}"), format!("{}", i)])
            .collect();
        rows.insert(3, vec!["bad".into(), "n/a".into()]);
        let table = MarkdownTable {
            header: vec!["Name".into(), "Value".into()],
            rows,
        };
        let compact = compact_table(&table, &TableOptions::default());
        assert!(compact.rows.iter().all(|r| r[0] != "bad"));
    }

    #[test]
    fn test_no_numeric_column_keeps_first_rows() {
        let table = MarkdownTable {
            header: vec!["A".into(), "B".into()],
            rows: (0..20)
                .map(|i| vec![format!("a{i}"), format!("b{i}")])
                .collect(),
        };
        let compact = compact_table(&table, &TableOptions::default());
        assert_eq!(compact.rows.len(), 10);
        assert_eq!(compact.rows[0][0], "a0");
        assert!(compact.note.contains("10/20 rows shown"));
    }

    #[test]
    fn test_wide_table_compacted_by_column_count() {
        // 3 rows but 12 columns: exceeds the verbatim column bound.
        let header: Vec<String> = (0..12).map(|i| format!("C{i}")).collect();
        let rows: Vec<Vec<String>> = (0..3)
            .map(|r| (0..12).map(|c| format!("{}", r * 12 + c)).collect())
            .collect();
        let table = MarkdownTable { header, rows };
        assert!(!is_verbatim(&table, &TableOptions::default()));
    }

    #[test]
    fn test_surrounding_text_untouched() {
        let doc = large_table_doc();
        let result = preprocess_tables(&doc, &TableOptions::default());
        assert!(result.text.starts_with("Intro text"));
        assert!(result.text.trim_end().ends_with("More text"));
    }

    #[test]
    fn test_render_round_trip() {
        let table = MarkdownTable {
            header: vec!["A".into(), "B".into()],
            rows: vec![vec!["1".into(), "2".into()]],
        };
        let rendered = render_table(&table.header, &table.rows);
        let reparsed = find_tables(&rendered);
        assert_eq!(reparsed.len(), 1);
        assert_eq!(reparsed[0].table, table);
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(0.74), "0.74");
        assert_eq!(format_number(0.98000000001), "0.98");
        assert_eq!(format_number(1234.0), "1234");
    }
}
