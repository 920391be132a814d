//! Markdown document assembly from ordered sections.

use crate::interpolate::interpolate;
use async_trait::async_trait;
use chrono::Utc;
use flowcore::{
    ConfigExt, LogEntry, NodeContext, NodeError, NodeExecutor, NodeMetadata, NodeOutput, Value,
    ValueMap,
};
use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

const CONTENT_KEYS: [&str; 5] = ["content", "text", "output", "result", "markdown"];
const UNTITLED: &str = "Untitled section";

fn regex(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("document pattern is valid"))
}

static BLANK_RUNS: OnceLock<Regex> = OnceLock::new();
static HEADING_BODY: OnceLock<Regex> = OnceLock::new();
static FENCE_OPEN: OnceLock<Regex> = OnceLock::new();
static FENCE_CLOSE: OnceLock<Regex> = OnceLock::new();
static LIST_ITEM: OnceLock<Regex> = OnceLock::new();
static TABLE_RULE: OnceLock<Regex> = OnceLock::new();
static LEADING_HEADING: OnceLock<Regex> = OnceLock::new();
static PARAGRAPH_BREAK: OnceLock<Regex> = OnceLock::new();
static ORDERED_ITEM: OnceLock<Regex> = OnceLock::new();
static ANCHOR_STRIP: OnceLock<Regex> = OnceLock::new();
static WHITESPACE: OnceLock<Regex> = OnceLock::new();
static DASH_RUNS: OnceLock<Regex> = OnceLock::new();

#[derive(Debug, Clone, PartialEq)]
pub struct DocumentSection {
    pub id: String,
    pub title: String,
    pub content: String,
    pub level: i64,
    pub order: i64,
}

#[derive(Debug, Clone)]
pub struct DocumentConfig {
    pub title: String,
    pub description: String,
    pub author: String,
    pub generate_toc: bool,
    pub generate_summary: bool,
    pub toc_title: String,
    pub summary_title: String,
    pub date_format: String,
    pub include_metadata: bool,
    pub section_separator: String,
    pub header_template: String,
    pub footer_template: String,
    pub normalization_level: i64,
}

impl DocumentConfig {
    pub fn from_config(config: &ValueMap) -> Self {
        Self {
            title: config.get_string("title"),
            description: config.get_string("description"),
            author: config.get_string("author"),
            generate_toc: config.get_bool("generateTOC"),
            generate_summary: config.get_bool("generateSummary"),
            toc_title: config.get_string_or("tocTitle", "Table of Contents"),
            summary_title: config.get_string_or("summaryTitle", "Summary"),
            date_format: config.get_string_or("dateFormat", "%Y-%m-%d"),
            include_metadata: config.get_bool("includeMetadata"),
            section_separator: config.get_string_or("sectionSeparator", "\n\n---\n\n"),
            header_template: config.get_string("headerTemplate"),
            footer_template: config.get_string("footerTemplate"),
            normalization_level: config.get_i64_or("normalizationLevel", 1).clamp(0, 3),
        }
    }
}

/// First markdown heading, else the first non-empty line (cut at 50 chars).
pub fn extract_title(content: &str) -> String {
    if content.is_empty() {
        return String::new();
    }
    for line in content.lines().map(str::trim) {
        if line.starts_with('#') {
            let title = line.trim_start_matches('#').trim();
            if !title.is_empty() {
                return title.to_string();
            }
        }
    }
    match content.lines().map(str::trim).find(|l| !l.is_empty()) {
        Some(line) if line.chars().count() > 50 => {
            format!("{}...", line.chars().take(50).collect::<String>())
        }
        Some(line) => line.to_string(),
        None => UNTITLED.to_string(),
    }
}

fn extract_content(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Object(map) => CONTENT_KEYS
            .iter()
            .find_map(|key| map.get_str(key))
            .unwrap_or_default()
            .to_string(),
        _ => String::new(),
    }
}

fn section_from_map(map: &ValueMap, order: usize, content: String) -> Option<DocumentSection> {
    if content.is_empty() {
        return None;
    }
    let id = map.get_string_or("id", &format!("section-{}", order));
    let title = match map.get_string("title") {
        t if t.is_empty() => extract_title(&content),
        t => t,
    };
    Some(DocumentSection {
        id,
        title,
        content,
        level: map.get_i64_or("level", 2),
        order: map.get_i64_or("order", order as i64),
    })
}

fn plain_section(id: String, content: String, order: usize) -> DocumentSection {
    DocumentSection {
        id,
        title: extract_title(&content),
        content,
        level: 2,
        order: order as i64,
    }
}

/// Gathers sections from, in order: `config.sections`, inputs keyed
/// `section-*`/`chapter-*`, `inputs.sections`, and `config.sourceNodes`.
fn collect_sections(ctx: &NodeContext) -> Vec<DocumentSection> {
    let mut sections = Vec::new();

    if let Some(configured) = ctx.config.get_array("sections") {
        for (i, spec) in configured.iter().enumerate() {
            let Some(map) = spec.as_object() else {
                continue;
            };
            let raw = match map.get_str("contentSource").filter(|s| !s.is_empty()) {
                Some(source) => source.to_string(),
                None => map.get_string("content"),
            };
            let content = interpolate(&raw, &ctx.inputs, &ctx.run);
            sections.extend(section_from_map(map, i, content));
        }
    }

    let mut keys: Vec<&String> = ctx
        .inputs
        .keys()
        .filter(|k| k.starts_with("section-") || k.starts_with("chapter-"))
        .collect();
    keys.sort();
    for key in keys {
        let content = extract_content(&ctx.inputs[key]);
        if !content.is_empty() {
            let order = sections.len();
            sections.push(plain_section(key.clone(), content, order));
        }
    }

    if let Some(items) = ctx.inputs.get("sections").and_then(Value::as_array) {
        for (i, item) in items.iter().enumerate() {
            match item {
                Value::Object(map) => {
                    let content = match map.get_string("content") {
                        c if c.is_empty() => map.get_string("text"),
                        c => c,
                    };
                    sections.extend(section_from_map(map, i, content));
                }
                Value::String(content) if !content.is_empty() => {
                    sections.push(plain_section(format!("section-{}", i), content.clone(), i));
                }
                _ => {}
            }
        }
    }

    if let Some(nodes) = ctx.config.get_array("sourceNodes") {
        for (i, node_id) in nodes.iter().filter_map(Value::as_str).enumerate() {
            let Some(outputs) = ctx.run.get_output(node_id) else {
                continue;
            };
            let content = extract_content(&Value::Object(outputs));
            if !content.is_empty() {
                sections.push(plain_section(node_id.to_string(), content, i));
            }
        }
    }

    sections.sort_by_key(|s| s.order);
    sections
}

pub fn normalize(content: &str, level: i64) -> String {
    let mut content = content.to_string();
    if level >= 1 {
        content = content.replace("\r\n", "\n");
        content = regex(&BLANK_RUNS, r"\n{3,}")
            .replace_all(&content, "\n\n")
            .into_owned();
    }
    if level >= 2 {
        content = regex(&HEADING_BODY, r"(?m)(^#{1,6}\s+.+)\n([^\n])")
            .replace_all(&content, "$1\n\n$2")
            .into_owned();
        content = regex(&FENCE_OPEN, r"([^\n])\n(```)")
            .replace_all(&content, "$1\n\n$2")
            .into_owned();
        content = regex(&FENCE_CLOSE, r"(```)\n([^\n])")
            .replace_all(&content, "$1\n\n$2")
            .into_owned();
    }
    if level >= 3 {
        content = normalize_lists(&content);
        content = normalize_tables(&content);
    }
    content.trim().to_string()
}

/// List indentation snapped to multiples of two spaces.
fn normalize_lists(content: &str) -> String {
    let item = regex(&LIST_ITEM, r"^(\s*)([*\-+]|\d+\.)\s+(.*)$");
    content
        .split('\n')
        .map(|line| match item.captures(line) {
            Some(caps) => format!(
                "{}{} {}",
                "  ".repeat(caps[1].len() / 2),
                &caps[2],
                &caps[3]
            ),
            None => line.to_string(),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Table delimiter rows rewritten to `---`, `:---`, `---:` or `:---:`.
fn normalize_tables(content: &str) -> String {
    let rule = regex(&TABLE_RULE, r"^\|(?:[\s\-:]+\|)+$");
    content
        .split('\n')
        .map(|line| {
            if !rule.is_match(line.trim()) {
                return line.to_string();
            }
            line.split('|')
                .map(|cell| {
                    let cell = cell.trim();
                    if cell.is_empty() {
                        return String::new();
                    }
                    let dashes = match (cell.starts_with(':'), cell.ends_with(':')) {
                        (true, true) => ":---:",
                        (true, false) => ":---",
                        (false, true) => "---:",
                        (false, false) => "---",
                    };
                    format!(" {} ", dashes)
                })
                .collect::<Vec<_>>()
                .join("|")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// First prose paragraph after any leading heading, cut at 200 chars.
fn first_paragraph(content: &str) -> String {
    let body = regex(&LEADING_HEADING, r"^#{1,6}\s+.+\n*").replace(content, "");
    let ordered = regex(&ORDERED_ITEM, r"^\d+\.\s");
    for para in regex(&PARAGRAPH_BREAK, r"\n\n+").split(&body) {
        let para = para.trim();
        if para.is_empty()
            || para.starts_with("```")
            || para.starts_with("- ")
            || para.starts_with("* ")
            || para.starts_with("| ")
            || ordered.is_match(para)
        {
            continue;
        }
        if para.chars().count() > 200 {
            return format!("{}...", para.chars().take(200).collect::<String>());
        }
        return para.to_string();
    }
    String::new()
}

pub fn summary(sections: &[DocumentSection], title: &str) -> String {
    let mut parts = vec![format!("## {}\n", title)];
    for section in sections.iter().filter(|s| !s.title.is_empty()) {
        let para = first_paragraph(&section.content);
        if !para.is_empty() {
            parts.push(format!("**{}**: {}", section.title, para));
        }
    }
    parts.join("\n\n")
}

pub fn anchor(title: &str) -> String {
    let lowered = title.to_lowercase();
    let stripped = regex(&ANCHOR_STRIP, r"[^\p{L}\p{N}\s-]").replace_all(&lowered, "");
    let dashed = regex(&WHITESPACE, r"\s+").replace_all(&stripped, "-");
    let collapsed = regex(&DASH_RUNS, r"-+").replace_all(&dashed, "-");
    let anchor = collapsed.trim_matches('-').to_string();
    if anchor.is_empty() {
        let digest = Sha256::digest(title.as_bytes());
        return hex::encode(&digest[..4]);
    }
    anchor
}

pub fn table_of_contents(sections: &[DocumentSection], title: &str) -> String {
    let mut lines = vec![format!("## {}\n", title)];
    for (i, section) in sections.iter().enumerate() {
        if section.title.is_empty() {
            continue;
        }
        let indent = "  ".repeat((section.level - 1).max(0) as usize);
        lines.push(format!(
            "{}{}. [{}](#{})",
            indent,
            i + 1,
            section.title,
            anchor(&section.title)
        ));
    }
    lines.join("\n")
}

pub fn assemble(
    config: &DocumentConfig,
    toc: &str,
    summary: &str,
    sections: &[DocumentSection],
) -> String {
    let mut parts: Vec<String> = Vec::new();

    if !config.header_template.is_empty() {
        parts.push(config.header_template.clone());
    }
    if !config.title.is_empty() {
        parts.push(format!("# {}\n", config.title));
        if config.include_metadata {
            let mut meta = Vec::new();
            if !config.author.is_empty() {
                meta.push(format!("**Author**: {}", config.author));
            }
            meta.push(format!(
                "**Generated**: {}",
                Utc::now().format(&config.date_format)
            ));
            parts.push(format!("> {}", meta.join(" | ")));
        }
        if !config.description.is_empty() {
            parts.push(format!("\n{}\n", config.description));
        }
    }

    parts.push("---".to_string());
    if !toc.is_empty() {
        parts.push(toc.to_string());
        parts.push("---".to_string());
    }
    if !summary.is_empty() {
        parts.push(summary.to_string());
        parts.push("---".to_string());
    }

    let separator = config.section_separator.trim();
    for (i, section) in sections.iter().enumerate() {
        if i > 0 && !separator.is_empty() {
            parts.push(separator.to_string());
        }
        parts.push(section.content.clone());
    }

    if !config.footer_template.is_empty() {
        parts.push("---".to_string());
        parts.push(config.footer_template.clone());
    }

    let document = parts.join("\n\n");
    regex(&BLANK_RUNS, r"\n{3,}")
        .replace_all(&document, "\n\n")
        .trim()
        .to_string()
}

pub fn stats(document: &str, sections: &[DocumentSection]) -> ValueMap {
    let level_count = |level: i64| sections.iter().filter(|s| s.level == level).count();
    let mut stats = ValueMap::new();
    stats.insert(
        "charCount".into(),
        Value::from(document.chars().filter(|c| *c != ' ').count()),
    );
    stats.insert("charCountWithSpaces".into(), Value::from(document.chars().count()));
    stats.insert("wordCount".into(), Value::from(document.split_whitespace().count()));
    stats.insert("lineCount".into(), Value::from(document.split('\n').count()));
    stats.insert("sectionCount".into(), Value::from(sections.len()));
    stats.insert("h1Count".into(), Value::from(level_count(1)));
    stats.insert("h2Count".into(), Value::from(level_count(2)));
    stats.insert("h3Count".into(), Value::from(level_count(3)));
    stats
}

/// Builds one markdown document from ordered sections.
///
/// Config: `title`, `description`, `author`, `generateTOC`,
/// `generateSummary`, `tocTitle`, `summaryTitle`, `dateFormat` (strftime),
/// `includeMetadata`, `sectionSeparator`, `headerTemplate`,
/// `footerTemplate`, `normalizationLevel` (0-3, default 1), `sections`,
/// `sourceNodes`.
pub struct DocumentAssemblerNode;

#[async_trait]
impl NodeExecutor for DocumentAssemblerNode {
    fn node_type(&self) -> &str {
        "document_assembler"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let config = DocumentConfig::from_config(&ctx.config);
        let mut sections = collect_sections(&ctx);

        if config.normalization_level > 0 {
            for section in &mut sections {
                section.content = normalize(&section.content, config.normalization_level);
            }
        }

        let summary_text = if config.generate_summary {
            summary(&sections, &config.summary_title)
        } else {
            String::new()
        };
        let toc = if config.generate_toc {
            table_of_contents(&sections, &config.toc_title)
        } else {
            String::new()
        };

        let document = assemble(&config, &toc, &summary_text, &sections);
        let stats = stats(&document, &sections);
        let word_count = stats.get("wordCount").cloned().unwrap_or_default();

        let mut metadata = ValueMap::new();
        metadata.insert("title".into(), Value::from(config.title.as_str()));
        metadata.insert("author".into(), Value::from(config.author.as_str()));
        metadata.insert("generatedAt".into(), Value::from(Utc::now().to_rfc3339()));
        metadata.insert(
            "sections".into(),
            Value::Array(sections.iter().map(|s| Value::from(s.title.as_str())).collect()),
        );

        let message = format!(
            "Document assembled: {} sections, {} words",
            sections.len(),
            word_count
        );
        ctx.events.info(message.clone());

        Ok(NodeOutput::new()
            .with_output("document", document.clone())
            .with_output("markdown", document.clone())
            .with_output("content", document)
            .with_output("toc", toc)
            .with_output("summary", summary_text)
            .with_output("sectionCount", sections.len())
            .with_output("wordCount", word_count)
            .with_output(
                "charCount",
                stats.get("charCount").cloned().unwrap_or_default(),
            )
            .with_output("stats", stats)
            .with_output("metadata", metadata)
            .with_log(LogEntry::info(message)))
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new("document", "Assembles sections into a markdown document")
            .input("sections", "Section list (objects or strings)", false)
            .output("document", "Assembled markdown")
            .output("toc", "Table of contents")
            .output("summary", "Generated summary")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn section(title: &str, content: &str, level: i64) -> DocumentSection {
        DocumentSection {
            id: title.to_lowercase(),
            title: title.to_string(),
            content: content.to_string(),
            level,
            order: 0,
        }
    }

    #[test]
    fn titles_come_from_headings_or_first_line() {
        assert_eq!(extract_title("intro\n## Setup Guide\nbody"), "Setup Guide");
        assert_eq!(extract_title("\n  first line  \nsecond"), "first line");
        let long = "x".repeat(60);
        assert_eq!(extract_title(&long), format!("{}...", "x".repeat(50)));
    }

    #[test]
    fn anchors_are_slugged_or_hashed() {
        assert_eq!(anchor("Getting Started: Part 1!"), "getting-started-part-1");
        let hashed = anchor("!!!");
        assert_eq!(hashed.len(), 8);
        assert!(hashed.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn normalization_levels_stack() {
        let raw = "# T\nbody\r\n\n\n\nmore\n```\ncode\n```\nafter";
        let level1 = normalize(raw, 1);
        assert!(!level1.contains("\n\n\n"));
        assert!(level1.starts_with("# T\nbody"));

        let level2 = normalize(raw, 2);
        assert!(level2.starts_with("# T\n\nbody"));
        assert!(level2.contains("more\n\n```"));
        assert!(level2.contains("```\n\nafter"));

        assert_eq!(normalize("   - item", 3), "- item");
        assert_eq!(normalize("|:--|--:|", 3), "| :--- | ---: |");
    }

    #[test]
    fn toc_and_summary_list_titled_sections() {
        let sections = vec![
            section("Intro", "# Intro\n\nWelcome to the guide.", 2),
            section("Details", "- only a list", 3),
        ];
        let toc = table_of_contents(&sections, "Contents");
        assert_eq!(toc, "## Contents\n\n  1. [Intro](#intro)\n    2. [Details](#details)");

        let summary = summary(&sections, "Summary");
        assert!(summary.contains("**Intro**: Welcome to the guide."));
        assert!(!summary.contains("Details"));
    }

    #[test]
    fn assembly_separates_sections_and_counts_words() {
        let config = DocumentConfig::from_config(&ValueMap::new());
        let sections = vec![section("A", "alpha beta", 2), section("B", "gamma", 2)];
        let doc = assemble(&config, "", "", &sections);
        assert_eq!(doc, "---\n\nalpha beta\n\n---\n\ngamma");

        let stats = stats(&doc, &sections);
        assert_eq!(stats.get("wordCount"), Some(&Value::from(5usize)));
        assert_eq!(stats.get("h2Count"), Some(&Value::from(2usize)));
    }
}
