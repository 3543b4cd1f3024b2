//! Header-delimited sectioning of converted documents
//!
//! A document is split at every ATX heading. Each section keeps its markdown
//! body, a plain-text rendition for search and embedding, any GFM tables it
//! contains, and the page its heading sits on.

use crate::converter::{ConvertedDocument, ConverterRouter};
use crate::errors::IngestionError;
use crate::markdown::{extract_tables, markdown_to_text, TableData};
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::OnceLock;
use tracing::{debug, instrument, warn};

fn heading_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(#{1,6})\s+(.+)$").expect("heading pattern"))
}

fn section_number_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d+(?:\.\d+)*)").expect("section number pattern"))
}

/// One parsed section of a source document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    /// Position in the document, from 0
    pub ordinal: i32,
    /// Dot-delimited numeric prefix of the header, e.g. `3.1.2`
    pub section_number: Option<String>,
    pub header: String,
    /// Heading depth 1-6; `None` for text before the first heading
    pub hierarchy_level: Option<i32>,
    pub page_number: Option<i32>,
    pub content_text: String,
    pub content_markdown: String,
    pub tables: Vec<TableData>,
}

impl Section {
    /// Tables as stored in `content_structure`
    pub fn content_structure(&self) -> Option<serde_json::Value> {
        if self.tables.is_empty() {
            return None;
        }
        Some(serde_json::json!({ "tables": self.tables }))
    }
}

/// Converts a file and splits it into sections
#[derive(Clone)]
pub struct Sectionizer {
    router: ConverterRouter,
}

impl Sectionizer {
    pub fn new(router: ConverterRouter) -> Self {
        Self { router }
    }

    #[instrument(skip(self), fields(path = %path.display()))]
    pub async fn parse(&self, path: &Path) -> Result<Vec<Section>, IngestionError> {
        let converted = self.router.convert(path).await?;
        let sections = split_sections(&converted);
        debug!(sections = sections.len(), "Document sectioned");
        Ok(sections)
    }
}

struct OpenSection {
    header: String,
    level: Option<i32>,
    line: usize,
    body: Vec<String>,
}

impl OpenSection {
    fn close(self, ordinal: i32, doc: &ConvertedDocument) -> Section {
        let content_markdown = self.body.join("\n").trim().to_string();
        let section_number = section_number_re()
            .captures(&self.header)
            .map(|c| c[1].to_string());
        let page_number = doc.page_of_line(self.line);

        let tables = extract_tables(&content_markdown)
            .into_iter()
            .filter_map(|table| match table {
                Ok(mut table) => {
                    table.page = page_number;
                    Some(table)
                }
                Err(e) => {
                    warn!(header = %self.header, error = %e, "Skipping malformed table");
                    None
                }
            })
            .collect();

        Section {
            ordinal,
            section_number,
            header: self.header,
            hierarchy_level: self.level,
            page_number,
            content_text: markdown_to_text(&content_markdown),
            content_markdown,
            tables,
        }
    }
}

/// Split converted markdown at its headings.
///
/// Text before the first heading becomes a headerless section when it is not
/// blank. Every heading yields a section, even with an empty body.
pub fn split_sections(doc: &ConvertedDocument) -> Vec<Section> {
    let mut sections = Vec::new();
    let mut current = OpenSection {
        header: String::new(),
        level: None,
        line: 0,
        body: Vec::new(),
    };
    let mut seen_heading = false;

    for (idx, line) in doc.markdown.lines().enumerate() {
        if let Some(caps) = heading_re().captures(line) {
            let next = OpenSection {
                header: caps[2].trim().to_string(),
                level: Some(caps[1].len() as i32),
                line: idx,
                body: Vec::new(),
            };
            let previous = std::mem::replace(&mut current, next);
            if seen_heading || !previous.body.is_empty() {
                sections.push(previous.close(sections.len() as i32, doc));
            }
            seen_heading = true;
            continue;
        }

        if !line.trim().is_empty() || !current.body.is_empty() {
            current.body.push(line.to_string());
        }
    }

    if seen_heading || !current.body.is_empty() {
        sections.push(current.close(sections.len() as i32, doc));
    }

    sections
}
