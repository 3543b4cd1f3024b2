//! Plain text and tables from section markdown
//!
//! Both walk the pulldown-cmark event stream with GFM tables enabled. Rows
//! narrower than the header are padded by the parser; a table whose header
//! cells are all blank is rejected.

use pulldown_cmark::{Event, Options, Parser, Tag, TagEnd};
use serde::{Deserialize, Serialize};
use thiserror::Error;

fn parser(markdown: &str) -> Parser<'_> {
    Parser::new_ext(markdown, Options::ENABLE_TABLES | Options::ENABLE_STRIKETHROUGH)
}

/// Parsed table: header cells plus data rows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableData {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<i32>,
}

#[derive(Error, Debug, PartialEq)]
pub enum TableError {
    #[error("table header is empty")]
    EmptyHeader,
}

/// Plain text from markdown.
///
/// Markup, images, fenced code, raw HTML and rules are dropped; link labels
/// and code span contents are kept. Each block ends a line, and whitespace
/// is collapsed with blank lines removed.
pub fn markdown_to_text(markdown: &str) -> String {
    let mut out = String::with_capacity(markdown.len());
    let mut hidden = 0usize;

    for event in parser(markdown) {
        match event {
            Event::Start(Tag::Image { .. } | Tag::CodeBlock(_)) => hidden += 1,
            Event::End(TagEnd::Image | TagEnd::CodeBlock) => hidden = hidden.saturating_sub(1),
            _ if hidden > 0 => {}
            Event::Text(text) | Event::Code(text) => out.push_str(&text),
            Event::SoftBreak | Event::HardBreak | Event::Start(Tag::List(_)) => out.push('\n'),
            Event::End(
                TagEnd::Paragraph
                | TagEnd::Heading(_)
                | TagEnd::Item
                | TagEnd::TableHead
                | TagEnd::TableRow,
            ) => out.push('\n'),
            Event::End(TagEnd::TableCell) => out.push(' '),
            _ => {}
        }
    }

    out.lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Default)]
struct TableBuilder {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
    row: Vec<String>,
    cell: String,
}

impl TableBuilder {
    fn finish(self) -> Result<TableData, TableError> {
        if self.headers.iter().all(|h| h.is_empty()) {
            return Err(TableError::EmptyHeader);
        }
        Ok(TableData {
            headers: self.headers,
            rows: self.rows,
            page: None,
        })
    }
}

/// Every GFM table in `markdown`, in document order
pub fn extract_tables(markdown: &str) -> Vec<Result<TableData, TableError>> {
    let mut tables = Vec::new();
    let mut current: Option<TableBuilder> = None;

    for event in parser(markdown) {
        match event {
            Event::Start(Tag::Table(_)) => current = Some(TableBuilder::default()),
            Event::End(TagEnd::Table) => {
                if let Some(table) = current.take() {
                    tables.push(table.finish());
                }
            }
            event => {
                let Some(table) = current.as_mut() else {
                    continue;
                };
                match event {
                    Event::Text(text) | Event::Code(text) => table.cell.push_str(&text),
                    Event::End(TagEnd::TableCell) => {
                        let cell = std::mem::take(&mut table.cell);
                        table.row.push(cell.trim().to_string());
                    }
                    Event::End(TagEnd::TableHead) => table.headers = std::mem::take(&mut table.row),
                    Event::End(TagEnd::TableRow) => {
                        let row = std::mem::take(&mut table.row);
                        table.rows.push(row);
                    }
                    _ => {}
                }
            }
        }
    }

    tables
}
