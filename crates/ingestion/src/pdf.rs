//! PDF to markdown conversion
//!
//! Extracts page text with lopdf and promotes numbered lines such as
//! `3.1 Study Design` to headings whose depth is the number of components.

use crate::converter::{ConvertedDocument, DocumentConverter};
use crate::errors::IngestionError;
use async_trait::async_trait;
use regex_lite::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{debug, warn};

fn numbered_heading_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(\d+(?:\.\d+)*)\.?\s+([A-Z].{0,150})$").expect("numbered heading pattern")
    })
}

/// lopdf-backed converter; parsing runs on the blocking pool
pub struct PdfConverter;

#[async_trait]
impl DocumentConverter for PdfConverter {
    fn extensions(&self) -> &[&str] {
        &["pdf"]
    }

    async fn convert(&self, path: &Path) -> Result<ConvertedDocument, IngestionError> {
        let owned: PathBuf = path.to_path_buf();
        tokio::task::spawn_blocking(move || convert_pdf(&owned))
            .await
            .map_err(|e| IngestionError::PdfParseError {
                path: path.display().to_string(),
                message: format!("PDF worker failed: {}", e),
            })?
    }
}

/// Convert a PDF file into paged markdown
pub fn convert_pdf(path: &Path) -> Result<ConvertedDocument, IngestionError> {
    let doc = lopdf::Document::load(path).map_err(|e| IngestionError::PdfParseError {
        path: path.display().to_string(),
        message: format!("Failed to load PDF: {}", e),
    })?;

    let pages = doc.get_pages();
    debug!(page_count = pages.len(), "Extracting text from PDF");

    let mut lines: Vec<String> = Vec::new();
    let mut page_starts = Vec::with_capacity(pages.len());

    for (page_num, page_id) in pages {
        page_starts.push(lines.len());
        match doc.get_page_content(page_id) {
            Ok(content) => lines.extend(
                extract_lines(&content)
                    .into_iter()
                    .map(|l| clean_line(&l))
                    .filter(|l| !l.is_empty())
                    .map(|l| promote_heading(&l)),
            ),
            Err(e) => {
                warn!(page = page_num, error = %e, "Failed to extract text from page, skipping");
            }
        }
    }

    if lines.is_empty() {
        return Err(IngestionError::PdfParseError {
            path: path.display().to_string(),
            message: "No text content extracted from PDF".to_string(),
        });
    }

    Ok(ConvertedDocument {
        markdown: lines.join("\n"),
        page_starts,
    })
}

/// `N[.N]* Title` becomes an ATX heading
fn promote_heading(line: &str) -> String {
    match numbered_heading_re().captures(line) {
        Some(caps) => {
            let depth = caps[1].split('.').count().min(6);
            format!("{} {}", "#".repeat(depth), line)
        }
        None => line.to_string(),
    }
}

/// Text lines of a page content stream.
///
/// Each `BT`/`ET` block ends a line, as do the line-advance operators inside it.
fn extract_lines(content: &[u8]) -> Vec<String> {
    let content_str = String::from_utf8_lossy(content);
    let mut lines = Vec::new();
    let mut in_text_block = false;
    let mut current = String::new();

    fn flush(current: &mut String, lines: &mut Vec<String>) {
        if !current.trim().is_empty() {
            lines.push(std::mem::take(current));
        } else {
            current.clear();
        }
    }

    for raw in content_str.lines() {
        let trimmed = raw.trim();

        match trimmed {
            "BT" => {
                in_text_block = true;
                continue;
            }
            "ET" => {
                in_text_block = false;
                flush(&mut current, &mut lines);
                continue;
            }
            _ => {}
        }

        if !in_text_block {
            continue;
        }

        if trimmed.ends_with("Td") || trimmed.ends_with("TD") || trimmed.ends_with("T*") {
            flush(&mut current, &mut lines);
        }

        if let Some(text) = text_operand(trimmed) {
            current.push_str(&text);
        }
    }
    flush(&mut current, &mut lines);

    lines
}

/// Text shown by a `Tj`, `'`, `"` or `TJ` operator
fn text_operand(line: &str) -> Option<String> {
    if line.ends_with("Tj") || line.ends_with('\'') || line.ends_with('"') {
        let start = line.find('(')?;
        let end = line.rfind(')')?;
        if end > start {
            return Some(decode_pdf_string(&line[start + 1..end]));
        }
        return None;
    }

    if line.ends_with("TJ") {
        let mut result = String::new();
        let mut in_paren = false;
        let mut escaped = false;
        let mut current = String::new();

        for ch in line.chars() {
            if in_paren {
                if escaped {
                    current.push('\\');
                    current.push(ch);
                    escaped = false;
                    continue;
                }
                match ch {
                    '\\' => escaped = true,
                    ')' => {
                        in_paren = false;
                        result.push_str(&decode_pdf_string(&current));
                        current.clear();
                    }
                    _ => current.push(ch),
                }
            } else if ch == '(' {
                in_paren = true;
            }
        }

        if !result.is_empty() {
            return Some(result);
        }
    }

    None
}

/// Decode PDF string escapes
fn decode_pdf_string(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars();

    while let Some(ch) = chars.next() {
        if ch == '\\' {
            match chars.next() {
                Some('n') => result.push('\n'),
                Some('r') => result.push('\r'),
                Some('t') => result.push('\t'),
                Some(c) => result.push(c),
                None => {}
            }
        } else {
            result.push(ch);
        }
    }

    result
}

/// Collapse whitespace and normalise typographic quotes
fn clean_line(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .replace('\u{FEFF}', "")
        .replace(['\u{201C}', '\u{201D}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_line() {
        assert_eq!(clean_line("Hello   World\t Test"), "Hello World Test");
        assert_eq!(clean_line("\u{201C}quoted\u{201D}"), "\"quoted\"");
    }

    #[test]
    fn test_decode_pdf_string() {
        assert_eq!(decode_pdf_string("Hello\\nWorld"), "Hello\nWorld");
        assert_eq!(decode_pdf_string("Test\\(paren\\)"), "Test(paren)");
    }

    #[test]
    fn test_numbered_lines_become_headings() {
        assert_eq!(promote_heading("1 Introduction"), "# 1 Introduction");
        assert_eq!(promote_heading("3.1. Study Design"), "## 3.1. Study Design");
        assert_eq!(promote_heading("2.4.1 Dose Selection"), "### 2.4.1 Dose Selection");
        assert_eq!(promote_heading("12 patients were enrolled"), "12 patients were enrolled");
        assert_eq!(promote_heading("Plain text"), "Plain text");
    }

    #[test]
    fn test_extract_lines_from_content_stream() {
        let stream = b"BT\n/F1 12 Tf\n(1 Introduction) Tj\n0 -14 Td\n[(The ) 20 (study)] TJ\nET\nBT\n(Second block) Tj\nET\n";
        let lines = extract_lines(stream);
        assert_eq!(lines, vec!["1 Introduction", "The study", "Second block"]);
    }

    #[test]
    fn test_missing_file_is_parse_error() {
        let err = convert_pdf(Path::new("/nonexistent/file.pdf")).unwrap_err();
        assert!(matches!(err, IngestionError::PdfParseError { .. }));
    }
}
