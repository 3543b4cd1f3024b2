//! Document conversion engines
//!
//! Every supported input is turned into markdown before sectioning:
//! - markdown and plain text are read as is
//! - PDF goes through lopdf (see [`crate::pdf`])
//! - office formats are piped through an external command (pandoc by default)

use crate::errors::IngestionError;
use crate::pdf::PdfConverter;
use async_trait::async_trait;
use clinforge_common::config::ConversionConfig;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, instrument};

/// Markdown rendition of a source file
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConvertedDocument {
    pub markdown: String,
    /// Line index at which each page starts; empty when the format has no pages
    pub page_starts: Vec<usize>,
}

impl ConvertedDocument {
    pub fn unpaged(markdown: impl Into<String>) -> Self {
        Self {
            markdown: markdown.into(),
            page_starts: Vec::new(),
        }
    }

    /// 1-based page holding `line`
    pub fn page_of_line(&self, line: usize) -> Option<i32> {
        if self.page_starts.is_empty() {
            return None;
        }
        let page = self.page_starts.partition_point(|&start| start <= line);
        Some(page.max(1) as i32)
    }
}

/// Converts one family of file formats to markdown
#[async_trait]
pub trait DocumentConverter: Send + Sync {
    /// Lowercase extensions handled, without the dot
    fn extensions(&self) -> &[&str];

    async fn convert(&self, path: &Path) -> Result<ConvertedDocument, IngestionError>;

    fn supports(&self, extension: &str) -> bool {
        self.extensions().contains(&extension)
    }
}

/// Reads markdown and plain text directly
pub struct MarkdownConverter;

#[async_trait]
impl DocumentConverter for MarkdownConverter {
    fn extensions(&self) -> &[&str] {
        &["md", "markdown", "txt"]
    }

    async fn convert(&self, path: &Path) -> Result<ConvertedDocument, IngestionError> {
        let bytes = tokio::fs::read(path).await?;
        Ok(ConvertedDocument::unpaged(String::from_utf8_lossy(&bytes)))
    }
}

const OFFICE_EXTENSIONS: &[&str] = &["docx", "doc", "odt", "rtf", "html", "htm", "epub"];

/// Runs an external converter and reads markdown from its stdout.
///
/// `{input}` in the argument list is replaced by the source path.
pub struct CommandConverter {
    program: String,
    args: Vec<String>,
}

impl CommandConverter {
    pub fn new(config: &ConversionConfig) -> Self {
        Self {
            program: config.command.clone(),
            args: config.args.clone(),
        }
    }

    fn args_for(&self, path: &Path) -> Vec<String> {
        let input = path.display().to_string();
        self.args.iter().map(|a| a.replace("{input}", &input)).collect()
    }
}

#[async_trait]
impl DocumentConverter for CommandConverter {
    fn extensions(&self) -> &[&str] {
        OFFICE_EXTENSIONS
    }

    #[instrument(skip(self), fields(program = %self.program))]
    async fn convert(&self, path: &Path) -> Result<ConvertedDocument, IngestionError> {
        let failure = |message: String| IngestionError::ConversionError {
            path: path.display().to_string(),
            message,
        };

        let output = Command::new(&self.program)
            .args(self.args_for(path))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| failure(format!("failed to start {}: {}", self.program, e)))?;

        if !output.status.success() {
            return Err(failure(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        debug!(bytes = output.stdout.len(), "External conversion finished");
        Ok(ConvertedDocument::unpaged(String::from_utf8_lossy(&output.stdout)))
    }
}

/// Dispatches on file extension
#[derive(Clone)]
pub struct ConverterRouter {
    converters: Vec<Arc<dyn DocumentConverter>>,
}

impl ConverterRouter {
    pub fn new(converters: Vec<Arc<dyn DocumentConverter>>) -> Self {
        Self { converters }
    }

    /// Markdown, PDF and the configured external command
    pub fn from_config(config: &ConversionConfig) -> Self {
        Self::new(vec![
            Arc::new(MarkdownConverter),
            Arc::new(PdfConverter),
            Arc::new(CommandConverter::new(config)),
        ])
    }

    pub async fn convert(&self, path: &Path) -> Result<ConvertedDocument, IngestionError> {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Err(IngestionError::FileNotFound(path.display().to_string()));
        }

        let extension = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        let converter = self
            .converters
            .iter()
            .find(|c| c.supports(&extension))
            .ok_or_else(|| IngestionError::UnsupportedFormat {
                path: path.display().to_string(),
                extension: extension.clone(),
            })?;

        converter.convert(path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_of_line() {
        let doc = ConvertedDocument {
            markdown: String::new(),
            page_starts: vec![0, 10, 25],
        };
        assert_eq!(doc.page_of_line(0), Some(1));
        assert_eq!(doc.page_of_line(9), Some(1));
        assert_eq!(doc.page_of_line(10), Some(2));
        assert_eq!(doc.page_of_line(100), Some(3));
        assert_eq!(ConvertedDocument::unpaged("x").page_of_line(3), None);
    }

    #[tokio::test]
    async fn test_router_errors() {
        let router = ConverterRouter::from_config(&ConversionConfig::default());

        let err = router.convert(Path::new("/nonexistent/protocol.pdf")).await.unwrap_err();
        assert!(matches!(err, IngestionError::FileNotFound(_)));

        let dir = tempfile::tempdir().unwrap();
        let odd = dir.path().join("data.xyz");
        tokio::fs::write(&odd, b"?").await.unwrap();
        let err = router.convert(&odd).await.unwrap_err();
        assert!(matches!(err, IngestionError::UnsupportedFormat { ref extension, .. } if extension == "xyz"));
    }

    #[tokio::test]
    async fn test_markdown_read_directly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Notes.MD");
        tokio::fs::write(&path, "# Title\nBody").await.unwrap();

        let router = ConverterRouter::from_config(&ConversionConfig::default());
        let doc = router.convert(&path).await.unwrap();
        assert_eq!(doc.markdown, "# Title\nBody");
        assert!(doc.page_starts.is_empty());
    }

    #[tokio::test]
    async fn test_command_failure_is_conversion_error() {
        let converter = CommandConverter::new(&ConversionConfig {
            command: "/nonexistent/converter".into(),
            args: vec!["{input}".into()],
            scratch_dir: None,
        });
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("study.docx");
        tokio::fs::write(&path, b"PK").await.unwrap();

        let err = converter.convert(&path).await.unwrap_err();
        assert!(matches!(err, IngestionError::ConversionError { .. }));
    }

    #[test]
    fn test_input_placeholder() {
        let converter = CommandConverter::new(&ConversionConfig::default());
        let args = converter.args_for(Path::new("/tmp/a.docx"));
        assert_eq!(args, vec!["/tmp/a.docx", "-t", "gfm"]);
    }
}
