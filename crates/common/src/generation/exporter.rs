//! Deliverable export to DOCX

use super::markup::escape_html;
use crate::config::ExportConfig;
use crate::db::models::{CustomSection, DeliverableSection};
use crate::db::Repository;
use crate::errors::{AppError, Result};
use crate::graph::tree::{build_forest, preorder};
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};
use uuid::Uuid;

/// Turns assembled HTML into a document file
#[async_trait]
pub trait DocumentRenderer: Send + Sync {
    async fn render_docx(&self, html: &str) -> Result<Vec<u8>>;
}

/// Renders through the pandoc command line
pub struct PandocRenderer {
    program: String,
    reference_doc: Option<String>,
}

impl PandocRenderer {
    pub fn new(config: &ExportConfig) -> Self {
        Self {
            program: config.pandoc_path.clone(),
            reference_doc: config.reference_docx.clone(),
        }
    }

    fn args(&self, output: &std::path::Path) -> Vec<String> {
        let mut args = vec![
            "-f".to_string(),
            "html".to_string(),
            "-t".to_string(),
            "docx".to_string(),
            "--standalone".to_string(),
            "--wrap=none".to_string(),
        ];
        if let Some(ref reference) = self.reference_doc {
            args.push(format!("--reference-doc={}", reference));
        }
        args.push("-o".to_string());
        args.push(output.display().to_string());
        args
    }
}

#[async_trait]
impl DocumentRenderer for PandocRenderer {
    async fn render_docx(&self, html: &str) -> Result<Vec<u8>> {
        let scratch = tempfile::tempdir()?;
        let output = scratch.path().join("deliverable.docx");

        let mut child = Command::new(&self.program)
            .args(self.args(&output))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AppError::Conversion {
                message: format!("Failed to start {}: {}", self.program, e),
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(html.as_bytes()).await?;
        }

        let result = child.wait_with_output().await?;
        if !result.status.success() {
            return Err(AppError::Conversion {
                message: format!(
                    "{} exited with {}: {}",
                    self.program,
                    result.status,
                    String::from_utf8_lossy(&result.stderr).trim()
                ),
            });
        }

        let bytes = tokio::fs::read(&output).await?;
        debug!(bytes = bytes.len(), "Rendered DOCX");
        Ok(bytes)
    }
}

/// Assembles a deliverable's sections and renders them
#[derive(Clone)]
pub struct DeliverableExporter {
    repo: Repository,
    renderer: Arc<dyn DocumentRenderer>,
}

impl DeliverableExporter {
    pub fn new(repo: Repository, renderer: Arc<dyn DocumentRenderer>) -> Self {
        Self { repo, renderer }
    }

    /// Single HTML document of every section with content, in template order
    pub async fn assemble_html(&self, deliverable_id: Uuid) -> Result<String> {
        let deliverable = self
            .repo
            .find_deliverable(deliverable_id)
            .await?
            .ok_or_else(|| AppError::not_found("deliverable", deliverable_id))?;

        let rows: Vec<(DeliverableSection, CustomSection)> = self
            .repo
            .deliverable_sections_with_nodes(deliverable_id)
            .await?
            .into_iter()
            .filter_map(|(section, node)| node.map(|n| (section, n)))
            .collect();

        let forest = build_forest(rows, |(_, node)| (node.id, node.parent_id, node.order_index));

        let bodies: Vec<&str> = preorder(&forest)
            .into_iter()
            .filter_map(|(section, _)| section.content_html.as_deref())
            .filter(|html| !html.trim().is_empty())
            .collect();

        if bodies.is_empty() {
            return Err(AppError::validation(format!(
                "Deliverable {} has no section content to export",
                deliverable_id
            )));
        }

        let mut html = format!(
            "<!DOCTYPE html><html><head><meta charset='UTF-8'></head><body><h1>{}</h1>",
            escape_html(&deliverable.title)
        );
        for body in &bodies {
            html.push_str("<div class='section'>");
            html.push_str(body);
            html.push_str("</div>");
        }
        html.push_str("</body></html>");

        Ok(html)
    }

    /// Render the deliverable as DOCX bytes
    pub async fn export(&self, deliverable_id: Uuid) -> Result<Vec<u8>> {
        let html = self.assemble_html(deliverable_id).await?;
        let bytes = self.renderer.render_docx(&html).await?;
        info!(deliverable = %deliverable_id, bytes = bytes.len(), "Deliverable exported");
        Ok(bytes)
    }
}
