//! Document processing orchestrator
//!
//! download -> sectionize -> classify -> embed -> persist -> (optional) extract,
//! with the document's status tracked throughout. Any failure after the
//! document is found leaves it in `error` with the message in its metadata.

use crate::converter::ConverterRouter;
use crate::sectionizer::{Section, Sectionizer};
use async_trait::async_trait;
use backoff::{future::retry, ExponentialBackoff};
use clinforge_common::config::AppConfig;
use clinforge_common::llm::LlmClient;
use clinforge_common::prompts::PromptStore;
use clinforge_common::db::models::{DocumentStatus, SourceDocument, SourceSection};
use clinforge_common::db::{NewSourceSection, Repository};
use clinforge_common::embeddings::Embedder;
use clinforge_common::errors::{AppError, Result};
use clinforge_common::generation::GlobalsExtractor;
use clinforge_common::graph::{Classification, SectionClassifier};
use clinforge_common::metrics;
use clinforge_common::queue::ProcessDocumentMessage;
use clinforge_common::storage::ObjectStorage;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Where a source file lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceLocator {
    /// Public http(s) URL
    Url(String),
    /// Path inside the object storage bucket
    StoragePath(String),
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

impl SourceLocator {
    /// Build from the optional request fields; exactly one must be set.
    ///
    /// A `file_url` that is not http(s) is treated as a storage path.
    pub fn from_parts(file_url: Option<&str>, file_path: Option<&str>) -> Result<Self> {
        match (non_blank(file_url), non_blank(file_path)) {
            (None, None) => Err(AppError::Validation {
                message: "Either file_url or file_path must be provided".to_string(),
                field: Some("file_url".to_string()),
            }),
            (Some(_), Some(_)) => Err(AppError::Validation {
                message: "Provide only one of file_url or file_path".to_string(),
                field: Some("file_path".to_string()),
            }),
            (Some(url), None) if url.starts_with("http://") || url.starts_with("https://") => {
                Ok(Self::Url(url.to_string()))
            }
            (Some(path), None) | (None, Some(path)) => Ok(Self::StoragePath(path.to_string())),
        }
    }

    fn raw(&self) -> &str {
        match self {
            Self::Url(url) => url.split(['?', '#']).next().unwrap_or(url),
            Self::StoragePath(path) => path,
        }
    }

    /// Lowercase extension of the source file name
    pub fn extension(&self) -> Option<String> {
        let name = self.raw().rsplit('/').next()?;
        Path::new(name)
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
    }
}

impl std::fmt::Display for SourceLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Url(url) => write!(f, "{}", url),
            Self::StoragePath(path) => write!(f, "storage:{}", path),
        }
    }
}

/// Fetches source bytes
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(&self, locator: &SourceLocator) -> Result<Vec<u8>>;
}

/// URLs over HTTP, storage paths through the object storage API
pub struct RemoteFetcher {
    client: reqwest::Client,
    storage: ObjectStorage,
}

impl RemoteFetcher {
    pub fn new(storage: ObjectStorage) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| AppError::Internal {
                message: format!("Failed to create HTTP client: {}", e),
            })?;
        Ok(Self { client, storage })
    }

    async fn fetch_url(&self, url: &str) -> Result<Vec<u8>> {
        let policy = ExponentialBackoff {
            max_elapsed_time: Some(Duration::from_secs(60)),
            ..Default::default()
        };

        let bytes = retry(policy, || {
            let request = self.client.get(url);
            async move {
                let response = request
                    .send()
                    .await
                    .map_err(|e| backoff::Error::transient(AppError::HttpClient(e)))?;

                let status = response.status();
                if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                    return Err(backoff::Error::transient(AppError::StorageError {
                        message: format!("Download of {} returned {}", url, status),
                    }));
                }
                if status == reqwest::StatusCode::NOT_FOUND {
                    return Err(backoff::Error::permanent(AppError::not_found("file", url)));
                }
                if !status.is_success() {
                    return Err(backoff::Error::permanent(AppError::StorageError {
                        message: format!("Download of {} returned {}", url, status),
                    }));
                }

                response
                    .bytes()
                    .await
                    .map_err(|e| backoff::Error::transient(AppError::HttpClient(e)))
            }
        })
        .await?;

        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl SourceFetcher for RemoteFetcher {
    async fn fetch(&self, locator: &SourceLocator) -> Result<Vec<u8>> {
        match locator {
            SourceLocator::Url(url) => self.fetch_url(url).await,
            SourceLocator::StoragePath(path) => self.storage.download(self.storage.bucket(), path).await,
        }
    }
}

/// One processing run
#[derive(Debug, Clone)]
pub struct ProcessRequest {
    pub document_id: Uuid,
    pub locator: SourceLocator,
    /// Custom template the sections are classified against
    pub custom_template_id: Option<Uuid>,
    pub extract_globals: bool,
}

impl ProcessRequest {
    /// Request for a queued job; extraction runs if either the job or the
    /// deployment asks for it
    pub fn from_message(message: &ProcessDocumentMessage, extract_by_default: bool) -> Result<Self> {
        Ok(Self {
            document_id: message.document_id,
            locator: SourceLocator::from_parts(message.file_url.as_deref(), message.file_path.as_deref())?,
            custom_template_id: message.custom_template_id,
            extract_globals: extract_by_default || message.extract_globals,
        })
    }
}

/// Persisted section as reported back to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionSummary {
    pub id: Uuid,
    pub ordinal: i32,
    pub header: String,
    pub section_number: Option<String>,
    pub page_number: Option<i32>,
    pub custom_section_id: Option<Uuid>,
}

impl From<&SourceSection> for SectionSummary {
    fn from(s: &SourceSection) -> Self {
        Self {
            id: s.id,
            ordinal: s.ordinal,
            header: s.header.clone(),
            section_number: s.section_number.clone(),
            page_number: s.page_number,
            custom_section_id: s.custom_section_id,
        }
    }
}

/// Runs the processing pipeline for one document at a time
#[derive(Clone)]
pub struct DocumentProcessor {
    repo: Repository,
    fetcher: Arc<dyn SourceFetcher>,
    sectionizer: Sectionizer,
    classifier: SectionClassifier,
    embedder: Arc<dyn Embedder>,
    extractor: Option<GlobalsExtractor>,
    body_chars: usize,
    scratch_dir: Option<PathBuf>,
}

impl DocumentProcessor {
    pub fn new(
        repo: Repository,
        fetcher: Arc<dyn SourceFetcher>,
        sectionizer: Sectionizer,
        classifier: SectionClassifier,
        embedder: Arc<dyn Embedder>,
        body_chars: usize,
    ) -> Self {
        Self {
            repo,
            fetcher,
            sectionizer,
            classifier,
            embedder,
            extractor: None,
            body_chars,
            scratch_dir: None,
        }
    }

    pub fn with_extractor(mut self, extractor: GlobalsExtractor) -> Self {
        self.extractor = Some(extractor);
        self
    }

    pub fn with_scratch_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.scratch_dir = dir;
        self
    }

    /// Production wiring shared by the worker and the gateway
    pub fn from_config(
        config: &AppConfig,
        repo: Repository,
        embedder: Arc<dyn Embedder>,
        llm: Arc<dyn LlmClient>,
        prompts: Arc<PromptStore>,
    ) -> Result<Self> {
        let fetcher = RemoteFetcher::new(ObjectStorage::new(&config.storage)?)?;
        let sectionizer = Sectionizer::new(ConverterRouter::from_config(&config.conversion));
        let classifier =
            SectionClassifier::new(repo.clone(), embedder.clone(), config.classification.threshold);

        Ok(Self::new(
            repo.clone(),
            Arc::new(fetcher),
            sectionizer,
            classifier,
            embedder,
            config.processing.embedding_body_chars,
        )
        .with_extractor(GlobalsExtractor::new(repo, llm, prompts))
        .with_scratch_dir(config.conversion.scratch_dir.as_ref().map(PathBuf::from)))
    }

    /// Process a document and return its persisted sections in order
    #[instrument(skip(self, request), fields(document_id = %request.document_id))]
    pub async fn process(&self, request: &ProcessRequest) -> Result<Vec<SectionSummary>> {
        let document = self
            .repo
            .find_source_document(request.document_id)
            .await?
            .ok_or_else(|| AppError::not_found("source_document", request.document_id))?;

        let started = Instant::now();
        match self.run(&document, request, started).await {
            Ok(summaries) => {
                metrics::record_processing(started.elapsed().as_secs_f64(), summaries.len(), true);
                info!(sections = summaries.len(), "Document indexed");
                Ok(summaries)
            }
            Err(e) => {
                metrics::record_processing(started.elapsed().as_secs_f64(), 0, false);
                error!(error = %e, "Document processing failed");
                self.mark_failed(document.id, &e.to_string()).await;
                Err(e)
            }
        }
    }

    /// Record a failure on the document; errors here are only logged
    pub async fn mark_failed(&self, document_id: Uuid, message: &str) {
        let metadata = serde_json::json!({ "error": message });
        if let Err(e) = self
            .repo
            .update_document_status(document_id, DocumentStatus::Error, Some(metadata), None)
            .await
        {
            error!(document_id = %document_id, error = %e, "Failed to record processing error");
        }
    }

    async fn run(
        &self,
        document: &SourceDocument,
        request: &ProcessRequest,
        started: Instant,
    ) -> Result<Vec<SectionSummary>> {
        let scratch = self.scratch()?;
        let file_name = match request.locator.extension() {
            Some(ext) => format!("source.{}", ext),
            None => "source".to_string(),
        };
        let path = scratch.path().join(file_name);

        let bytes = self.fetcher.fetch(&request.locator).await?;
        let checksum = hex::encode(Sha256::digest(&bytes));
        tokio::fs::write(&path, &bytes).await?;
        debug!(bytes = bytes.len(), path = %path.display(), "Source downloaded");

        let sections = self.sectionizer.parse(&path).await?;

        self.repo
            .update_document_status(document.id, DocumentStatus::Processing, None, None)
            .await?;

        let mut rows = Vec::with_capacity(sections.len());
        for section in &sections {
            let classification = match request.custom_template_id {
                Some(template_id) => self.classifier.classify_scored(&section.header, template_id).await?,
                None => Classification::default(),
            };
            let embedding = self.embed_section(section).await;
            rows.push(new_source_section(section, classification, embedding));
        }

        let stored = self.repo.upsert_source_sections(document.id, rows).await?;

        let tables_count: usize = sections.iter().map(|s| s.tables.len()).sum();
        let max_page = sections.iter().filter_map(|s| s.page_number).max();
        let metadata = serde_json::json!({
            "elapsed_seconds": started.elapsed().as_secs_f64(),
            "max_page": max_page,
            "sections_count": stored.len(),
            "tables_count": tables_count,
            "sha256": checksum,
            "source": request.locator.to_string(),
        });
        self.repo
            .update_document_status(
                document.id,
                DocumentStatus::Indexed,
                Some(metadata),
                Some(tables_count as i32),
            )
            .await?;

        if request.extract_globals {
            self.extract_globals(document.project_id).await;
        }

        Ok(stored.iter().map(SectionSummary::from).collect())
    }

    fn scratch(&self) -> Result<tempfile::TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("clinforge-");
        let dir = match self.scratch_dir {
            Some(ref dir) => builder.tempdir_in(dir)?,
            None => builder.tempdir()?,
        };
        Ok(dir)
    }

    async fn embed_section(&self, section: &Section) -> Option<Vec<f32>> {
        let body: String = section.content_text.chars().take(self.body_chars).collect();
        let text = format!("{}\n{}", section.header, body);
        if text.trim().is_empty() {
            return None;
        }

        match self.embedder.embed(&text).await {
            Ok(vector) => Some(vector),
            Err(e) => {
                warn!(ordinal = section.ordinal, error = %e, "Section embedding failed, storing without vector");
                None
            }
        }
    }

    async fn extract_globals(&self, project_id: Uuid) {
        let Some(ref extractor) = self.extractor else {
            debug!("No extractor configured, skipping fact extraction");
            return;
        };
        match extractor.extract(project_id).await {
            Ok(facts) => info!(project_id = %project_id, facts = facts.len(), "Study facts refreshed"),
            Err(e) => warn!(project_id = %project_id, error = %e, "Fact extraction failed"),
        }
    }
}

fn new_source_section(
    section: &Section,
    classification: Classification,
    embedding: Option<Vec<f32>>,
) -> NewSourceSection {
    NewSourceSection {
        ordinal: section.ordinal,
        section_number: section.section_number.clone(),
        header: section.header.clone(),
        hierarchy_level: section.hierarchy_level,
        page_number: section.page_number,
        content_text: section.content_text.clone(),
        content_markdown: section.content_markdown.clone(),
        content_structure: section.content_structure(),
        custom_section_id: classification.custom_section_id,
        classification_confidence: classification
            .custom_section_id
            .and(classification.best_score)
            .map(f64::from),
        embedding,
    }
}
