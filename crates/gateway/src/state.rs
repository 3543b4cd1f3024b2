//! Shared application state

use clinforge_common::{
    config::AppConfig,
    db::{schema, DbPool, Repository},
    embeddings::{create_embedder, Embedder},
    errors::Result,
    generation::{DeliverableExporter, DocumentRenderer, GlobalsExtractor, PandocRenderer, SectionWriter},
    graph::TemplateService,
    llm::{create_llm_client, LlmClient},
    prompts::PromptStore,
    queue::{Queue, QueueSettings},
};
use clinforge_ingestion::DocumentProcessor;
use std::sync::Arc;
use tracing::{info, warn};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub repo: Repository,
    pub prompts: Arc<PromptStore>,
    pub processor: DocumentProcessor,
    pub writer: SectionWriter,
    pub extractor: GlobalsExtractor,
    pub templates: TemplateService,
    pub exporter: DeliverableExporter,
    /// Processing queue; `None` disables queued parsing
    pub queue: Option<Arc<Queue>>,
}

impl AppState {
    /// Wire services over an existing repository
    pub fn new(
        config: Arc<AppConfig>,
        repo: Repository,
        embedder: Arc<dyn Embedder>,
        llm: Arc<dyn LlmClient>,
        prompts: Arc<PromptStore>,
        processor: DocumentProcessor,
        renderer: Arc<dyn DocumentRenderer>,
    ) -> Self {
        Self {
            writer: SectionWriter::new(repo.clone(), llm.clone(), prompts.clone()),
            extractor: GlobalsExtractor::new(repo.clone(), llm, prompts.clone()),
            templates: TemplateService::new(repo.clone(), embedder),
            exporter: DeliverableExporter::new(repo.clone(), renderer),
            config,
            repo,
            prompts,
            processor,
            queue: None,
        }
    }

    pub fn with_queue(mut self, queue: Arc<Queue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Connect to every backing service named in `config`
    pub async fn from_config(config: Arc<AppConfig>) -> Result<Self> {
        info!("Connecting to database...");
        let db = DbPool::new(&config.database).await?;
        if config.database.auto_migrate {
            schema::create_schema(db.write()).await?;
        }
        let repo = Repository::new(db);

        let embedder = create_embedder(&config.embedding)?;
        let llm = create_llm_client(&config.llm)?;
        let prompts = Arc::new(PromptStore::load(&config.prompts.path)?);

        let processor =
            DocumentProcessor::from_config(&config, repo.clone(), embedder.clone(), llm.clone(), prompts.clone())?;
        let renderer = Arc::new(PandocRenderer::new(&config.export));

        let state = Self::new(config.clone(), repo, embedder, llm, prompts, processor, renderer);

        if config.queue.processing_queue_url.is_none() {
            warn!("No processing queue configured, queued parsing is disabled");
            return Ok(state);
        }
        let queue = Queue::new(QueueSettings::processing(&config.queue)?).await?;
        Ok(state.with_queue(Arc::new(queue)))
    }
}
