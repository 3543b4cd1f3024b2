//! Configuration management for ClinForge services
//!
//! Supports loading configuration from:
//! - Environment variables (prefixed with APP__)
//! - Configuration files (config/default.toml, config/{APP_ENV}.toml, config/local.toml)
//! - Default values

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration
    pub database: DatabaseConfig,

    /// Embedding service configuration
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Chat-completion service configuration
    #[serde(default)]
    pub llm: LlmConfig,

    /// Object storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Queue configuration (SQS)
    #[serde(default)]
    pub queue: QueueConfig,

    /// Queued processing worker policy
    #[serde(default)]
    pub worker: WorkerConfig,

    /// External document conversion
    #[serde(default)]
    pub conversion: ConversionConfig,

    /// Deliverable export
    #[serde(default)]
    pub export: ExportConfig,

    /// Prompt templates
    #[serde(default)]
    pub prompts: PromptsConfig,

    /// Section classification
    #[serde(default)]
    pub classification: ClassificationConfig,

    /// Document processing pipeline
    #[serde(default)]
    pub processing: ProcessingConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Shutdown timeout in seconds
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Maximum concurrent requests
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_requests: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// Primary database URL (for writes)
    pub url: String,

    /// Read replica URL (optional, falls back to primary)
    pub read_url: Option<String>,

    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Idle timeout in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Create missing tables on startup
    #[serde(default)]
    pub auto_migrate: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EmbeddingConfig {
    /// Embedding provider: openai, mock
    #[serde(default = "default_provider")]
    pub provider: String,

    /// API key for embedding service
    pub api_key: Option<String>,

    /// API base URL (for custom endpoints)
    pub api_base: Option<String>,

    /// Model to use
    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Embedding dimension
    #[serde(default = "default_embedding_dimension")]
    pub dimension: usize,

    /// Request timeout in seconds
    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,

    /// Maximum retries
    #[serde(default = "default_embedding_retries")]
    pub max_retries: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LlmConfig {
    /// Completion provider: openai, mock
    #[serde(default = "default_provider")]
    pub provider: String,

    /// API key for the chat-completions endpoint
    pub api_key: Option<String>,

    /// Full chat-completions URL
    #[serde(default = "default_llm_endpoint")]
    pub endpoint: String,

    /// Model to use
    #[serde(default = "default_llm_model")]
    pub model: String,

    /// Request timeout in seconds
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Storage service base URL
    pub url: Option<String>,

    /// Service key used as bearer token
    pub key: Option<String>,

    /// Bucket holding uploaded documents
    #[serde(default = "default_bucket")]
    pub bucket: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueConfig {
    /// SQS queue for document processing jobs
    pub processing_queue_url: Option<String>,

    /// Long polling timeout in seconds
    #[serde(default = "default_queue_poll_timeout")]
    pub poll_timeout_secs: u64,

    /// Visibility timeout in seconds
    #[serde(default = "default_visibility_timeout")]
    pub visibility_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkerConfig {
    /// Retries after the first failed attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Fixed delay between retries
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,

    /// Warning threshold before the hard limit
    #[serde(default = "default_soft_timeout")]
    pub soft_timeout_secs: u64,

    /// Hard per-task limit
    #[serde(default = "default_hard_timeout")]
    pub hard_timeout_secs: u64,

    /// Exit after this many completed tasks (0 disables recycling)
    #[serde(default = "default_max_tasks")]
    pub max_tasks_per_worker: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConversionConfig {
    /// External converter for office formats
    #[serde(default = "default_conversion_command")]
    pub command: String,

    /// Arguments; `{input}` is replaced with the file path
    #[serde(default = "default_conversion_args")]
    pub args: Vec<String>,

    /// Parent directory for scratch downloads (system temp when unset)
    pub scratch_dir: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExportConfig {
    /// Renderer binary
    #[serde(default = "default_pandoc")]
    pub pandoc_path: String,

    /// Corporate style template
    pub reference_docx: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PromptsConfig {
    /// YAML prompt file
    #[serde(default = "default_prompts_path")]
    pub path: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClassificationConfig {
    /// Minimum cosine similarity for a match (inclusive)
    #[serde(default = "default_threshold")]
    pub threshold: f32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProcessingConfig {
    /// Run global fact extraction after a document is indexed
    #[serde(default = "default_true")]
    pub extract_globals: bool,

    /// Characters of body text included in a section embedding
    #[serde(default = "default_embedding_body_chars")]
    pub embedding_body_chars: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level (debug, info, warn, error) or a full EnvFilter directive
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default = "default_true")]
    pub json_logging: bool,

    /// Metrics port (0 to disable)
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Service name for tracing
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }
fn default_request_timeout() -> u64 { 600 }
fn default_shutdown_timeout() -> u64 { 30 }
fn default_max_concurrent() -> usize { 100 }
fn default_max_connections() -> u32 { 20 }
fn default_min_connections() -> u32 { 2 }
fn default_connect_timeout() -> u64 { 10 }
fn default_idle_timeout() -> u64 { 300 }
fn default_provider() -> String { "openai".to_string() }
fn default_embedding_model() -> String { "text-embedding-3-small".to_string() }
fn default_embedding_dimension() -> usize { 1536 }
fn default_provider_timeout() -> u64 { 30 }
fn default_embedding_retries() -> u32 { 3 }
fn default_llm_endpoint() -> String { "https://api.openai.com/v1/chat/completions".to_string() }
fn default_llm_model() -> String { "gpt-4o-mini".to_string() }
fn default_llm_timeout() -> u64 { 120 }
fn default_bucket() -> String { "documents".to_string() }
fn default_queue_poll_timeout() -> u64 { 20 }
fn default_visibility_timeout() -> u64 { 1800 }
fn default_max_retries() -> u32 { 3 }
fn default_retry_delay() -> u64 { 60 }
fn default_soft_timeout() -> u64 { 25 * 60 }
fn default_hard_timeout() -> u64 { 30 * 60 }
fn default_max_tasks() -> u32 { 50 }
fn default_conversion_command() -> String { "pandoc".to_string() }
fn default_conversion_args() -> Vec<String> {
    vec!["{input}".to_string(), "-t".to_string(), "gfm".to_string()]
}
fn default_pandoc() -> String { "pandoc".to_string() }
fn default_prompts_path() -> String { "prompts.yaml".to_string() }
fn default_threshold() -> f32 { 0.85 }
fn default_true() -> bool { true }
fn default_embedding_body_chars() -> usize { 500 }
fn default_log_level() -> String { "info".to_string() }
fn default_metrics_port() -> u16 { 9090 }
fn default_service_name() -> String { "clinforge".to_string() }

impl AppConfig {
    /// Load configuration from environment and files
    pub fn load() -> Result<Self, ConfigError> {
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            // Load base config file
            .add_source(File::with_name("config/default").required(false))
            // Load environment-specific config
            .add_source(File::with_name(&format!("config/{}", env)).required(false))
            // Load local overrides
            .add_source(File::with_name("config/local").required(false))
            // e.g., APP__DATABASE__URL=postgres://...
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Load from a specific file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_secs)
    }

    /// Get shutdown timeout as Duration
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_timeout_secs)
    }

    /// Get the read database URL (falls back to primary)
    pub fn read_database_url(&self) -> &str {
        self.database.read_url.as_deref().unwrap_or(&self.database.url)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_secs: default_request_timeout(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            max_concurrent_requests: default_max_concurrent(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/clinforge".to_string(),
            read_url: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connect_timeout_secs: default_connect_timeout(),
            idle_timeout_secs: default_idle_timeout(),
            auto_migrate: false,
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            api_key: None,
            api_base: None,
            model: default_embedding_model(),
            dimension: default_embedding_dimension(),
            timeout_secs: default_provider_timeout(),
            max_retries: default_embedding_retries(),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            api_key: None,
            endpoint: default_llm_endpoint(),
            model: default_llm_model(),
            timeout_secs: default_llm_timeout(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            url: None,
            key: None,
            bucket: default_bucket(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            processing_queue_url: None,
            poll_timeout_secs: default_queue_poll_timeout(),
            visibility_timeout_secs: default_visibility_timeout(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_secs: default_retry_delay(),
            soft_timeout_secs: default_soft_timeout(),
            hard_timeout_secs: default_hard_timeout(),
            max_tasks_per_worker: default_max_tasks(),
        }
    }
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            command: default_conversion_command(),
            args: default_conversion_args(),
            scratch_dir: None,
        }
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            pandoc_path: default_pandoc(),
            reference_docx: None,
        }
    }
}

impl Default for PromptsConfig {
    fn default() -> Self {
        Self {
            path: default_prompts_path(),
        }
    }
}

impl Default for ClassificationConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
        }
    }
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            extract_globals: true,
            embedding_body_chars: default_embedding_body_chars(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logging: true,
            metrics_port: default_metrics_port(),
            service_name: default_service_name(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            embedding: EmbeddingConfig::default(),
            llm: LlmConfig::default(),
            storage: StorageConfig::default(),
            queue: QueueConfig::default(),
            worker: WorkerConfig::default(),
            conversion: ConversionConfig::default(),
            export: ExportConfig::default(),
            prompts: PromptsConfig::default(),
            classification: ClassificationConfig::default(),
            processing: ProcessingConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.embedding.model, "text-embedding-3-small");
        assert_eq!(config.llm.model, "gpt-4o-mini");
        assert_eq!(config.storage.bucket, "documents");
        assert!((config.classification.threshold - 0.85).abs() < f32::EPSILON);
    }

    #[test]
    fn test_worker_policy_defaults() {
        let worker = WorkerConfig::default();
        assert_eq!(worker.max_retries, 3);
        assert_eq!(worker.retry_delay_secs, 60);
        assert_eq!(worker.hard_timeout_secs, 1800);
        assert_eq!(worker.soft_timeout_secs, 1500);
        assert!(worker.soft_timeout_secs < worker.hard_timeout_secs);
        assert_eq!(worker.max_tasks_per_worker, 50);
    }

    #[test]
    fn test_read_database_fallback() {
        let config = AppConfig::default();
        assert_eq!(config.read_database_url(), "postgres://localhost/clinforge");
    }

    #[test]
    fn test_sections_default_when_absent() {
        let config: AppConfig = Config::builder()
            .set_override("database.url", "sqlite::memory:")
            .and_then(|b| b.build())
            .and_then(|c| c.try_deserialize())
            .unwrap();
        assert_eq!(config.database.url, "sqlite::memory:");
        assert_eq!(config.worker.max_retries, 3);
        assert_eq!(config.prompts.path, "prompts.yaml");
    }
}
