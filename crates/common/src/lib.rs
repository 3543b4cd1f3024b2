//! ClinForge Common Library
//!
//! Shared code for the ClinForge services including:
//! - Database models and repository patterns
//! - Template graph classification and resolution
//! - Embedding and LLM client abstractions
//! - Section generation, fact extraction and export
//! - Error types and handling
//! - Configuration management
//! - Metrics and observability

pub mod config;
pub mod db;
pub mod embeddings;
pub mod errors;
pub mod generation;
pub mod graph;
pub mod llm;
pub mod metrics;
pub mod prompts;
pub mod queue;
pub mod storage;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use config::AppConfig;
pub use db::Repository;
pub use embeddings::Embedder;
pub use errors::{AppError, Result};
pub use llm::LlmClient;
pub use prompts::PromptStore;

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
