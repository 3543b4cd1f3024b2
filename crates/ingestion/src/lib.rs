//! ClinForge Ingestion
//!
//! Turns uploaded source documents into classified, embedded sections:
//! 1. Download the file into a scratch directory
//! 2. Convert it to markdown (lopdf, direct read or an external converter)
//! 3. Split it into header-delimited sections with their tables
//! 4. Classify, embed and upsert each section
//! 5. Optionally refresh the project's study facts
//!
//! The `ingestion-worker` binary drives the pipeline from an SQS queue; the
//! gateway calls it directly for synchronous parses.

pub mod converter;
pub mod errors;
pub mod markdown;
pub mod pdf;
pub mod processor;
pub mod sectionizer;
pub mod worker;

pub use converter::{ConvertedDocument, ConverterRouter, DocumentConverter};
pub use errors::IngestionError;
pub use processor::{
    DocumentProcessor, ProcessRequest, RemoteFetcher, SectionSummary, SourceFetcher, SourceLocator,
};
pub use sectionizer::{Section, Sectionizer};
pub use worker::{RetryPolicy, Worker};
