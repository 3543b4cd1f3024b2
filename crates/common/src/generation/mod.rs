//! Deliverable authoring
//!
//! - [`extractor`]: study-level facts pulled from the synopsis
//! - [`writer`]: LLM drafting of deliverable sections with edit history
//! - [`exporter`]: assembly and DOCX rendering of a finished deliverable
//! - [`markup`]: markdown to HTML for drafted sections

pub mod exporter;
pub mod extractor;
pub mod markup;
pub mod writer;

pub use exporter::{DeliverableExporter, DocumentRenderer, PandocRenderer};
pub use extractor::{GlobalsExtractor, StudyPassport, FACT_KEYS};
pub use writer::{GenerationDraft, SectionWriter};
