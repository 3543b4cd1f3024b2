//! Study-level fact extraction
//!
//! Reads the synopsis of a project's current documents and asks the LLM for
//! a fixed set of study facts, which every generated section treats as ground
//! truth.

use crate::db::models::{SourceSection, StudyGlobal};
use crate::db::Repository;
use crate::errors::Result;
use crate::llm::{CompletionRequest, LlmClient};
use crate::metrics;
use crate::prompts::PromptStore;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Facts requested from the model
pub const FACT_KEYS: [&str; 8] = [
    "Phase",
    "Drug_Name",
    "Population",
    "Primary_Endpoint",
    "Secondary_Endpoints",
    "Study_Design",
    "Inclusion_Criteria",
    "Exclusion_Criteria",
];

/// Sections fed to the model
const CONTEXT_SECTIONS: u64 = 5;

const EXTRACTION_TEMPERATURE: f32 = 0.3;

/// Fact name -> value
pub type StudyPassport = BTreeMap<String, String>;

#[derive(Clone)]
pub struct GlobalsExtractor {
    repo: Repository,
    llm: Arc<dyn LlmClient>,
    prompts: Arc<PromptStore>,
}

impl GlobalsExtractor {
    pub fn new(repo: Repository, llm: Arc<dyn LlmClient>, prompts: Arc<PromptStore>) -> Self {
        Self { repo, llm, prompts }
    }

    /// Extract the project's facts and replace the stored set.
    ///
    /// Model or parse failures yield an empty passport and leave stored facts
    /// untouched; database errors propagate.
    pub async fn extract(&self, project_id: Uuid) -> Result<StudyPassport> {
        let sections = self.select_sections(project_id).await?;
        if sections.is_empty() {
            info!(project = %project_id, "No current sections to extract facts from");
            metrics::record_extraction("no_sources");
            return Ok(StudyPassport::new());
        }

        let system = self.prompts.get("extraction.system", &[])?;
        let user = self
            .prompts
            .get("extraction.user", &[("content", &context_block(&sections))])?;

        let reply = match self
            .llm
            .complete(CompletionRequest::new(system, user, EXTRACTION_TEMPERATURE))
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                warn!(project = %project_id, error = %e, "Fact extraction call failed");
                metrics::record_extraction("llm_error");
                return Ok(StudyPassport::new());
            }
        };

        let Some(passport) = parse_facts(&reply) else {
            warn!(project = %project_id, "Fact extraction returned unparseable output");
            metrics::record_extraction("unparseable");
            return Ok(StudyPassport::new());
        };

        let facts: Vec<(String, String)> = passport
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        self.repo
            .replace_study_globals(project_id, &facts, sections.first().map(|s| s.id))
            .await?;

        metrics::record_extraction("extracted");
        info!(project = %project_id, facts = facts.len(), "Study facts extracted");
        Ok(passport)
    }

    /// Stored facts of a project
    pub async fn list_globals(&self, project_id: Uuid) -> Result<Vec<StudyGlobal>> {
        self.repo.list_study_globals(project_id).await
    }

    async fn select_sections(&self, project_id: Uuid) -> Result<Vec<SourceSection>> {
        let synopsis = self.repo.synopsis_sections(project_id, CONTEXT_SECTIONS).await?;
        if !synopsis.is_empty() {
            return Ok(synopsis);
        }
        self.repo.leading_sections(project_id, CONTEXT_SECTIONS).await
    }
}

fn context_block(sections: &[SourceSection]) -> String {
    sections
        .iter()
        .map(|s| format!("## {}\n{}", s.header, s.best_content()))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Parse the model's JSON object, tolerating a surrounding code fence.
///
/// Nulls are dropped; non-string values keep their JSON text.
pub fn parse_facts(reply: &str) -> Option<StudyPassport> {
    let text = strip_fence(reply.trim());
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }

    let value: serde_json::Value = serde_json::from_str(&text[start..=end]).ok()?;
    let object = value.as_object()?;

    Some(
        object
            .iter()
            .filter_map(|(key, value)| match value {
                serde_json::Value::Null => None,
                serde_json::Value::String(s) => Some((key.clone(), s.clone())),
                other => Some((key.clone(), other.to_string())),
            })
            .collect(),
    )
}

fn strip_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.trim_end().strip_suffix("```").unwrap_or(rest).trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;
    use crate::testing::{shipped_prompts, TestGraph};

    #[test]
    fn test_parse_fenced_json() {
        let reply = "```json\n{\"Phase\": \"3\", \"Drug_Name\": null, \"Population\": [\"adults\"]}\n```";
        let facts = parse_facts(reply).unwrap();
        assert_eq!(facts.get("Phase").map(String::as_str), Some("3"));
        assert!(!facts.contains_key("Drug_Name"));
        assert_eq!(facts.get("Population").map(String::as_str), Some("[\"adults\"]"));
    }

    #[test]
    fn test_parse_plain_fence_and_prose() {
        assert!(parse_facts("```\n{\"Phase\": 2}\n```").is_some());
        assert_eq!(
            parse_facts("Here you go: {\"Phase\": \"1\"} hope it helps")
                .unwrap()
                .get("Phase")
                .map(String::as_str),
            Some("1")
        );
        assert!(parse_facts("no json here").is_none());
        assert!(parse_facts("[1, 2]").is_none());
    }

    #[tokio::test]
    async fn test_no_sections_skips_llm() {
        let graph = TestGraph::new().await;
        let llm = Arc::new(MockLlmClient::replying("{\"Phase\": \"3\"}"));
        let extractor = GlobalsExtractor::new(graph.repo.clone(), llm.clone(), shipped_prompts());

        assert!(extractor.extract(graph.project.id).await.unwrap().is_empty());
        assert!(llm.requests().is_empty());
    }

    #[tokio::test]
    async fn test_prefers_synopsis_and_replaces_facts() {
        let graph = TestGraph::new().await;
        let doc = graph.document(true).await;
        let sections = graph
            .sections(
                doc.id,
                &[
                    ("Introduction", None, "Background"),
                    ("Protocol SYNOPSIS", None, "Phase 3, drug X"),
                ],
            )
            .await;

        let llm = Arc::new(MockLlmClient::replying(
            "```json\n{\"Phase\": \"3\", \"Drug_Name\": \"X\", \"Population\": null}\n```",
        ));
        let extractor = GlobalsExtractor::new(graph.repo.clone(), llm.clone(), shipped_prompts());

        let passport = extractor.extract(graph.project.id).await.unwrap();
        assert_eq!(passport.len(), 2);

        let request = &llm.requests()[0];
        assert_eq!(request.temperature, 0.3);
        assert!(request.user.contains("## Protocol SYNOPSIS"));
        assert!(!request.user.contains("## Introduction"));

        let stored = extractor.list_globals(graph.project.id).await.unwrap();
        assert_eq!(stored.len(), 2);
        assert!(stored.iter().all(|g| g.source_section_id == Some(sections[1].id)));

        // A second run replaces rather than appends
        extractor.extract(graph.project.id).await.unwrap();
        assert_eq!(extractor.list_globals(graph.project.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_llm_failure_keeps_existing_facts() {
        let graph = TestGraph::new().await;
        let doc = graph.document(true).await;
        graph.sections(doc.id, &[("Synopsis", None, "Phase 2")]).await;
        graph
            .repo
            .replace_study_globals(graph.project.id, &[("Phase".into(), "2".into())], None)
            .await
            .unwrap();

        let extractor = GlobalsExtractor::new(
            graph.repo.clone(),
            Arc::new(MockLlmClient::failing("timeout")),
            shipped_prompts(),
        );

        assert!(extractor.extract(graph.project.id).await.unwrap().is_empty());
        assert_eq!(extractor.list_globals(graph.project.id).await.unwrap().len(), 1);
    }
}
