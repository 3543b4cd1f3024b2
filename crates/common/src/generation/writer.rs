//! Section writer
//!
//! Drafts a deliverable section from the source sections its mapping rules
//! point to, grounded on the project's study facts, and records every content
//! change in the section history.

use super::markup::{escape_html, section_html};
use crate::db::models::{CustomSection, DeliverableSection, SectionStatus, SourceSection};
use crate::db::{GenerationWrite, Repository};
use crate::errors::{AppError, Result};
use crate::graph::{GraphResolver, MappingRule};
use crate::llm::{CompletionRequest, LlmClient};
use crate::metrics;
use crate::prompts::PromptStore;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

const GENERATION_TEMPERATURE: f32 = 0.7;
const GENERATION_MAX_TOKENS: u32 = 3000;
const SOURCE_SEPARATOR: &str = "\n\n---\n\n";

pub const REASON_AI: &str = "AI generation";
pub const REASON_NO_RULES: &str = "Placeholder: no mapping rules";
pub const REASON_NO_SOURCES: &str = "Placeholder: no source data";
pub const REASON_MANUAL: &str = "Manual edit";

/// Preview of a generation that persists nothing
#[derive(Debug, Clone, Serialize)]
pub struct GenerationDraft {
    /// Raw model output (markdown)
    pub content: String,
    pub used_source_section_ids: Vec<Uuid>,
    pub mapping_logic_used: Vec<String>,
}

/// Outcome of preparing a node for generation
enum Prepared {
    NoRules,
    NoSources,
    Ready {
        rules: Vec<MappingRule>,
        sources: Vec<SourceSection>,
        request: CompletionRequest,
    },
}

#[derive(Clone)]
pub struct SectionWriter {
    repo: Repository,
    resolver: GraphResolver,
    llm: Arc<dyn LlmClient>,
    prompts: Arc<PromptStore>,
}

impl SectionWriter {
    pub fn new(repo: Repository, llm: Arc<dyn LlmClient>, prompts: Arc<PromptStore>) -> Self {
        Self {
            resolver: GraphResolver::new(repo.clone()),
            repo,
            llm,
            prompts,
        }
    }

    /// Generate and persist a deliverable section, returning its HTML.
    ///
    /// A section locked by another user is rejected before anything runs.
    /// Without rules or sources a placeholder is stored instead.
    pub async fn generate(&self, deliverable_section_id: Uuid, user_id: Option<Uuid>) -> Result<String> {
        let section = self
            .repo
            .find_deliverable_section(deliverable_section_id)
            .await?
            .ok_or_else(|| AppError::not_found("deliverable_section", deliverable_section_id))?;
        ensure_unlocked_for(&section, user_id)?;

        let node = self
            .repo
            .find_custom_section(section.custom_section_id)
            .await?
            .ok_or_else(|| AppError::not_found("custom_section", section.custom_section_id))?;
        let deliverable = self
            .repo
            .find_deliverable(section.deliverable_id)
            .await?
            .ok_or_else(|| AppError::not_found("deliverable", section.deliverable_id))?;
        let project = self
            .repo
            .find_project(deliverable.project_id)
            .await?
            .ok_or_else(|| AppError::not_found("project", deliverable.project_id))?;

        let (rules, sources, request) = match self.prepare(project.id, &node).await? {
            Prepared::NoRules => {
                return self
                    .write_placeholder(&section, &node, user_id, "placeholders.manual_input", REASON_NO_RULES)
                    .await
            }
            Prepared::NoSources => {
                return self
                    .write_placeholder(&section, &node, user_id, "placeholders.no_source", REASON_NO_SOURCES)
                    .await
            }
            Prepared::Ready {
                rules,
                sources,
                request,
            } => (rules, sources, request),
        };

        let markdown = match self.llm.complete(request).await {
            Ok(markdown) => markdown,
            Err(e) => {
                metrics::record_generation("error");
                return Err(e);
            }
        };
        let html = section_html(&markdown, &node.title);
        let used: Vec<Uuid> = sources.iter().map(|s| s.id).collect();

        self.repo
            .apply_section_write(GenerationWrite {
                section_id: section.id,
                content_html: html.clone(),
                status: Some(SectionStatus::DraftAi),
                used_source_section_ids: Some(used.clone()),
                user_id,
                reason: REASON_AI.to_string(),
            })
            .await?;

        metrics::record_generation("generated");
        info!(
            section = %section.id,
            rules = rules.len(),
            sources = used.len(),
            "Section generated"
        );
        Ok(html)
    }

    /// Run the same walk and prompt as [`generate`](Self::generate) for a
    /// template node, without writing anything
    pub async fn draft(&self, project_id: Uuid, custom_section_id: Uuid) -> Result<GenerationDraft> {
        let node = self
            .repo
            .find_custom_section(custom_section_id)
            .await?
            .ok_or_else(|| AppError::not_found("custom_section", custom_section_id))?;

        match self.prepare(project_id, &node).await? {
            Prepared::NoRules => Err(AppError::validation(format!(
                "No mapping rules defined for section '{}'",
                node.title
            ))),
            Prepared::NoSources => Err(AppError::validation(format!(
                "No source content found for section '{}'",
                node.title
            ))),
            Prepared::Ready {
                rules,
                sources,
                request,
            } => Ok(GenerationDraft {
                content: self.llm.complete(request).await?,
                used_source_section_ids: sources.iter().map(|s| s.id).collect(),
                mapping_logic_used: rules.iter().map(MappingRule::describe).collect(),
            }),
        }
    }

    /// Replace content by hand; the section moves to `in_progress`
    pub async fn update_content(
        &self,
        deliverable_section_id: Uuid,
        user_id: Uuid,
        content_html: String,
    ) -> Result<DeliverableSection> {
        let section = self
            .repo
            .find_deliverable_section(deliverable_section_id)
            .await?
            .ok_or_else(|| AppError::not_found("deliverable_section", deliverable_section_id))?;
        ensure_unlocked_for(&section, Some(user_id))?;

        self.repo
            .apply_section_write(GenerationWrite {
                section_id: section.id,
                content_html,
                status: Some(SectionStatus::InProgress),
                used_source_section_ids: None,
                user_id: Some(user_id),
                reason: REASON_MANUAL.to_string(),
            })
            .await
    }

    async fn prepare(&self, project_id: Uuid, node: &CustomSection) -> Result<Prepared> {
        let Some(rules) = self.resolver.resolve(node.id).await? else {
            return Ok(Prepared::NoRules);
        };

        let sources = self.resolver.retrieve_sources(project_id, &rules).await?;
        if sources.is_empty() {
            return Ok(Prepared::NoSources);
        }

        let globals = self.render_globals(project_id).await?;
        let instructions = self.render_instructions(&rules)?;

        let system = self.prompts.get("generation.system_role", &[("globals", &globals)])?;
        let user = self.prompts.get(
            "generation.section_generation",
            &[
                ("section_title", &node.title),
                ("globals", &globals),
                ("instructions", &instructions),
                ("source_content", &source_block(&sources)),
            ],
        )?;

        Ok(Prepared::Ready {
            rules,
            sources,
            request: CompletionRequest::new(system, user, GENERATION_TEMPERATURE)
                .with_max_tokens(GENERATION_MAX_TOKENS),
        })
    }

    async fn render_globals(&self, project_id: Uuid) -> Result<String> {
        let globals = self.repo.list_study_globals(project_id).await?;
        if globals.is_empty() {
            return self.prompts.get("placeholders.no_globals", &[]);
        }
        Ok(globals
            .iter()
            .map(|g| format!("- **{}**: {}", g.variable_name, g.variable_value))
            .collect::<Vec<_>>()
            .join("\n"))
    }

    fn render_instructions(&self, rules: &[MappingRule]) -> Result<String> {
        let instructions: Vec<&str> = rules
            .iter()
            .filter_map(MappingRule::instruction)
            .filter(|i| !i.trim().is_empty())
            .collect();
        if instructions.is_empty() {
            return self.prompts.get("generation.default_instruction", &[]);
        }
        Ok(instructions.join("\n"))
    }

    async fn write_placeholder(
        &self,
        section: &DeliverableSection,
        node: &CustomSection,
        user_id: Option<Uuid>,
        prompt_key: &str,
        reason: &str,
    ) -> Result<String> {
        let html = self
            .prompts
            .get(prompt_key, &[("title", &escape_html(&node.title))])?;
        self.repo
            .apply_section_write(GenerationWrite {
                section_id: section.id,
                content_html: html.clone(),
                status: None,
                used_source_section_ids: Some(Vec::new()),
                user_id,
                reason: reason.to_string(),
            })
            .await?;

        metrics::record_generation("placeholder");
        warn!(section = %section.id, reason, "Stored placeholder instead of generating");
        Ok(html)
    }
}

/// Reject writes to a section locked by someone other than `user_id`
fn ensure_unlocked_for(section: &DeliverableSection, user_id: Option<Uuid>) -> Result<()> {
    match section.locked_by_user_id {
        Some(holder) if Some(holder) != user_id => Err(AppError::SectionLocked {
            section_id: section.id.to_string(),
            locked_by: holder.to_string(),
        }),
        _ => Ok(()),
    }
}

fn source_block(sections: &[SourceSection]) -> String {
    sections
        .iter()
        .map(|s| {
            let heading = if s.header.trim().is_empty() {
                format!("Section {}", s.section_number.as_deref().unwrap_or("N/A"))
            } else {
                s.header.clone()
            };
            format!("{}\n{}", heading, s.best_content())
        })
        .collect::<Vec<_>>()
        .join(SOURCE_SEPARATOR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::NewCustomMapping;
    use crate::llm::MockLlmClient;
    use crate::testing::{shipped_prompts, TestGraph};

    async fn map_target_to_source(graph: &TestGraph, instruction: Option<&str>) {
        graph
            .repo
            .create_custom_mapping(NewCustomMapping {
                target_custom_section_id: graph.custom_target.id,
                source_custom_section_id: Some(graph.custom_source.id),
                instruction: instruction.map(String::from),
                ..Default::default()
            })
            .await
            .unwrap();
    }

    fn target_section(sections: &[DeliverableSection], graph: &TestGraph) -> DeliverableSection {
        sections
            .iter()
            .find(|s| s.custom_section_id == graph.custom_target.id)
            .cloned()
            .unwrap()
    }

    #[tokio::test]
    async fn test_no_rules_writes_placeholder() {
        let graph = TestGraph::new().await;
        let (_, sections) = graph.deliverable().await;
        let section = target_section(&sections, &graph);
        let llm = Arc::new(MockLlmClient::replying("unused"));
        let writer = SectionWriter::new(graph.repo.clone(), llm.clone(), shipped_prompts());

        let html = writer.generate(section.id, None).await.unwrap();

        assert_eq!(html, "<h1>Efficacy</h1><p>Section requires manual input.</p>");
        assert!(llm.requests().is_empty());

        let stored = graph.repo.find_deliverable_section(section.id).await.unwrap().unwrap();
        assert_eq!(stored.status, "empty");
        let history = graph.repo.section_history(section.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].change_reason.as_deref(), Some(REASON_NO_RULES));
    }

    #[tokio::test]
    async fn test_no_sources_writes_placeholder() {
        let graph = TestGraph::new().await;
        map_target_to_source(&graph, None).await;
        let (_, sections) = graph.deliverable().await;
        let section = target_section(&sections, &graph);
        let writer = SectionWriter::new(
            graph.repo.clone(),
            Arc::new(MockLlmClient::replying("unused")),
            shipped_prompts(),
        );

        let html = writer.generate(section.id, None).await.unwrap();
        assert_eq!(html, "<h1>Efficacy</h1><p>No source data found for generation.</p>");
        let history = graph.repo.section_history(section.id).await.unwrap();
        assert_eq!(history[0].change_reason.as_deref(), Some(REASON_NO_SOURCES));

        let stored = graph.repo.find_deliverable_section(section.id).await.unwrap().unwrap();
        assert_ne!(stored.section_status(), Some(SectionStatus::DraftAi));
        assert_eq!(stored.status, "empty");
        assert!(stored.used_source_ids().is_empty());
    }

    #[tokio::test]
    async fn test_empty_custom_rules_do_not_fall_back_to_ideal() {
        let graph = TestGraph::new().await;
        // Canonical rule with content behind it
        graph
            .repo
            .create_ideal_mapping(graph.ideal_target.id, Some(graph.ideal_source.id), None, None)
            .await
            .unwrap();
        let doc = graph.document(true).await;
        graph
            .sections(doc.id, &[("Synopsis", Some(graph.custom_source.id), "Phase 3 trial of X")])
            .await;
        // Custom rule reading a node nothing was classified into
        graph
            .repo
            .create_custom_mapping(NewCustomMapping {
                target_custom_section_id: graph.custom_target.id,
                source_custom_section_id: Some(graph.custom_child.id),
                ..Default::default()
            })
            .await
            .unwrap();

        let (_, sections) = graph.deliverable().await;
        let section = target_section(&sections, &graph);
        let llm = Arc::new(MockLlmClient::replying("unused"));
        let writer = SectionWriter::new(graph.repo.clone(), llm.clone(), shipped_prompts());

        let html = writer.generate(section.id, None).await.unwrap();
        assert_eq!(html, "<h1>Efficacy</h1><p>No source data found for generation.</p>");
        assert!(llm.requests().is_empty());
        let history = graph.repo.section_history(section.id).await.unwrap();
        assert_eq!(history[0].change_reason.as_deref(), Some(REASON_NO_SOURCES));

        let err = writer.draft(graph.project.id, graph.custom_target.id).await.unwrap_err();
        assert!(matches!(err, AppError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_default_instruction_without_rule_instructions() {
        let graph = TestGraph::new().await;
        map_target_to_source(&graph, None).await;
        let doc = graph.document(true).await;
        let table = "| Visit | Day |\n|---|---|\n| Screening | -28 |";
        graph
            .sections(doc.id, &[("Schedule", Some(graph.custom_source.id), table)])
            .await;
        let (_, sections) = graph.deliverable().await;
        let section = target_section(&sections, &graph);
        let llm = Arc::new(MockLlmClient::replying("Screening occurred on day -28."));
        let writer = SectionWriter::new(graph.repo.clone(), llm.clone(), shipped_prompts());

        writer.generate(section.id, None).await.unwrap();

        let user = &llm.requests()[0].user;
        assert!(user.contains("Markdown tables"));
        assert!(user.contains("describe their key data as prose"));
        assert!(user.contains("past tense"));
    }

    #[tokio::test]
    async fn test_generated_tables_and_lists_render_as_html() {
        let graph = TestGraph::new().await;
        map_target_to_source(&graph, None).await;
        let doc = graph.document(true).await;
        graph
            .sections(doc.id, &[("Synopsis", Some(graph.custom_source.id), "text")])
            .await;
        let (_, sections) = graph.deliverable().await;
        let section = target_section(&sections, &graph);
        let reply = "| Endpoint | Result |\n|---|---|\n| ORR | 42% |\n\n1. *first* item";
        let writer = SectionWriter::new(
            graph.repo.clone(),
            Arc::new(MockLlmClient::replying(reply)),
            shipped_prompts(),
        );

        let html = writer.generate(section.id, None).await.unwrap();
        assert!(html.starts_with("<h1>Efficacy</h1>\n<table>"));
        assert!(html.contains("<td>42%</td>"));
        assert!(html.contains("<ol>"));
        assert!(html.contains("<em>first</em>"));
        assert!(!html.contains("| ORR |"));
    }

    #[tokio::test]
    async fn test_repeated_generation_is_stable() {
        let graph = TestGraph::new().await;
        map_target_to_source(&graph, Some("Focus on the primary endpoint")).await;
        let doc = graph.document(true).await;
        graph
            .sections(doc.id, &[("Synopsis", Some(graph.custom_source.id), "Phase 3 trial of X")])
            .await;
        let (_, sections) = graph.deliverable().await;
        let section = target_section(&sections, &graph);
        let llm = Arc::new(MockLlmClient::replying("The study met its endpoint."));
        let writer = SectionWriter::new(graph.repo.clone(), llm.clone(), shipped_prompts());

        let first = writer.generate(section.id, None).await.unwrap();
        let second = writer.generate(section.id, None).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(llm.requests()[0], llm.requests()[1]);

        let stored = graph.repo.find_deliverable_section(section.id).await.unwrap().unwrap();
        assert_eq!(stored.content_html.as_deref(), Some(second.as_str()));
        let history = graph.repo.section_history(section.id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|h| h.content_snapshot == first));
    }

    #[tokio::test]
    async fn test_generation_persists_with_provenance() {
        let graph = TestGraph::new().await;
        map_target_to_source(&graph, Some("Focus on the primary endpoint")).await;
        let doc = graph.document(true).await;
        let sources = graph
            .sections(
                doc.id,
                &[
                    ("Synopsis", Some(graph.custom_source.id), "Phase 3 trial of X"),
                    ("", Some(graph.custom_source.id), "Untitled body"),
                ],
            )
            .await;
        graph
            .repo
            .replace_study_globals(graph.project.id, &[("Phase".into(), "3".into())], None)
            .await
            .unwrap();

        let (_, sections) = graph.deliverable().await;
        let section = target_section(&sections, &graph);
        let llm = Arc::new(MockLlmClient::replying("The study met its endpoint."));
        let writer = SectionWriter::new(graph.repo.clone(), llm.clone(), shipped_prompts());
        let user = Uuid::new_v4();

        let html = writer.generate(section.id, Some(user)).await.unwrap();
        assert_eq!(html, "<h1>Efficacy</h1>\n<p>The study met its endpoint.</p>");

        let request = &llm.requests()[0];
        assert_eq!(request.temperature, 0.7);
        assert_eq!(request.max_tokens, Some(3000));
        assert!(request.system.contains("- **Phase**: 3"));
        assert!(request.user.contains("Focus on the primary endpoint"));
        assert!(request.user.contains("Synopsis\nPhase 3 trial of X\n\n---\n\nSection N/A\nUntitled body"));

        let stored = graph.repo.find_deliverable_section(section.id).await.unwrap().unwrap();
        assert_eq!(stored.section_status(), Some(SectionStatus::DraftAi));
        assert_eq!(stored.used_source_ids(), vec![sources[0].id, sources[1].id]);

        let history = graph.repo.section_history(section.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].changed_by_user_id, Some(user));
        assert_eq!(history[0].change_reason.as_deref(), Some(REASON_AI));
    }

    #[tokio::test]
    async fn test_llm_failure_propagates_without_write() {
        let graph = TestGraph::new().await;
        map_target_to_source(&graph, None).await;
        let doc = graph.document(true).await;
        graph
            .sections(doc.id, &[("Synopsis", Some(graph.custom_source.id), "text")])
            .await;
        let (_, sections) = graph.deliverable().await;
        let section = target_section(&sections, &graph);
        let writer = SectionWriter::new(
            graph.repo.clone(),
            Arc::new(MockLlmClient::failing("rate limited")),
            shipped_prompts(),
        );

        let err = writer.generate(section.id, None).await.unwrap_err();
        assert!(matches!(err, AppError::LlmError { .. }));
        assert!(graph.repo.section_history(section.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_locked_section_rejected() {
        let graph = TestGraph::new().await;
        let (_, sections) = graph.deliverable().await;
        let section = target_section(&sections, &graph);
        graph.repo.lock_section(section.id, Uuid::new_v4()).await.unwrap();

        let llm = Arc::new(MockLlmClient::replying("unused"));
        let writer = SectionWriter::new(graph.repo.clone(), llm.clone(), shipped_prompts());

        let err = writer.generate(section.id, Some(Uuid::new_v4())).await.unwrap_err();
        assert!(matches!(err, AppError::SectionLocked { .. }));
        assert!(graph.repo.section_history(section.id).await.unwrap().is_empty());

        let err = writer
            .update_content(section.id, Uuid::new_v4(), "<p>x</p>".into())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::SectionLocked { .. }));
    }

    #[tokio::test]
    async fn test_manual_edit_moves_to_in_progress() {
        let graph = TestGraph::new().await;
        let (_, sections) = graph.deliverable().await;
        let section = target_section(&sections, &graph);
        let writer = SectionWriter::new(
            graph.repo.clone(),
            Arc::new(MockLlmClient::default()),
            shipped_prompts(),
        );
        let user = Uuid::new_v4();

        let updated = writer
            .update_content(section.id, user, "<p>Edited</p>".into())
            .await
            .unwrap();
        assert_eq!(updated.section_status(), Some(SectionStatus::InProgress));
        let history = graph.repo.section_history(section.id).await.unwrap();
        assert_eq!(history[0].change_reason.as_deref(), Some(REASON_MANUAL));
        assert_eq!(history[0].content_snapshot, "<p>Edited</p>");
    }

    #[tokio::test]
    async fn test_draft_writes_nothing() {
        let graph = TestGraph::new().await;
        map_target_to_source(&graph, Some("Summarize")).await;
        let doc = graph.document(true).await;
        let sources = graph
            .sections(doc.id, &[("Synopsis", Some(graph.custom_source.id), "text")])
            .await;
        let writer = SectionWriter::new(
            graph.repo.clone(),
            Arc::new(MockLlmClient::replying("# Efficacy\nDraft")),
            shipped_prompts(),
        );

        let draft = writer.draft(graph.project.id, graph.custom_target.id).await.unwrap();
        assert_eq!(draft.content, "# Efficacy\nDraft");
        assert_eq!(draft.used_source_section_ids, vec![sources[0].id]);
        assert_eq!(draft.mapping_logic_used.len(), 1);
        assert!(draft.mapping_logic_used[0].starts_with("CustomMapping from custom section"));

        let err = writer.draft(graph.project.id, graph.custom_child.id).await.unwrap_err();
        assert!(matches!(err, AppError::Validation { .. }));
    }
}
