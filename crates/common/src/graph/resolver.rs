//! Mapping-rule resolution over the two template layers

use crate::db::models::{CustomMapping, IdealMapping, SourceSection};
use crate::db::Repository;
use crate::errors::{AppError, Result};
use serde::Serialize;
use std::collections::HashSet;
use tracing::debug;
use uuid::Uuid;

/// A rule feeding a custom node, from whichever layer supplied it
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "layer", content = "rule", rename_all = "snake_case")]
pub enum MappingRule {
    Custom(CustomMapping),
    Ideal(IdealMapping),
}

impl MappingRule {
    pub fn instruction(&self) -> Option<&str> {
        match self {
            MappingRule::Custom(m) => m.instruction.as_deref(),
            MappingRule::Ideal(m) => m.instruction.as_deref(),
        }
    }

    /// Whether the rule names no source at all
    pub fn is_manual(&self) -> bool {
        match self {
            MappingRule::Custom(m) => {
                m.source_custom_section_id.is_none() && m.source_ideal_section_id.is_none()
            }
            MappingRule::Ideal(m) => m.source_ideal_section_id.is_none(),
        }
    }

    /// One-line description for drafts and logs
    pub fn describe(&self) -> String {
        let (kind, source) = match self {
            MappingRule::Custom(m) => (
                "CustomMapping",
                match (m.source_custom_section_id, m.source_ideal_section_id) {
                    (Some(id), _) => format!("custom section {}", id),
                    (None, Some(id)) => format!("ideal section {}", id),
                    (None, None) => "manual input".to_string(),
                },
            ),
            MappingRule::Ideal(m) => (
                "IdealMapping",
                m.source_ideal_section_id
                    .map(|id| format!("ideal section {}", id))
                    .unwrap_or_else(|| "manual input".to_string()),
            ),
        };

        match self.instruction() {
            Some(instruction) => format!(
                "{} from {} with instruction: {}",
                kind,
                source,
                instruction.chars().take(100).collect::<String>()
            ),
            None => format!("{} from {}", kind, source),
        }
    }
}

/// Walks mapping rules and fetches the source sections they point to
#[derive(Clone)]
pub struct GraphResolver {
    repo: Repository,
}

impl GraphResolver {
    pub fn new(repo: Repository) -> Self {
        Self { repo }
    }

    /// Rules feeding `target`.
    ///
    /// Custom-layer rules win; canonical rules of the linked ideal node are
    /// used only when the custom layer has none. `None` when neither has any.
    pub async fn resolve(&self, target: Uuid) -> Result<Option<Vec<MappingRule>>> {
        let node = self
            .repo
            .find_custom_section(target)
            .await?
            .ok_or_else(|| AppError::not_found("custom_section", target))?;

        let custom = self.repo.custom_mappings_targeting(target).await?;
        if !custom.is_empty() {
            debug!(target = %target, rules = custom.len(), "Resolved custom-layer rules");
            return Ok(Some(custom.into_iter().map(MappingRule::Custom).collect()));
        }

        let Some(ideal_id) = node.ideal_section_id else {
            return Ok(None);
        };

        let ideal = self.repo.ideal_mappings_targeting(ideal_id).await?;
        if ideal.is_empty() {
            return Ok(None);
        }

        debug!(target = %target, ideal = %ideal_id, rules = ideal.len(), "Resolved canonical rules");
        Ok(Some(ideal.into_iter().map(MappingRule::Ideal).collect()))
    }

    /// Every custom node derived from a canonical node
    async fn derived_nodes(&self, ideal_id: Uuid) -> Result<Vec<Uuid>> {
        Ok(self
            .repo
            .custom_sections_derived_from(ideal_id)
            .await?
            .into_iter()
            .map(|s| s.id)
            .collect())
    }

    /// Custom nodes a rule reads from
    async fn source_nodes(&self, rule: &MappingRule) -> Result<Vec<Uuid>> {
        match rule {
            MappingRule::Custom(m) => match (m.source_custom_section_id, m.source_ideal_section_id) {
                (Some(id), _) => Ok(vec![id]),
                (None, Some(ideal_id)) => self.derived_nodes(ideal_id).await,
                (None, None) => Ok(Vec::new()),
            },
            MappingRule::Ideal(m) => match m.source_ideal_section_id {
                Some(ideal_id) => self.derived_nodes(ideal_id).await,
                None => Ok(Vec::new()),
            },
        }
    }

    /// Current-version source sections of `project` feeding one rule
    pub async fn retrieve_for_rule(&self, project_id: Uuid, rule: &MappingRule) -> Result<Vec<SourceSection>> {
        let nodes = self.source_nodes(rule).await?;
        if nodes.is_empty() {
            return Ok(Vec::new());
        }
        self.repo
            .current_sections_for_custom_sections(project_id, &nodes)
            .await
    }

    /// Sources of every rule, deduplicated by id in first-seen order
    pub async fn retrieve_sources(&self, project_id: Uuid, rules: &[MappingRule]) -> Result<Vec<SourceSection>> {
        let mut seen = HashSet::new();
        let mut sections = Vec::new();

        for rule in rules {
            for section in self.retrieve_for_rule(project_id, rule).await? {
                if seen.insert(section.id) {
                    sections.push(section);
                }
            }
        }

        Ok(sections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::NewCustomMapping;
    use crate::testing::TestGraph;

    #[tokio::test]
    async fn test_unknown_target_is_not_found() {
        let graph = TestGraph::new().await;
        let resolver = GraphResolver::new(graph.repo.clone());
        let missing = Uuid::new_v4();

        match resolver.resolve(missing).await {
            Err(AppError::NotFound { id, .. }) => assert_eq!(id, missing.to_string()),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_no_rules_is_none() {
        let graph = TestGraph::new().await;
        let resolver = GraphResolver::new(graph.repo.clone());
        assert_eq!(resolver.resolve(graph.custom_child.id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_falls_back_to_canonical_layer() {
        let graph = TestGraph::new().await;
        graph
            .repo
            .create_ideal_mapping(
                graph.ideal_target.id,
                Some(graph.ideal_source.id),
                Some("Summarize efficacy".into()),
                None,
            )
            .await
            .unwrap();

        let resolver = GraphResolver::new(graph.repo.clone());
        let rules = resolver.resolve(graph.custom_target.id).await.unwrap().unwrap();
        assert_eq!(rules.len(), 1);
        assert!(matches!(rules[0], MappingRule::Ideal(_)));
    }

    #[tokio::test]
    async fn test_custom_layer_shadows_canonical() {
        let graph = TestGraph::new().await;
        graph
            .repo
            .create_ideal_mapping(graph.ideal_target.id, Some(graph.ideal_source.id), None, None)
            .await
            .unwrap();
        graph
            .repo
            .create_custom_mapping(NewCustomMapping {
                target_custom_section_id: graph.custom_target.id,
                source_custom_section_id: Some(graph.custom_source.id),
                order_index: Some(2),
                ..Default::default()
            })
            .await
            .unwrap();
        graph
            .repo
            .create_custom_mapping(NewCustomMapping {
                target_custom_section_id: graph.custom_target.id,
                instruction: Some("Write by hand".into()),
                order_index: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();

        let resolver = GraphResolver::new(graph.repo.clone());
        let rules = resolver.resolve(graph.custom_target.id).await.unwrap().unwrap();

        assert_eq!(rules.len(), 2);
        assert!(rules.iter().all(|r| matches!(r, MappingRule::Custom(_))));
        assert!(rules[0].is_manual());
        assert_eq!(rules[0].instruction(), Some("Write by hand"));
    }

    #[tokio::test]
    async fn test_sources_current_version_only_and_deduplicated() {
        let graph = TestGraph::new().await;
        let current = graph.document(true).await;
        let stale = graph.document(false).await;

        let fresh = graph
            .sections(current.id, &[("Synopsis", Some(graph.custom_source.id), "Phase 3 study")])
            .await;
        graph
            .sections(stale.id, &[("Synopsis", Some(graph.custom_source.id), "Phase 2 study")])
            .await;

        let by_node = MappingRule::Custom(
            graph
                .repo
                .create_custom_mapping(NewCustomMapping {
                    target_custom_section_id: graph.custom_target.id,
                    source_custom_section_id: Some(graph.custom_source.id),
                    ..Default::default()
                })
                .await
                .unwrap(),
        );
        let by_ideal = MappingRule::Custom(
            graph
                .repo
                .create_custom_mapping(NewCustomMapping {
                    target_custom_section_id: graph.custom_target.id,
                    source_ideal_section_id: Some(graph.ideal_source.id),
                    ..Default::default()
                })
                .await
                .unwrap(),
        );

        let resolver = GraphResolver::new(graph.repo.clone());
        let sources = resolver
            .retrieve_sources(graph.project.id, &[by_node, by_ideal])
            .await
            .unwrap();

        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].id, fresh[0].id);
    }

    #[tokio::test]
    async fn test_rules_without_matches_yield_empty() {
        let graph = TestGraph::new().await;
        let rule = MappingRule::Custom(
            graph
                .repo
                .create_custom_mapping(NewCustomMapping {
                    target_custom_section_id: graph.custom_target.id,
                    source_custom_section_id: Some(graph.custom_source.id),
                    ..Default::default()
                })
                .await
                .unwrap(),
        );

        let resolver = GraphResolver::new(graph.repo.clone());
        let sources = resolver.retrieve_sources(graph.project.id, &[rule]).await.unwrap();
        assert!(sources.is_empty());
    }

    #[test]
    fn test_describe_truncates_instruction() {
        let rule = MappingRule::Ideal(IdealMapping {
            id: Uuid::nil(),
            target_ideal_section_id: Uuid::nil(),
            source_ideal_section_id: None,
            instruction: Some("x".repeat(300)),
            order_index: 0,
            created_at: chrono::Utc::now().into(),
        });
        let text = rule.describe();
        assert!(text.starts_with("IdealMapping from manual input with instruction: "));
        assert!(text.ends_with(&"x".repeat(100)));
        assert!(!text.contains(&"x".repeat(101)));
    }
}
