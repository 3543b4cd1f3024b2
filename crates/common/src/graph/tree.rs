//! Template structure views and maintenance

use crate::db::models::{IdealMapping, IdealSection};
use crate::db::Repository;
use crate::embeddings::Embedder;
use crate::errors::{AppError, Result};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Generic node of a parent-linked forest
#[derive(Debug, Clone)]
pub struct Node<T> {
    pub item: T,
    pub children: Vec<Node<T>>,
}

/// Placement of an item in a forest: `(id, parent_id, order_index)`
pub type Placement = (Uuid, Option<Uuid>, i32);

/// Nest `items` by parent link, siblings sorted by `(order_index, id)`.
///
/// Items whose parent is missing become roots. Items only reachable through
/// a cycle are appended as roots so nothing is lost.
pub fn build_forest<T, F>(items: Vec<T>, placement: F) -> Vec<Node<T>>
where
    F: Fn(&T) -> Placement,
{
    let mut keyed: Vec<(Placement, T)> = items.into_iter().map(|i| (placement(&i), i)).collect();
    keyed.sort_by_key(|((id, _, order), _)| (*order, *id));

    let ids: HashSet<Uuid> = keyed.iter().map(|((id, _, _), _)| *id).collect();
    let mut children: HashMap<Uuid, Vec<usize>> = HashMap::new();
    let mut roots = Vec::new();
    for (idx, ((_, parent, _), _)) in keyed.iter().enumerate() {
        match parent {
            Some(p) if ids.contains(p) => children.entry(*p).or_default().push(idx),
            _ => roots.push(idx),
        }
    }

    let placements: Vec<Placement> = keyed.iter().map(|(p, _)| *p).collect();
    let mut slots: Vec<Option<T>> = keyed.into_iter().map(|(_, item)| Some(item)).collect();

    fn grow<T>(
        idx: usize,
        placements: &[Placement],
        children: &HashMap<Uuid, Vec<usize>>,
        slots: &mut [Option<T>],
    ) -> Option<Node<T>> {
        let item = slots[idx].take()?;
        let kids = children
            .get(&placements[idx].0)
            .map(|list| {
                list.iter()
                    .filter_map(|&c| grow(c, placements, children, slots))
                    .collect()
            })
            .unwrap_or_default();
        Some(Node { item, children: kids })
    }

    let mut forest: Vec<Node<T>> = roots
        .into_iter()
        .filter_map(|idx| grow(idx, &placements, &children, &mut slots))
        .collect();

    for idx in 0..slots.len() {
        if let Some(node) = grow(idx, &placements, &children, &mut slots) {
            forest.push(node);
        }
    }

    forest
}

/// Depth-first pre-order walk
pub fn preorder<T>(forest: &[Node<T>]) -> Vec<&T> {
    let mut out = Vec::new();
    fn walk<'a, T>(nodes: &'a [Node<T>], out: &mut Vec<&'a T>) {
        for node in nodes {
            out.push(&node.item);
            walk(&node.children, out);
        }
    }
    walk(forest, &mut out);
    out
}

/// Canonical template node with its rules, as served to clients
#[derive(Debug, Clone, Serialize)]
pub struct TreeNode {
    pub id: Uuid,
    pub title: String,
    pub order_index: i32,
    pub is_mandatory: bool,
    pub has_embedding: bool,
    pub mappings: Vec<IdealMapping>,
    pub children: Vec<TreeNode>,
}

/// Template-level operations
#[derive(Clone)]
pub struct TemplateService {
    repo: Repository,
    embedder: Arc<dyn Embedder>,
}

impl TemplateService {
    pub fn new(repo: Repository, embedder: Arc<dyn Embedder>) -> Self {
        Self { repo, embedder }
    }

    /// Nested structure of a canonical template with each node's rules
    pub async fn template_structure(&self, ideal_template_id: Uuid) -> Result<Vec<TreeNode>> {
        self.repo
            .find_ideal_template(ideal_template_id)
            .await?
            .ok_or_else(|| AppError::not_found("ideal_template", ideal_template_id))?;

        let sections = self.repo.list_ideal_sections(ideal_template_id).await?;
        let mut rules: HashMap<Uuid, Vec<IdealMapping>> = HashMap::new();
        for mapping in self.repo.ideal_mappings_for_template(ideal_template_id).await? {
            rules.entry(mapping.target_ideal_section_id).or_default().push(mapping);
        }

        let forest = build_forest(sections, |s: &IdealSection| (s.id, s.parent_id, s.order_index));
        Ok(forest.into_iter().map(|n| to_tree_node(n, &mut rules)).collect())
    }

    /// Embed the titles of canonical nodes that have no embedding yet
    pub async fn embed_ideal_sections(&self, ideal_template_id: Uuid) -> Result<usize> {
        self.repo
            .find_ideal_template(ideal_template_id)
            .await?
            .ok_or_else(|| AppError::not_found("ideal_template", ideal_template_id))?;

        let pending: Vec<IdealSection> = self
            .repo
            .list_ideal_sections(ideal_template_id)
            .await?
            .into_iter()
            .filter(|s| s.embedding.is_none())
            .collect();

        if pending.is_empty() {
            return Ok(0);
        }

        let titles: Vec<String> = pending.iter().map(|s| s.title.clone()).collect();
        let vectors = self.embedder.embed_batch(&titles).await?;
        if vectors.len() != pending.len() {
            return Err(AppError::EmbeddingError {
                message: format!("expected {} embeddings, got {}", pending.len(), vectors.len()),
            });
        }

        for (section, vector) in pending.iter().zip(&vectors) {
            self.repo.set_ideal_section_embedding(section.id, vector).await?;
        }

        info!(
            template = %ideal_template_id,
            updated = pending.len(),
            model = self.embedder.model_name(),
            "Canonical sections embedded"
        );
        Ok(pending.len())
    }
}

fn to_tree_node(node: Node<IdealSection>, rules: &mut HashMap<Uuid, Vec<IdealMapping>>) -> TreeNode {
    let section = node.item;
    TreeNode {
        id: section.id,
        mappings: rules.remove(&section.id).unwrap_or_default(),
        has_embedding: section.embedding.is_some(),
        title: section.title,
        order_index: section.order_index,
        is_mandatory: section.is_mandatory,
        children: node
            .children
            .into_iter()
            .map(|c| to_tree_node(c, rules))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::MockEmbedder;
    use crate::testing::TestGraph;

    fn id(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    #[test]
    fn test_forest_orders_siblings_and_keeps_orphans() {
        let items = vec![
            (id(1), None, 1),
            (id(2), Some(id(1)), 1),
            (id(3), Some(id(1)), 0),
            (id(4), None, 0),
            (id(5), Some(id(99)), 2),
        ];
        let forest = build_forest(items, |p| *p);
        let order: Vec<Uuid> = preorder(&forest).into_iter().map(|p| p.0).collect();
        assert_eq!(order, vec![id(4), id(1), id(3), id(2), id(5)]);
    }

    #[test]
    fn test_forest_survives_cycles() {
        let items = vec![(id(1), Some(id(2)), 0), (id(2), Some(id(1)), 0)];
        let forest = build_forest(items, |p| *p);
        assert_eq!(preorder(&forest).len(), 2);
    }

    #[tokio::test]
    async fn test_structure_attaches_rules() {
        let graph = TestGraph::new().await;
        graph
            .repo
            .create_ideal_mapping(graph.ideal_target.id, Some(graph.ideal_source.id), None, None)
            .await
            .unwrap();

        let service = TemplateService::new(graph.repo.clone(), Arc::new(MockEmbedder::new(8)));
        let tree = service.template_structure(graph.ideal_template.id).await.unwrap();

        assert_eq!(tree.len(), 2);
        assert_eq!(tree[0].id, graph.ideal_source.id);
        assert_eq!(tree[1].mappings.len(), 1);
    }

    #[tokio::test]
    async fn test_embed_only_missing() {
        let graph = TestGraph::new().await;
        let service = TemplateService::new(graph.repo.clone(), Arc::new(MockEmbedder::new(8)));

        assert_eq!(service.embed_ideal_sections(graph.ideal_template.id).await.unwrap(), 2);
        assert_eq!(service.embed_ideal_sections(graph.ideal_template.id).await.unwrap(), 0);

        let missing = service.embed_ideal_sections(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(missing, AppError::NotFound { .. }));
    }
}
