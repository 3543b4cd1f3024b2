//! Shared fixtures for unit tests

use crate::db::models::*;
use crate::db::{schema, DbPool, NewSourceDocument, NewSourceSection, Repository};
use crate::prompts::PromptStore;
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, Database, DatabaseConnection, EntityTrait, QueryFilter};
use std::sync::Arc;
use uuid::Uuid;

/// Prompt file shipped at the workspace root
pub fn shipped_prompts() -> Arc<PromptStore> {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/../../prompts.yaml");
    Arc::new(PromptStore::load(path).unwrap())
}

/// In-memory database seeded with one project and a small template graph:
///
/// ```text
/// ideal "CSR"           custom "Study ABC CSR"
///   Synopsis (0)          Synopsis (0)          <- ideal Synopsis
///   Efficacy Results (1)  Efficacy (1)          <- ideal Efficacy Results
///                           Primary Endpoint (0)
/// ```
pub struct TestGraph {
    pub db: DatabaseConnection,
    pub repo: Repository,
    pub project: Project,
    pub ideal_template: IdealTemplate,
    pub ideal_source: IdealSection,
    pub ideal_target: IdealSection,
    pub custom_template: CustomTemplate,
    pub custom_source: CustomSection,
    pub custom_target: CustomSection,
    pub custom_child: CustomSection,
}

impl TestGraph {
    pub async fn new() -> Self {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        schema::create_schema(&db).await.unwrap();
        let repo = Repository::new(DbPool::from_connection(db.clone()));

        let project = repo.create_project("Study ABC").await.unwrap();

        let ideal_template = repo.create_ideal_template("CSR", "1.0").await.unwrap();
        let ideal_source = repo
            .create_ideal_section(ideal_template.id, None, "Synopsis", 0)
            .await
            .unwrap();
        let ideal_target = repo
            .create_ideal_section(ideal_template.id, None, "Efficacy Results", 1)
            .await
            .unwrap();

        let custom_template = repo
            .create_custom_template(Some(project.id), Some(ideal_template.id), "Study ABC CSR")
            .await
            .unwrap();
        let custom_source = repo
            .create_custom_section(custom_template.id, Some(ideal_source.id), None, "Synopsis", 0)
            .await
            .unwrap();
        let custom_target = repo
            .create_custom_section(custom_template.id, Some(ideal_target.id), None, "Efficacy", 1)
            .await
            .unwrap();
        let custom_child = repo
            .create_custom_section(
                custom_template.id,
                None,
                Some(custom_target.id),
                "Primary Endpoint",
                0,
            )
            .await
            .unwrap();

        Self {
            db,
            repo,
            project,
            ideal_template,
            ideal_source,
            ideal_target,
            custom_template,
            custom_source,
            custom_target,
            custom_child,
        }
    }

    /// Register a source document, optionally superseded
    pub async fn document(&self, current: bool) -> SourceDocument {
        let doc = self
            .repo
            .create_source_document(NewSourceDocument {
                project_id: self.project.id,
                template_id: Some(self.custom_template.id),
                name: format!("protocol-{}.pdf", Uuid::new_v4().simple()),
                ..Default::default()
            })
            .await
            .unwrap();

        if !current {
            SourceDocumentEntity::update_many()
                .col_expr(SourceDocumentColumn::IsCurrentVersion, Expr::value(false))
                .filter(SourceDocumentColumn::Id.eq(doc.id))
                .exec(&self.db)
                .await
                .unwrap();
        }

        self.repo.find_source_document(doc.id).await.unwrap().unwrap()
    }

    /// Store `(header, custom_section_id, content)` rows as the document's sections
    pub async fn sections(
        &self,
        document_id: Uuid,
        rows: &[(&str, Option<Uuid>, &str)],
    ) -> Vec<SourceSection> {
        let parsed = rows
            .iter()
            .enumerate()
            .map(|(ordinal, (header, custom_section_id, content))| NewSourceSection {
                ordinal: ordinal as i32,
                section_number: Some(format!("{}", ordinal + 1)),
                header: header.to_string(),
                hierarchy_level: Some(1),
                page_number: Some(1),
                content_text: content.to_string(),
                content_markdown: content.to_string(),
                content_structure: None,
                custom_section_id: *custom_section_id,
                classification_confidence: custom_section_id.map(|_| 0.9),
                embedding: None,
            })
            .collect();

        self.repo.upsert_source_sections(document_id, parsed).await.unwrap()
    }

    /// Deliverable over the custom template
    pub async fn deliverable(&self) -> (Deliverable, Vec<DeliverableSection>) {
        self.repo
            .create_deliverable(self.project.id, self.custom_template.id, "Clinical Study Report")
            .await
            .unwrap()
    }
}
