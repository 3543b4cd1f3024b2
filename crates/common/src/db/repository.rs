//! Repository pattern for database operations
//!
//! Provides a clean interface for all data access operations
//! with proper error handling and transaction support.

use crate::db::models::*;
use crate::db::{format_embedding, DbPool};
use crate::errors::{AppError, Result};
use sea_orm::sea_query::{Expr, Func, OnConflict};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, IntoActiveModel, QueryFilter,
    QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Parsed section ready to be persisted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSourceSection {
    pub ordinal: i32,
    pub section_number: Option<String>,
    pub header: String,
    pub hierarchy_level: Option<i32>,
    pub page_number: Option<i32>,
    pub content_text: String,
    pub content_markdown: String,
    pub content_structure: Option<serde_json::Value>,
    pub custom_section_id: Option<Uuid>,
    pub classification_confidence: Option<f64>,
    pub embedding: Option<Vec<f32>>,
}

/// Content write applied to a deliverable section together with its history row
#[derive(Debug, Clone)]
pub struct GenerationWrite {
    pub section_id: Uuid,
    pub content_html: String,
    /// New workflow status; `None` leaves it unchanged
    pub status: Option<SectionStatus>,
    /// New provenance; `None` leaves it unchanged
    pub used_source_section_ids: Option<Vec<Uuid>>,
    pub user_id: Option<Uuid>,
    pub reason: String,
}

/// New source document
#[derive(Debug, Clone, Default)]
pub struct NewSourceDocument {
    pub project_id: Uuid,
    pub template_id: Option<Uuid>,
    pub name: String,
    pub storage_path: Option<String>,
    pub input_type: Option<String>,
    pub doc_type: Option<String>,
    pub parent_document_id: Option<Uuid>,
    pub version_label: Option<String>,
}

/// New customized-layer rule
#[derive(Debug, Clone, Default)]
pub struct NewCustomMapping {
    pub target_custom_section_id: Uuid,
    pub source_custom_section_id: Option<Uuid>,
    pub source_ideal_section_id: Option<Uuid>,
    pub instruction: Option<String>,
    /// Appended after existing rules when absent
    pub order_index: Option<i32>,
}

/// Repository for data access operations
#[derive(Clone)]
pub struct Repository {
    pool: DbPool,
}

fn now() -> chrono::DateTime<chrono::FixedOffset> {
    chrono::Utc::now().into()
}

impl Repository {
    /// Create a new repository with the given connection pool
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Get the read connection
    fn read_conn(&self) -> &DatabaseConnection {
        self.pool.read()
    }

    /// Get the write connection
    fn write_conn(&self) -> &DatabaseConnection {
        self.pool.write()
    }

    // ========================================================================
    // Health Check
    // ========================================================================

    /// Ping the database
    pub async fn ping(&self) -> Result<()> {
        self.pool.ping().await
    }

    // ========================================================================
    // Project Operations
    // ========================================================================

    pub async fn create_project(&self, name: &str) -> Result<Project> {
        ProjectActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(name.to_string()),
            created_at: Set(now()),
        }
        .insert(self.write_conn())
        .await
        .map_err(Into::into)
    }

    pub async fn find_project(&self, id: Uuid) -> Result<Option<Project>> {
        ProjectEntity::find_by_id(id)
            .one(self.read_conn())
            .await
            .map_err(Into::into)
    }

    // ========================================================================
    // Canonical Template Operations
    // ========================================================================

    pub async fn create_ideal_template(&self, name: &str, version: &str) -> Result<IdealTemplate> {
        IdealTemplateActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(name.to_string()),
            version: Set(version.to_string()),
            is_active: Set(true),
            created_at: Set(now()),
        }
        .insert(self.write_conn())
        .await
        .map_err(Into::into)
    }

    pub async fn list_ideal_templates(&self) -> Result<Vec<IdealTemplate>> {
        IdealTemplateEntity::find()
            .order_by_asc(IdealTemplateColumn::Name)
            .all(self.read_conn())
            .await
            .map_err(Into::into)
    }

    pub async fn find_ideal_template(&self, id: Uuid) -> Result<Option<IdealTemplate>> {
        IdealTemplateEntity::find_by_id(id)
            .one(self.read_conn())
            .await
            .map_err(Into::into)
    }

    pub async fn create_ideal_section(
        &self,
        template_id: Uuid,
        parent_id: Option<Uuid>,
        title: &str,
        order_index: i32,
    ) -> Result<IdealSection> {
        IdealSectionActiveModel {
            id: Set(Uuid::new_v4()),
            template_id: Set(template_id),
            parent_id: Set(parent_id),
            title: Set(title.to_string()),
            order_index: Set(order_index),
            embedding: Set(None),
            is_mandatory: Set(true),
            created_at: Set(now()),
        }
        .insert(self.write_conn())
        .await
        .map_err(Into::into)
    }

    /// All nodes of a canonical template ordered by `order_index`
    pub async fn list_ideal_sections(&self, template_id: Uuid) -> Result<Vec<IdealSection>> {
        IdealSectionEntity::find()
            .filter(IdealSectionColumn::TemplateId.eq(template_id))
            .order_by_asc(IdealSectionColumn::OrderIndex)
            .order_by_asc(IdealSectionColumn::Id)
            .all(self.read_conn())
            .await
            .map_err(Into::into)
    }

    pub async fn set_ideal_section_embedding(&self, id: Uuid, embedding: &[f32]) -> Result<()> {
        IdealSectionEntity::update_many()
            .col_expr(
                IdealSectionColumn::Embedding,
                Expr::value(Some(format_embedding(embedding))),
            )
            .filter(IdealSectionColumn::Id.eq(id))
            .exec(self.write_conn())
            .await?;
        Ok(())
    }

    pub async fn create_ideal_mapping(
        &self,
        target_ideal_section_id: Uuid,
        source_ideal_section_id: Option<Uuid>,
        instruction: Option<String>,
        order_index: Option<i32>,
    ) -> Result<IdealMapping> {
        let order_index = match order_index {
            Some(order) => order,
            None => {
                IdealMappingEntity::find()
                    .filter(IdealMappingColumn::TargetIdealSectionId.eq(target_ideal_section_id))
                    .order_by_desc(IdealMappingColumn::OrderIndex)
                    .one(self.read_conn())
                    .await?
                    .map(|m| m.order_index + 1)
                    .unwrap_or(0)
            }
        };

        IdealMappingActiveModel {
            id: Set(Uuid::new_v4()),
            target_ideal_section_id: Set(target_ideal_section_id),
            source_ideal_section_id: Set(source_ideal_section_id),
            instruction: Set(instruction),
            order_index: Set(order_index),
            created_at: Set(now()),
        }
        .insert(self.write_conn())
        .await
        .map_err(Into::into)
    }

    /// Canonical rules targeting one node, in rule order
    pub async fn ideal_mappings_targeting(&self, ideal_section_id: Uuid) -> Result<Vec<IdealMapping>> {
        IdealMappingEntity::find()
            .filter(IdealMappingColumn::TargetIdealSectionId.eq(ideal_section_id))
            .order_by_asc(IdealMappingColumn::OrderIndex)
            .order_by_asc(IdealMappingColumn::Id)
            .all(self.read_conn())
            .await
            .map_err(Into::into)
    }

    /// Canonical rules targeting any node of a template
    pub async fn ideal_mappings_for_template(&self, template_id: Uuid) -> Result<Vec<IdealMapping>> {
        let section_ids: Vec<Uuid> = self
            .list_ideal_sections(template_id)
            .await?
            .into_iter()
            .map(|s| s.id)
            .collect();

        if section_ids.is_empty() {
            return Ok(Vec::new());
        }

        IdealMappingEntity::find()
            .filter(IdealMappingColumn::TargetIdealSectionId.is_in(section_ids))
            .order_by_asc(IdealMappingColumn::OrderIndex)
            .all(self.read_conn())
            .await
            .map_err(Into::into)
    }

    // ========================================================================
    // Customized Template Operations
    // ========================================================================

    pub async fn create_custom_template(
        &self,
        project_id: Option<Uuid>,
        base_ideal_template_id: Option<Uuid>,
        name: &str,
    ) -> Result<CustomTemplate> {
        CustomTemplateActiveModel {
            id: Set(Uuid::new_v4()),
            base_ideal_template_id: Set(base_ideal_template_id),
            project_id: Set(project_id),
            name: Set(name.to_string()),
            created_at: Set(now()),
        }
        .insert(self.write_conn())
        .await
        .map_err(Into::into)
    }

    pub async fn list_custom_templates(&self, project_id: Option<Uuid>) -> Result<Vec<CustomTemplate>> {
        let mut query = CustomTemplateEntity::find();
        if let Some(project_id) = project_id {
            query = query.filter(CustomTemplateColumn::ProjectId.eq(project_id));
        }
        query
            .order_by_asc(CustomTemplateColumn::Name)
            .all(self.read_conn())
            .await
            .map_err(Into::into)
    }

    pub async fn create_custom_section(
        &self,
        custom_template_id: Uuid,
        ideal_section_id: Option<Uuid>,
        parent_id: Option<Uuid>,
        title: &str,
        order_index: i32,
    ) -> Result<CustomSection> {
        CustomSectionActiveModel {
            id: Set(Uuid::new_v4()),
            custom_template_id: Set(custom_template_id),
            ideal_section_id: Set(ideal_section_id),
            parent_id: Set(parent_id),
            title: Set(title.to_string()),
            order_index: Set(order_index),
            is_mandatory: Set(true),
            created_at: Set(now()),
        }
        .insert(self.write_conn())
        .await
        .map_err(Into::into)
    }

    pub async fn find_custom_section(&self, id: Uuid) -> Result<Option<CustomSection>> {
        CustomSectionEntity::find_by_id(id)
            .one(self.read_conn())
            .await
            .map_err(Into::into)
    }

    pub async fn list_custom_sections(&self, custom_template_id: Uuid) -> Result<Vec<CustomSection>> {
        CustomSectionEntity::find()
            .filter(CustomSectionColumn::CustomTemplateId.eq(custom_template_id))
            .order_by_asc(CustomSectionColumn::OrderIndex)
            .order_by_asc(CustomSectionColumn::Id)
            .all(self.read_conn())
            .await
            .map_err(Into::into)
    }

    /// Every customized node, in any template, derived from a canonical node
    pub async fn custom_sections_derived_from(&self, ideal_section_id: Uuid) -> Result<Vec<CustomSection>> {
        CustomSectionEntity::find()
            .filter(CustomSectionColumn::IdealSectionId.eq(ideal_section_id))
            .order_by_asc(CustomSectionColumn::Id)
            .all(self.read_conn())
            .await
            .map_err(Into::into)
    }

    /// Classification candidates of a custom template: each node paired with
    /// the stored embedding of the canonical node it derives from
    pub async fn classification_candidates(&self, custom_template_id: Uuid) -> Result<Vec<(Uuid, String)>> {
        let rows = CustomSectionEntity::find()
            .find_also_related(IdealSectionEntity)
            .filter(CustomSectionColumn::CustomTemplateId.eq(custom_template_id))
            .filter(IdealSectionColumn::Embedding.is_not_null())
            .order_by_asc(CustomSectionColumn::Id)
            .all(self.read_conn())
            .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(custom, ideal)| ideal.and_then(|i| i.embedding).map(|e| (custom.id, e)))
            .collect())
    }

    pub async fn create_custom_mapping(&self, mapping: NewCustomMapping) -> Result<CustomMapping> {
        let target = self
            .find_custom_section(mapping.target_custom_section_id)
            .await?
            .ok_or_else(|| AppError::not_found("custom_section", mapping.target_custom_section_id))?;

        let order_index = match mapping.order_index {
            Some(order) => order,
            None => {
                CustomMappingEntity::find()
                    .filter(CustomMappingColumn::TargetCustomSectionId.eq(target.id))
                    .order_by_desc(CustomMappingColumn::OrderIndex)
                    .one(self.read_conn())
                    .await?
                    .map(|m| m.order_index + 1)
                    .unwrap_or(0)
            }
        };

        CustomMappingActiveModel {
            id: Set(Uuid::new_v4()),
            target_custom_section_id: Set(target.id),
            target_ideal_section_id: Set(target.ideal_section_id),
            source_custom_section_id: Set(mapping.source_custom_section_id),
            source_ideal_section_id: Set(mapping.source_ideal_section_id),
            instruction: Set(mapping.instruction),
            order_index: Set(order_index),
            created_at: Set(now()),
        }
        .insert(self.write_conn())
        .await
        .map_err(Into::into)
    }

    /// Customized rules targeting one node, in rule order
    pub async fn custom_mappings_targeting(&self, custom_section_id: Uuid) -> Result<Vec<CustomMapping>> {
        CustomMappingEntity::find()
            .filter(CustomMappingColumn::TargetCustomSectionId.eq(custom_section_id))
            .order_by_asc(CustomMappingColumn::OrderIndex)
            .order_by_asc(CustomMappingColumn::Id)
            .all(self.read_conn())
            .await
            .map_err(Into::into)
    }

    // ========================================================================
    // Source Document Operations
    // ========================================================================

    /// Register a document; a new version becomes current for its chain
    pub async fn create_source_document(&self, doc: NewSourceDocument) -> Result<SourceDocument> {
        let created = SourceDocumentActiveModel {
            id: Set(Uuid::new_v4()),
            project_id: Set(doc.project_id),
            template_id: Set(doc.template_id),
            name: Set(doc.name),
            storage_path: Set(doc.storage_path),
            input_type: Set(doc.input_type.unwrap_or_else(|| "file".to_string())),
            doc_type: Set(doc.doc_type),
            status: Set(DocumentStatus::Uploading.into()),
            parent_document_id: Set(doc.parent_document_id),
            version_label: Set(doc.version_label),
            is_current_version: Set(doc.parent_document_id.is_none()),
            parsing_metadata: Set(serde_json::json!({})),
            detected_tables_count: Set(0),
            created_at: Set(now()),
            updated_at: Set(now()),
        }
        .insert(self.write_conn())
        .await?;

        if created.parent_document_id.is_some() {
            self.mark_current_version(created.id).await?;
            return self
                .find_source_document(created.id)
                .await?
                .ok_or_else(|| AppError::not_found("source_document", created.id));
        }

        Ok(created)
    }

    pub async fn find_source_document(&self, id: Uuid) -> Result<Option<SourceDocument>> {
        SourceDocumentEntity::find_by_id(id)
            .one(self.read_conn())
            .await
            .map_err(Into::into)
    }

    /// Update processing status and, optionally, metrics
    pub async fn update_document_status(
        &self,
        id: Uuid,
        status: DocumentStatus,
        metadata: Option<serde_json::Value>,
        tables_count: Option<i32>,
    ) -> Result<SourceDocument> {
        let doc = self
            .find_source_document(id)
            .await?
            .ok_or_else(|| AppError::not_found("source_document", id))?;

        let mut active = doc.into_active_model();
        active.status = Set(status.into());
        if let Some(metadata) = metadata {
            active.parsing_metadata = Set(metadata);
        }
        if let Some(count) = tables_count {
            active.detected_tables_count = Set(count);
        }
        active.updated_at = Set(now());

        active.update(self.write_conn()).await.map_err(Into::into)
    }

    /// Make `id` the only current document of its version chain.
    ///
    /// Returns the ids of every chain member.
    pub async fn mark_current_version(&self, id: Uuid) -> Result<Vec<Uuid>> {
        let txn = self.write_conn().begin().await?;

        let doc = SourceDocumentEntity::find_by_id(id)
            .one(&txn)
            .await?
            .ok_or_else(|| AppError::not_found("source_document", id))?;

        // Walk up to the root of the chain
        let mut root = doc.clone();
        let mut visited = HashSet::from([root.id]);
        while let Some(parent_id) = root.parent_document_id {
            if !visited.insert(parent_id) {
                break;
            }
            match SourceDocumentEntity::find_by_id(parent_id).one(&txn).await? {
                Some(parent) => root = parent,
                None => break,
            }
        }

        // Collect every descendant of the root
        let mut seen = HashSet::from([root.id]);
        let mut chain = vec![root.id];
        let mut frontier = vec![root.id];
        while !frontier.is_empty() {
            let children = SourceDocumentEntity::find()
                .filter(SourceDocumentColumn::ParentDocumentId.is_in(frontier.clone()))
                .all(&txn)
                .await?;
            frontier = children
                .into_iter()
                .map(|c| c.id)
                .filter(|cid| seen.insert(*cid))
                .collect();
            chain.extend(frontier.iter().copied());
        }

        SourceDocumentEntity::update_many()
            .col_expr(SourceDocumentColumn::IsCurrentVersion, Expr::value(false))
            .filter(SourceDocumentColumn::Id.is_in(chain.clone()))
            .filter(SourceDocumentColumn::Id.ne(id))
            .exec(&txn)
            .await?;

        SourceDocumentEntity::update_many()
            .col_expr(SourceDocumentColumn::IsCurrentVersion, Expr::value(true))
            .filter(SourceDocumentColumn::Id.eq(id))
            .exec(&txn)
            .await?;

        txn.commit().await?;

        Ok(chain)
    }

    // ========================================================================
    // Source Section Operations
    // ========================================================================

    /// Persist parsed sections keyed by `(document_id, ordinal)`.
    ///
    /// Re-running for the same document updates rows in place and removes
    /// sections beyond the new count, so retries never duplicate content.
    pub async fn upsert_source_sections(
        &self,
        document_id: Uuid,
        sections: Vec<NewSourceSection>,
    ) -> Result<Vec<SourceSection>> {
        let count = sections.len() as i32;
        let txn = self.write_conn().begin().await?;

        if !sections.is_empty() {
            let created_at = now();
            let models = sections.into_iter().map(|s| SourceSectionActiveModel {
                id: Set(Uuid::new_v4()),
                document_id: Set(document_id),
                custom_section_id: Set(s.custom_section_id),
                ordinal: Set(s.ordinal),
                section_number: Set(s.section_number),
                header: Set(s.header),
                hierarchy_level: Set(s.hierarchy_level),
                page_number: Set(s.page_number),
                content_text: Set(s.content_text),
                content_markdown: Set(s.content_markdown),
                content_structure: Set(s.content_structure),
                embedding: Set(s.embedding.as_deref().map(format_embedding)),
                classification_confidence: Set(s.classification_confidence),
                created_at: Set(created_at),
            });

            SourceSectionEntity::insert_many(models)
                .on_conflict(
                    OnConflict::columns([SourceSectionColumn::DocumentId, SourceSectionColumn::Ordinal])
                        .update_columns([
                            SourceSectionColumn::CustomSectionId,
                            SourceSectionColumn::SectionNumber,
                            SourceSectionColumn::Header,
                            SourceSectionColumn::HierarchyLevel,
                            SourceSectionColumn::PageNumber,
                            SourceSectionColumn::ContentText,
                            SourceSectionColumn::ContentMarkdown,
                            SourceSectionColumn::ContentStructure,
                            SourceSectionColumn::Embedding,
                            SourceSectionColumn::ClassificationConfidence,
                        ])
                        .to_owned(),
                )
                .exec_without_returning(&txn)
                .await?;
        }

        SourceSectionEntity::delete_many()
            .filter(SourceSectionColumn::DocumentId.eq(document_id))
            .filter(SourceSectionColumn::Ordinal.gte(count))
            .exec(&txn)
            .await?;

        txn.commit().await?;

        self.sections_for_document(document_id).await
    }

    pub async fn sections_for_document(&self, document_id: Uuid) -> Result<Vec<SourceSection>> {
        SourceSectionEntity::find()
            .filter(SourceSectionColumn::DocumentId.eq(document_id))
            .order_by_asc(SourceSectionColumn::Ordinal)
            .all(self.read_conn())
            .await
            .map_err(Into::into)
    }

    /// Sections classified into any of `custom_section_ids`, restricted to
    /// current-version documents of the project. Newest document first.
    pub async fn current_sections_for_custom_sections(
        &self,
        project_id: Uuid,
        custom_section_ids: &[Uuid],
    ) -> Result<Vec<SourceSection>> {
        if custom_section_ids.is_empty() {
            return Ok(Vec::new());
        }

        SourceSectionEntity::find()
            .inner_join(SourceDocumentEntity)
            .filter(SourceDocumentColumn::ProjectId.eq(project_id))
            .filter(SourceDocumentColumn::IsCurrentVersion.eq(true))
            .filter(SourceSectionColumn::CustomSectionId.is_in(custom_section_ids.to_vec()))
            .order_by_desc(SourceDocumentColumn::CreatedAt)
            .order_by_asc(SourceSectionColumn::DocumentId)
            .order_by_asc(SourceSectionColumn::Ordinal)
            .all(self.read_conn())
            .await
            .map_err(Into::into)
    }

    /// Current-version sections whose header mentions "synopsis" (any case)
    pub async fn synopsis_sections(&self, project_id: Uuid, limit: u64) -> Result<Vec<SourceSection>> {
        SourceSectionEntity::find()
            .inner_join(SourceDocumentEntity)
            .filter(SourceDocumentColumn::ProjectId.eq(project_id))
            .filter(SourceDocumentColumn::IsCurrentVersion.eq(true))
            .filter(
                Expr::expr(Func::lower(Expr::col((
                    SourceSectionEntity,
                    SourceSectionColumn::Header,
                ))))
                .like("%synopsis%"),
            )
            .order_by_asc(SourceSectionColumn::DocumentId)
            .order_by_asc(SourceSectionColumn::Ordinal)
            .limit(limit)
            .all(self.read_conn())
            .await
            .map_err(Into::into)
    }

    /// First current-version sections of the project by section number
    pub async fn leading_sections(&self, project_id: Uuid, limit: u64) -> Result<Vec<SourceSection>> {
        SourceSectionEntity::find()
            .inner_join(SourceDocumentEntity)
            .filter(SourceDocumentColumn::ProjectId.eq(project_id))
            .filter(SourceDocumentColumn::IsCurrentVersion.eq(true))
            .order_by_asc(SourceSectionColumn::SectionNumber)
            .order_by_asc(SourceSectionColumn::Ordinal)
            .limit(limit)
            .all(self.read_conn())
            .await
            .map_err(Into::into)
    }

    // ========================================================================
    // Study Global Operations
    // ========================================================================

    /// Replace the project's facts with `facts` in one transaction
    pub async fn replace_study_globals(
        &self,
        project_id: Uuid,
        facts: &[(String, String)],
        source_section_id: Option<Uuid>,
    ) -> Result<Vec<StudyGlobal>> {
        let txn = self.write_conn().begin().await?;

        StudyGlobalEntity::delete_many()
            .filter(StudyGlobalColumn::ProjectId.eq(project_id))
            .exec(&txn)
            .await?;

        let mut inserted = Vec::with_capacity(facts.len());
        for (name, value) in facts {
            let global = StudyGlobalActiveModel {
                id: Set(Uuid::new_v4()),
                project_id: Set(project_id),
                variable_name: Set(name.clone()),
                variable_value: Set(value.clone()),
                source_section_id: Set(source_section_id),
                created_at: Set(now()),
            }
            .insert(&txn)
            .await?;
            inserted.push(global);
        }

        txn.commit().await?;
        Ok(inserted)
    }

    pub async fn list_study_globals(&self, project_id: Uuid) -> Result<Vec<StudyGlobal>> {
        StudyGlobalEntity::find()
            .filter(StudyGlobalColumn::ProjectId.eq(project_id))
            .order_by_asc(StudyGlobalColumn::VariableName)
            .all(self.read_conn())
            .await
            .map_err(Into::into)
    }

    // ========================================================================
    // Deliverable Operations
    // ========================================================================

    /// Create a deliverable with one empty section per node of its template,
    /// mirroring the template's parent links
    pub async fn create_deliverable(
        &self,
        project_id: Uuid,
        custom_template_id: Uuid,
        title: &str,
    ) -> Result<(Deliverable, Vec<DeliverableSection>)> {
        let template_sections = self.list_custom_sections(custom_template_id).await?;
        let txn = self.write_conn().begin().await?;

        let deliverable = DeliverableActiveModel {
            id: Set(Uuid::new_v4()),
            project_id: Set(project_id),
            template_id: Set(custom_template_id),
            title: Set(title.to_string()),
            status: Set("draft".to_string()),
            created_at: Set(now()),
            updated_at: Set(now()),
        }
        .insert(&txn)
        .await?;

        let ids: HashMap<Uuid, Uuid> = template_sections
            .iter()
            .map(|s| (s.id, Uuid::new_v4()))
            .collect();

        // Parents are inserted before their children
        let mut pending = template_sections;
        let mut inserted: HashSet<Uuid> = HashSet::new();
        let mut sections = Vec::with_capacity(pending.len());
        while !pending.is_empty() {
            let (ready, blocked): (Vec<_>, Vec<_>) = pending.into_iter().partition(|s| match s.parent_id {
                None => true,
                Some(parent) => inserted.contains(&parent) || !ids.contains_key(&parent),
            });

            // Remaining nodes only reference each other; attach them at the root
            let (ready, blocked) = if ready.is_empty() {
                (blocked, Vec::new())
            } else {
                (ready, blocked)
            };

            for custom in ready {
                let parent_id = custom
                    .parent_id
                    .filter(|p| inserted.contains(p))
                    .and_then(|p| ids.get(&p).copied());
                let section = DeliverableSectionActiveModel {
                    id: Set(ids[&custom.id]),
                    deliverable_id: Set(deliverable.id),
                    custom_section_id: Set(custom.id),
                    parent_id: Set(parent_id),
                    content_html: Set(None),
                    status: Set(SectionStatus::Empty.into()),
                    locked_by_user_id: Set(None),
                    locked_at: Set(None),
                    used_source_section_ids: Set(serde_json::json!([])),
                    created_at: Set(now()),
                    updated_at: Set(now()),
                }
                .insert(&txn)
                .await?;
                inserted.insert(custom.id);
                sections.push(section);
            }
            pending = blocked;
        }

        txn.commit().await?;
        Ok((deliverable, sections))
    }

    pub async fn find_deliverable(&self, id: Uuid) -> Result<Option<Deliverable>> {
        DeliverableEntity::find_by_id(id)
            .one(self.read_conn())
            .await
            .map_err(Into::into)
    }

    pub async fn find_deliverable_section(&self, id: Uuid) -> Result<Option<DeliverableSection>> {
        DeliverableSectionEntity::find_by_id(id)
            .one(self.read_conn())
            .await
            .map_err(Into::into)
    }

    /// Sections of a deliverable with their template nodes
    pub async fn deliverable_sections_with_nodes(
        &self,
        deliverable_id: Uuid,
    ) -> Result<Vec<(DeliverableSection, Option<CustomSection>)>> {
        DeliverableSectionEntity::find()
            .find_also_related(CustomSectionEntity)
            .filter(DeliverableSectionColumn::DeliverableId.eq(deliverable_id))
            .all(self.read_conn())
            .await
            .map_err(Into::into)
    }

    /// Overwrite a section's content and append its history row atomically
    pub async fn apply_section_write(&self, write: GenerationWrite) -> Result<DeliverableSection> {
        let txn = self.write_conn().begin().await?;

        let section = DeliverableSectionEntity::find_by_id(write.section_id)
            .one(&txn)
            .await?
            .ok_or_else(|| AppError::not_found("deliverable_section", write.section_id))?;

        let mut active = section.into_active_model();
        active.content_html = Set(Some(write.content_html.clone()));
        if let Some(status) = write.status {
            active.status = Set(status.into());
        }
        if let Some(ids) = write.used_source_section_ids {
            active.used_source_section_ids = Set(serde_json::to_value(ids)?);
        }
        active.updated_at = Set(now());
        let updated = active.update(&txn).await?;

        SectionHistoryActiveModel {
            id: Set(Uuid::new_v4()),
            section_id: Set(write.section_id),
            content_snapshot: Set(write.content_html),
            changed_by_user_id: Set(write.user_id),
            change_reason: Set(Some(write.reason)),
            created_at: Set(now()),
        }
        .insert(&txn)
        .await?;

        txn.commit().await?;
        Ok(updated)
    }

    /// Acquire the edit lock; re-locking by the holder refreshes it
    pub async fn lock_section(&self, id: Uuid, user_id: Uuid) -> Result<DeliverableSection> {
        let section = self
            .find_deliverable_section(id)
            .await?
            .ok_or_else(|| AppError::not_found("deliverable_section", id))?;

        if let Some(holder) = section.locked_by_user_id.filter(|h| *h != user_id) {
            return Err(AppError::SectionLocked {
                section_id: id.to_string(),
                locked_by: holder.to_string(),
            });
        }

        let mut active = section.into_active_model();
        active.locked_by_user_id = Set(Some(user_id));
        active.locked_at = Set(Some(now()));
        active.update(self.write_conn()).await.map_err(Into::into)
    }

    /// Release the edit lock; only the holder may release it
    pub async fn unlock_section(&self, id: Uuid, user_id: Uuid) -> Result<DeliverableSection> {
        let section = self
            .find_deliverable_section(id)
            .await?
            .ok_or_else(|| AppError::not_found("deliverable_section", id))?;

        if let Some(holder) = section.locked_by_user_id.filter(|h| *h != user_id) {
            return Err(AppError::SectionLocked {
                section_id: id.to_string(),
                locked_by: holder.to_string(),
            });
        }

        let mut active = section.into_active_model();
        active.locked_by_user_id = Set(None);
        active.locked_at = Set(None);
        active.update(self.write_conn()).await.map_err(Into::into)
    }

    pub async fn set_section_status(&self, id: Uuid, status: SectionStatus) -> Result<DeliverableSection> {
        let section = self
            .find_deliverable_section(id)
            .await?
            .ok_or_else(|| AppError::not_found("deliverable_section", id))?;

        let mut active = section.into_active_model();
        active.status = Set(status.into());
        active.updated_at = Set(now());
        active.update(self.write_conn()).await.map_err(Into::into)
    }

    /// History rows of a section, oldest first
    pub async fn section_history(&self, section_id: Uuid) -> Result<Vec<SectionHistory>> {
        SectionHistoryEntity::find()
            .filter(SectionHistoryColumn::SectionId.eq(section_id))
            .order_by_asc(SectionHistoryColumn::CreatedAt)
            .all(self.read_conn())
            .await
            .map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestGraph;

    fn parsed(ordinal: i32, header: &str, custom_section_id: Option<Uuid>) -> NewSourceSection {
        NewSourceSection {
            ordinal,
            section_number: None,
            header: header.to_string(),
            hierarchy_level: Some(1),
            page_number: None,
            content_text: format!("{} body", header),
            content_markdown: format!("{} body", header),
            content_structure: None,
            custom_section_id,
            classification_confidence: None,
            embedding: None,
        }
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent_across_retries() {
        let graph = TestGraph::new().await;
        let doc = graph.document(true).await;

        let first = graph
            .repo
            .upsert_source_sections(doc.id, vec![parsed(0, "Intro", None), parsed(1, "Scope", None)])
            .await
            .unwrap();
        let second = graph
            .repo
            .upsert_source_sections(doc.id, vec![parsed(0, "Intro", None), parsed(1, "Scope", None)])
            .await
            .unwrap();

        assert_eq!(second.len(), 2);
        assert_eq!(first[0].id, second[0].id);
        assert_eq!(first[1].id, second[1].id);
    }

    #[tokio::test]
    async fn test_upsert_removes_stale_sections() {
        let graph = TestGraph::new().await;
        let doc = graph.document(true).await;

        graph
            .repo
            .upsert_source_sections(
                doc.id,
                vec![parsed(0, "A", None), parsed(1, "B", None), parsed(2, "C", None)],
            )
            .await
            .unwrap();
        let sections = graph
            .repo
            .upsert_source_sections(doc.id, vec![parsed(0, "A2", None)])
            .await
            .unwrap();

        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].header, "A2");
    }

    #[tokio::test]
    async fn test_mark_current_version_clears_chain() {
        let graph = TestGraph::new().await;
        let v1 = graph.document(true).await;
        let v2 = graph
            .repo
            .create_source_document(NewSourceDocument {
                project_id: graph.project.id,
                name: "protocol-v2.pdf".into(),
                parent_document_id: Some(v1.id),
                ..Default::default()
            })
            .await
            .unwrap();

        assert!(v2.is_current_version);
        let v1_after = graph.repo.find_source_document(v1.id).await.unwrap().unwrap();
        assert!(!v1_after.is_current_version);

        let chain = graph.repo.mark_current_version(v1.id).await.unwrap();
        assert_eq!(chain.len(), 2);
        let v1_now = graph.repo.find_source_document(v1.id).await.unwrap().unwrap();
        let v2_now = graph.repo.find_source_document(v2.id).await.unwrap().unwrap();
        assert!(v1_now.is_current_version);
        assert!(!v2_now.is_current_version);
    }

    #[tokio::test]
    async fn test_lock_rejects_other_user() {
        let graph = TestGraph::new().await;
        let (_, sections) = graph.deliverable().await;
        let owner = Uuid::new_v4();
        let other = Uuid::new_v4();

        graph.repo.lock_section(sections[0].id, owner).await.unwrap();
        let err = graph.repo.lock_section(sections[0].id, other).await.unwrap_err();
        assert!(matches!(err, AppError::SectionLocked { .. }));
        assert!(graph.repo.unlock_section(sections[0].id, other).await.is_err());

        let unlocked = graph.repo.unlock_section(sections[0].id, owner).await.unwrap();
        assert!(unlocked.locked_by_user_id.is_none());
    }

    #[tokio::test]
    async fn test_create_deliverable_mirrors_tree() {
        let graph = TestGraph::new().await;
        let (_, sections) = graph.deliverable().await;

        assert_eq!(sections.len(), 3);
        assert!(sections.iter().all(|s| s.status == "empty"));

        let by_node: HashMap<Uuid, &DeliverableSection> =
            sections.iter().map(|s| (s.custom_section_id, s)).collect();
        let child = by_node[&graph.custom_child.id];
        let parent = by_node[&graph.custom_target.id];
        assert_eq!(child.parent_id, Some(parent.id));
    }

    #[tokio::test]
    async fn test_mapping_order_appends() {
        let graph = TestGraph::new().await;
        let first = graph
            .repo
            .create_custom_mapping(NewCustomMapping {
                target_custom_section_id: graph.custom_target.id,
                ..Default::default()
            })
            .await
            .unwrap();
        let second = graph
            .repo
            .create_custom_mapping(NewCustomMapping {
                target_custom_section_id: graph.custom_target.id,
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(first.order_index, 0);
        assert_eq!(second.order_index, 1);
        assert_eq!(second.target_ideal_section_id, graph.custom_target.ideal_section_id);
    }
}
