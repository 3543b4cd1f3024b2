//! Parsed section of a source document
//!
//! `(document_id, ordinal)` is the natural key; reprocessing a document
//! upserts on it instead of appending.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "source_sections")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub document_id: Uuid,

    /// Classification result
    pub custom_section_id: Option<Uuid>,

    /// Position within the document, starting at 0
    pub ordinal: i32,

    #[sea_orm(column_type = "Text", nullable)]
    pub section_number: Option<String>,

    #[sea_orm(column_type = "Text")]
    pub header: String,

    pub hierarchy_level: Option<i32>,

    pub page_number: Option<i32>,

    #[sea_orm(column_type = "Text")]
    pub content_text: String,

    #[sea_orm(column_type = "Text")]
    pub content_markdown: String,

    /// Structured tables attached to the section
    #[sea_orm(column_type = "JsonBinary", nullable)]
    pub content_structure: Option<serde_json::Value>,

    #[sea_orm(column_type = "Text", nullable)]
    pub embedding: Option<String>,

    pub classification_confidence: Option<f64>,

    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::source_document::Entity",
        from = "Column::DocumentId",
        to = "super::source_document::Column::Id",
        on_delete = "Cascade"
    )]
    Document,

    #[sea_orm(
        belongs_to = "super::custom_section::Entity",
        from = "Column::CustomSectionId",
        to = "super::custom_section::Column::Id",
        on_delete = "SetNull"
    )]
    CustomSection,
}

impl Related<super::source_document::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Document.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Markdown when present, plain text otherwise
    pub fn best_content(&self) -> &str {
        if self.content_markdown.trim().is_empty() {
            &self.content_text
        } else {
            &self.content_markdown
        }
    }
}
