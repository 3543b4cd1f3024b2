//! Uploaded or ingested source document

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Processing status: uploading -> processing -> indexed | error
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Uploading,
    Processing,
    Indexed,
    Error,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Uploading => "uploading",
            DocumentStatus::Processing => "processing",
            DocumentStatus::Indexed => "indexed",
            DocumentStatus::Error => "error",
        }
    }

    /// Whether processing has finished, successfully or not
    pub fn is_terminal(&self) -> bool {
        matches!(self, DocumentStatus::Indexed | DocumentStatus::Error)
    }
}

impl From<String> for DocumentStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "processing" => DocumentStatus::Processing,
            "indexed" => DocumentStatus::Indexed,
            "error" => DocumentStatus::Error,
            _ => DocumentStatus::Uploading,
        }
    }
}

impl From<DocumentStatus> for String {
    fn from(status: DocumentStatus) -> Self {
        status.as_str().to_string()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "source_documents")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub project_id: Uuid,

    /// Custom template used as classification scope
    pub template_id: Option<Uuid>,

    #[sea_orm(column_type = "Text")]
    pub name: String,

    #[sea_orm(column_type = "Text", nullable)]
    pub storage_path: Option<String>,

    /// file | manual_entry
    #[sea_orm(column_type = "Text")]
    pub input_type: String,

    #[sea_orm(column_type = "Text", nullable)]
    pub doc_type: Option<String>,

    #[sea_orm(column_type = "Text")]
    pub status: String,

    /// Previous document in the version chain
    pub parent_document_id: Option<Uuid>,

    #[sea_orm(column_type = "Text", nullable)]
    pub version_label: Option<String>,

    pub is_current_version: bool,

    /// Parsing metrics, or the error message on failure
    #[sea_orm(column_type = "JsonBinary")]
    pub parsing_metadata: serde_json::Value,

    pub detected_tables_count: i32,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::project::Entity",
        from = "Column::ProjectId",
        to = "super::project::Column::Id",
        on_delete = "Cascade"
    )]
    Project,

    #[sea_orm(
        belongs_to = "super::custom_template::Entity",
        from = "Column::TemplateId",
        to = "super::custom_template::Column::Id",
        on_delete = "SetNull"
    )]
    Template,

    #[sea_orm(
        belongs_to = "Entity",
        from = "Column::ParentDocumentId",
        to = "Column::Id",
        on_delete = "SetNull"
    )]
    ParentDocument,
}

impl Related<super::project::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Project.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn document_status(&self) -> DocumentStatus {
        DocumentStatus::from(self.status.clone())
    }
}
