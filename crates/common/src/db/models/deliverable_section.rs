//! Editable section of a deliverable

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Workflow status: empty -> draft_ai -> in_progress -> review -> approved
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionStatus {
    Empty,
    DraftAi,
    InProgress,
    Review,
    Approved,
}

impl SectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SectionStatus::Empty => "empty",
            SectionStatus::DraftAi => "draft_ai",
            SectionStatus::InProgress => "in_progress",
            SectionStatus::Review => "review",
            SectionStatus::Approved => "approved",
        }
    }

    /// Parse a stored or user-supplied status
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "empty" => Some(SectionStatus::Empty),
            "draft_ai" => Some(SectionStatus::DraftAi),
            "in_progress" => Some(SectionStatus::InProgress),
            "review" => Some(SectionStatus::Review),
            "approved" => Some(SectionStatus::Approved),
            _ => None,
        }
    }
}

impl From<SectionStatus> for String {
    fn from(status: SectionStatus) -> Self {
        status.as_str().to_string()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "deliverable_sections")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub deliverable_id: Uuid,

    pub custom_section_id: Uuid,

    pub parent_id: Option<Uuid>,

    #[sea_orm(column_type = "Text", nullable)]
    pub content_html: Option<String>,

    #[sea_orm(column_type = "Text")]
    pub status: String,

    pub locked_by_user_id: Option<Uuid>,

    pub locked_at: Option<DateTimeWithTimeZone>,

    /// JSON array of source section ids behind the current content
    #[sea_orm(column_type = "JsonBinary")]
    pub used_source_section_ids: serde_json::Value,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::deliverable::Entity",
        from = "Column::DeliverableId",
        to = "super::deliverable::Column::Id",
        on_delete = "Cascade"
    )]
    Deliverable,

    #[sea_orm(
        belongs_to = "super::custom_section::Entity",
        from = "Column::CustomSectionId",
        to = "super::custom_section::Column::Id",
        on_delete = "Cascade"
    )]
    CustomSection,

    #[sea_orm(
        belongs_to = "Entity",
        from = "Column::ParentId",
        to = "Column::Id",
        on_delete = "Cascade"
    )]
    Parent,
}

impl Related<super::deliverable::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Deliverable.def()
    }
}

impl Related<super::custom_section::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::CustomSection.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn section_status(&self) -> Option<SectionStatus> {
        SectionStatus::parse(&self.status)
    }

    /// Source section ids recorded for the current content
    pub fn used_source_ids(&self) -> Vec<Uuid> {
        serde_json::from_value(self.used_source_section_ids.clone()).unwrap_or_default()
    }
}
