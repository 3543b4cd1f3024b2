//! Extracted study-level fact ("study passport" entry)

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "study_globals")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub project_id: Uuid,

    #[sea_orm(column_type = "Text")]
    pub variable_name: String,

    #[sea_orm(column_type = "Text")]
    pub variable_value: String,

    /// Provenance
    pub source_section_id: Option<Uuid>,

    pub created_at: DateTimeWithTimeZone,
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
        belongs_to = "super::source_section::Entity",
        from = "Column::SourceSectionId",
        to = "super::source_section::Column::Id",
        on_delete = "SetNull"
    )]
    SourceSection,
}

impl ActiveModelBehavior for ActiveModel {}
