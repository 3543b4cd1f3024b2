//! Customized-layer mapping rule
//!
//! A rule with neither source set marks a manually authored section.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "custom_mappings")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub target_custom_section_id: Uuid,

    pub target_ideal_section_id: Option<Uuid>,

    pub source_custom_section_id: Option<Uuid>,

    pub source_ideal_section_id: Option<Uuid>,

    #[sea_orm(column_type = "Text", nullable)]
    pub instruction: Option<String>,

    pub order_index: i32,

    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::custom_section::Entity",
        from = "Column::TargetCustomSectionId",
        to = "super::custom_section::Column::Id",
        on_delete = "Cascade"
    )]
    Target,

    #[sea_orm(
        belongs_to = "super::custom_section::Entity",
        from = "Column::SourceCustomSectionId",
        to = "super::custom_section::Column::Id",
        on_delete = "SetNull"
    )]
    SourceCustom,

    #[sea_orm(
        belongs_to = "super::ideal_section::Entity",
        from = "Column::SourceIdealSectionId",
        to = "super::ideal_section::Column::Id",
        on_delete = "SetNull"
    )]
    SourceIdeal,
}

impl ActiveModelBehavior for ActiveModel {}
