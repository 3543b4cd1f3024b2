//! Canonical-layer mapping rule

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "ideal_mappings")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub target_ideal_section_id: Uuid,

    pub source_ideal_section_id: Option<Uuid>,

    #[sea_orm(column_type = "Text", nullable)]
    pub instruction: Option<String>,

    pub order_index: i32,

    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::ideal_section::Entity",
        from = "Column::TargetIdealSectionId",
        to = "super::ideal_section::Column::Id",
        on_delete = "Cascade"
    )]
    Target,

    #[sea_orm(
        belongs_to = "super::ideal_section::Entity",
        from = "Column::SourceIdealSectionId",
        to = "super::ideal_section::Column::Id",
        on_delete = "SetNull"
    )]
    Source,
}

impl ActiveModelBehavior for ActiveModel {}
