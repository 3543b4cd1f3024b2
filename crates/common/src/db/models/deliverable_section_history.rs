//! Append-only audit snapshot of a deliverable section

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "deliverable_section_history")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub section_id: Uuid,

    #[sea_orm(column_type = "Text")]
    pub content_snapshot: String,

    pub changed_by_user_id: Option<Uuid>,

    #[sea_orm(column_type = "Text", nullable)]
    pub change_reason: Option<String>,

    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::deliverable_section::Entity",
        from = "Column::SectionId",
        to = "super::deliverable_section::Column::Id",
        on_delete = "Cascade"
    )]
    Section,
}

impl Related<super::deliverable_section::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Section.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
