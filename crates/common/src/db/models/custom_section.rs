//! Customized-layer template node

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "custom_sections")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub custom_template_id: Uuid,

    /// Canonical node this section specializes
    pub ideal_section_id: Option<Uuid>,

    pub parent_id: Option<Uuid>,

    #[sea_orm(column_type = "Text")]
    pub title: String,

    pub order_index: i32,

    pub is_mandatory: bool,

    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::custom_template::Entity",
        from = "Column::CustomTemplateId",
        to = "super::custom_template::Column::Id",
        on_delete = "Cascade"
    )]
    Template,

    #[sea_orm(
        belongs_to = "super::ideal_section::Entity",
        from = "Column::IdealSectionId",
        to = "super::ideal_section::Column::Id",
        on_delete = "SetNull"
    )]
    IdealSection,

    #[sea_orm(
        belongs_to = "Entity",
        from = "Column::ParentId",
        to = "Column::Id",
        on_delete = "Cascade"
    )]
    Parent,
}

impl Related<super::custom_template::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Template.def()
    }
}

impl Related<super::ideal_section::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::IdealSection.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
