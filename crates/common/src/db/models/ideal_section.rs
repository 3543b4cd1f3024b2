//! Canonical-layer template node

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "ideal_sections")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub template_id: Uuid,

    /// Null for root nodes
    pub parent_id: Option<Uuid>,

    #[sea_orm(column_type = "Text")]
    pub title: String,

    pub order_index: i32,

    /// Vector stored as text, `[f1,f2,...]`
    #[sea_orm(column_type = "Text", nullable)]
    pub embedding: Option<String>,

    pub is_mandatory: bool,

    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::ideal_template::Entity",
        from = "Column::TemplateId",
        to = "super::ideal_template::Column::Id",
        on_delete = "Cascade"
    )]
    Template,

    #[sea_orm(
        belongs_to = "Entity",
        from = "Column::ParentId",
        to = "Column::Id",
        on_delete = "Cascade"
    )]
    Parent,
}

impl Related<super::ideal_template::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Template.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Parse the stored embedding
    pub fn parse_embedding(&self) -> Option<Vec<f32>> {
        self.embedding.as_deref().and_then(crate::db::parse_embedding)
    }
}
