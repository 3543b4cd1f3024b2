//! Schema bootstrap
//!
//! Creates every table from the entity definitions, parents before children,
//! plus the natural-key index on source sections. Safe to run repeatedly.

use crate::db::models::*;
use crate::errors::Result;
use sea_orm::sea_query::Index;
use sea_orm::{ConnectionTrait, EntityTrait, Schema};
use tracing::info;

/// Name of the unique index backing section upserts
pub const SOURCE_SECTION_NATURAL_KEY: &str = "uq_source_sections_document_ordinal";

/// Create all tables and indexes that do not exist yet
pub async fn create_schema<C: ConnectionTrait>(conn: &C) -> Result<()> {
    let schema = Schema::new(conn.get_database_backend());

    create_table(conn, &schema, ProjectEntity).await?;
    create_table(conn, &schema, IdealTemplateEntity).await?;
    create_table(conn, &schema, IdealSectionEntity).await?;
    create_table(conn, &schema, IdealMappingEntity).await?;
    create_table(conn, &schema, CustomTemplateEntity).await?;
    create_table(conn, &schema, CustomSectionEntity).await?;
    create_table(conn, &schema, CustomMappingEntity).await?;
    create_table(conn, &schema, SourceDocumentEntity).await?;
    create_table(conn, &schema, SourceSectionEntity).await?;
    create_table(conn, &schema, StudyGlobalEntity).await?;
    create_table(conn, &schema, DeliverableEntity).await?;
    create_table(conn, &schema, DeliverableSectionEntity).await?;
    create_table(conn, &schema, SectionHistoryEntity).await?;

    let natural_key = Index::create()
        .if_not_exists()
        .name(SOURCE_SECTION_NATURAL_KEY)
        .table(SourceSectionEntity)
        .col(SourceSectionColumn::DocumentId)
        .col(SourceSectionColumn::Ordinal)
        .unique()
        .to_owned();
    conn.execute(conn.get_database_backend().build(&natural_key))
        .await?;

    info!("Database schema ready");
    Ok(())
}

async fn create_table<C, E>(conn: &C, schema: &Schema, entity: E) -> Result<()>
where
    C: ConnectionTrait,
    E: EntityTrait,
{
    let mut stmt = schema.create_table_from_entity(entity);
    stmt.if_not_exists();
    conn.execute(conn.get_database_backend().build(&stmt)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm::Database;

    #[tokio::test]
    async fn test_schema_is_idempotent() {
        let conn = Database::connect("sqlite::memory:").await.unwrap();
        create_schema(&conn).await.unwrap();
        tokio_test::assert_ok!(create_schema(&conn).await);
    }
}
