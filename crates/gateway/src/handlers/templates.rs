//! Template handlers

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state::AppState;
use clinforge_common::{
    db::models::{CustomTemplate, IdealTemplate},
    errors::Result,
    graph::TreeNode,
};

#[derive(Debug, Default, Deserialize)]
pub struct TemplateQuery {
    /// Restrict custom templates to one project
    pub project_id: Option<Uuid>,
}

#[derive(Serialize)]
pub struct TemplateListResponse {
    pub ideal: Vec<IdealTemplate>,
    pub custom: Vec<CustomTemplate>,
}

pub async fn list_templates(
    State(state): State<AppState>,
    Query(query): Query<TemplateQuery>,
) -> Result<Json<TemplateListResponse>> {
    let ideal = state.repo.list_ideal_templates().await?;
    let custom = state.repo.list_custom_templates(query.project_id).await?;
    Ok(Json(TemplateListResponse { ideal, custom }))
}

/// Nested canonical template with each node's rules
pub async fn template_structure(
    State(state): State<AppState>,
    Path(template_id): Path<Uuid>,
) -> Result<Json<Vec<TreeNode>>> {
    let tree = state.templates.template_structure(template_id).await?;
    Ok(Json(tree))
}

#[derive(Serialize)]
pub struct EmbedResponse {
    pub template_id: Uuid,
    pub embedded: usize,
}

/// Embed canonical node titles that have no embedding yet
pub async fn embed_template(
    State(state): State<AppState>,
    Path(template_id): Path<Uuid>,
) -> Result<Json<EmbedResponse>> {
    let embedded = state.templates.embed_ideal_sections(template_id).await?;
    tracing::info!(template_id = %template_id, embedded, "Template sections embedded");
    Ok(Json(EmbedResponse { template_id, embedded }))
}
