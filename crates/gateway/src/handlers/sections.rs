//! Deliverable section handlers: generation, editing, locking and history

use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::state::AppState;
use clinforge_common::{
    db::models::{DeliverableSection, SectionHistory, SectionStatus},
    errors::{AppError, Result},
    generation::GenerationDraft,
};

#[derive(Debug, Deserialize)]
pub struct UserRequest {
    pub user_id: Uuid,
}

#[derive(Serialize)]
pub struct GeneratedResponse {
    pub section_id: Uuid,
    pub content: String,
}

/// Draft a section with the LLM and store it
pub async fn generate_section(
    State(state): State<AppState>,
    Path(section_id): Path<Uuid>,
    Json(request): Json<UserRequest>,
) -> Result<Json<GeneratedResponse>> {
    let content = state.writer.generate(section_id, Some(request.user_id)).await?;
    Ok(Json(GeneratedResponse { section_id, content }))
}

/// Preview generation for a template node without persisting anything
pub async fn draft_section(
    State(state): State<AppState>,
    Path((project_id, custom_section_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<GenerationDraft>> {
    let draft = state.writer.draft(project_id, custom_section_id).await?;
    Ok(Json(draft))
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpdateContentRequest {
    pub user_id: Uuid,

    #[validate(length(max = 2000000))]
    pub content_html: String,
}

/// Replace section content by hand
pub async fn update_content(
    State(state): State<AppState>,
    Path(section_id): Path<Uuid>,
    Json(request): Json<UpdateContentRequest>,
) -> Result<Json<DeliverableSection>> {
    request.validate().map_err(|e| AppError::Validation {
        message: e.to_string(),
        field: Some("content_html".to_string()),
    })?;

    let section = state
        .writer
        .update_content(section_id, request.user_id, request.content_html)
        .await?;
    Ok(Json(section))
}

pub async fn lock_section(
    State(state): State<AppState>,
    Path(section_id): Path<Uuid>,
    Json(request): Json<UserRequest>,
) -> Result<Json<DeliverableSection>> {
    let section = state.repo.lock_section(section_id, request.user_id).await?;
    tracing::info!(section_id = %section_id, user_id = %request.user_id, "Section locked");
    Ok(Json(section))
}

pub async fn unlock_section(
    State(state): State<AppState>,
    Path(section_id): Path<Uuid>,
    Json(request): Json<UserRequest>,
) -> Result<Json<DeliverableSection>> {
    let section = state.repo.unlock_section(section_id, request.user_id).await?;
    tracing::info!(section_id = %section_id, user_id = %request.user_id, "Section unlocked");
    Ok(Json(section))
}

#[derive(Debug, Deserialize)]
pub struct StatusRequest {
    pub status: String,
}

/// Move a section through its workflow
pub async fn set_status(
    State(state): State<AppState>,
    Path(section_id): Path<Uuid>,
    Json(request): Json<StatusRequest>,
) -> Result<Json<DeliverableSection>> {
    let status = SectionStatus::parse(&request.status).ok_or_else(|| AppError::Validation {
        message: format!("Unknown section status '{}'", request.status),
        field: Some("status".to_string()),
    })?;

    let section = state.repo.set_section_status(section_id, status).await?;
    Ok(Json(section))
}

/// Content snapshots of a section, oldest first
pub async fn section_history(
    State(state): State<AppState>,
    Path(section_id): Path<Uuid>,
) -> Result<Json<Vec<SectionHistory>>> {
    state
        .repo
        .find_deliverable_section(section_id)
        .await?
        .ok_or_else(|| AppError::not_found("deliverable_section", section_id))?;

    let history = state.repo.section_history(section_id).await?;
    Ok(Json(history))
}
