//! Project-level study fact handlers

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;
use uuid::Uuid;

use crate::state::AppState;
use clinforge_common::{
    db::models::StudyGlobal,
    errors::{AppError, Result},
    generation::StudyPassport,
};

#[derive(Serialize)]
pub struct ExtractResponse {
    pub project_id: Uuid,
    /// Empty when nothing could be extracted; stored facts are then unchanged
    pub facts: StudyPassport,
}

async fn ensure_project(state: &AppState, project_id: Uuid) -> Result<()> {
    state
        .repo
        .find_project(project_id)
        .await?
        .ok_or_else(|| AppError::not_found("project", project_id))?;
    Ok(())
}

/// Re-extract the project's study facts from its current documents
pub async fn extract_globals(
    State(state): State<AppState>,
    Path(project_id): Path<Uuid>,
) -> Result<Json<ExtractResponse>> {
    ensure_project(&state, project_id).await?;
    let facts = state.extractor.extract(project_id).await?;
    Ok(Json(ExtractResponse { project_id, facts }))
}

pub async fn list_globals(
    State(state): State<AppState>,
    Path(project_id): Path<Uuid>,
) -> Result<Json<Vec<StudyGlobal>>> {
    ensure_project(&state, project_id).await?;
    let globals = state.extractor.list_globals(project_id).await?;
    Ok(Json(globals))
}
