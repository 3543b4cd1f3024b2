//! Deliverable handlers

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::state::AppState;
use clinforge_common::{
    db::models::{Deliverable, DeliverableSection},
    errors::{AppError, Result},
};

const DOCX_CONTENT_TYPE: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";

#[derive(Debug, Deserialize, Validate)]
pub struct CreateDeliverableRequest {
    pub project_id: Uuid,
    pub custom_template_id: Uuid,

    #[validate(length(min = 1, max = 500))]
    pub title: String,
}

#[derive(Serialize)]
pub struct DeliverableResponse {
    pub deliverable: Deliverable,
    pub sections: Vec<DeliverableSection>,
}

/// Create a deliverable with one empty section per template node
pub async fn create_deliverable(
    State(state): State<AppState>,
    Json(request): Json<CreateDeliverableRequest>,
) -> Result<(StatusCode, Json<DeliverableResponse>)> {
    request.validate().map_err(|e| AppError::Validation {
        message: e.to_string(),
        field: Some("title".to_string()),
    })?;

    state
        .repo
        .find_project(request.project_id)
        .await?
        .ok_or_else(|| AppError::not_found("project", request.project_id))?;

    let (deliverable, sections) = state
        .repo
        .create_deliverable(request.project_id, request.custom_template_id, &request.title)
        .await?;

    tracing::info!(
        deliverable_id = %deliverable.id,
        project_id = %request.project_id,
        sections = sections.len(),
        "Deliverable created"
    );

    Ok((StatusCode::CREATED, Json(DeliverableResponse { deliverable, sections })))
}

/// Render the deliverable as a DOCX download
pub async fn export_deliverable(
    State(state): State<AppState>,
    Path(deliverable_id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let deliverable = state
        .repo
        .find_deliverable(deliverable_id)
        .await?
        .ok_or_else(|| AppError::not_found("deliverable", deliverable_id))?;

    let bytes = state.exporter.export(deliverable_id).await?;
    let disposition = format!("attachment; filename=\"{}.docx\"", file_stem(&deliverable.title));

    Ok((
        [
            (header::CONTENT_TYPE, DOCX_CONTENT_TYPE.to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    ))
}

/// Header-safe file name from a title
fn file_stem(title: &str) -> String {
    let stem: String = title
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    let stem = stem.trim_matches('_');
    if stem.is_empty() {
        "deliverable".to_string()
    } else {
        stem.to_string()
    }
}
