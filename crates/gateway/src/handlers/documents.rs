//! Source document handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::state::AppState;
use clinforge_common::{
    errors::{AppError, Result},
    queue::ProcessDocumentMessage,
};
use clinforge_ingestion::{ProcessRequest, SectionSummary, SourceLocator};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParseMode {
    #[default]
    Sync,
    Queued,
}

/// Request to parse an uploaded document
#[derive(Debug, Deserialize, Validate)]
pub struct ParseDocumentRequest {
    pub document_id: Uuid,

    #[validate(length(min = 1, max = 2048))]
    pub file_url: Option<String>,

    #[validate(length(min = 1, max = 1024))]
    pub file_path: Option<String>,

    /// Custom template to classify sections against
    pub template_id: Option<Uuid>,

    /// Refresh study facts afterwards; deployment default when absent
    pub extract_globals: Option<bool>,

    #[serde(default)]
    pub mode: ParseMode,
}

#[derive(Serialize)]
pub struct ParsedResponse {
    pub document_id: Uuid,
    pub status: String,
    pub sections: Vec<SectionSummary>,
}

#[derive(Serialize)]
pub struct QueuedResponse {
    pub document_id: Uuid,
    pub status: String,
    pub message_id: String,
}

/// Parse a document now, or hand it to the ingestion worker
pub async fn parse_document(
    State(state): State<AppState>,
    Json(request): Json<ParseDocumentRequest>,
) -> Result<Response> {
    request.validate().map_err(|e| AppError::Validation {
        message: e.to_string(),
        field: None,
    })?;

    let locator = SourceLocator::from_parts(request.file_url.as_deref(), request.file_path.as_deref())?;

    match request.mode {
        ParseMode::Sync => {
            let process = ProcessRequest {
                document_id: request.document_id,
                locator,
                custom_template_id: request.template_id,
                extract_globals: request
                    .extract_globals
                    .unwrap_or(state.config.processing.extract_globals),
            };
            let sections = state.processor.process(&process).await?;

            Ok(Json(ParsedResponse {
                document_id: request.document_id,
                status: "indexed".to_string(),
                sections,
            })
            .into_response())
        }
        ParseMode::Queued => {
            let queue = state.queue.as_ref().ok_or_else(|| AppError::ServiceUnavailable {
                message: "queued parsing is not configured".to_string(),
            })?;

            state
                .repo
                .find_source_document(request.document_id)
                .await?
                .ok_or_else(|| AppError::not_found("source_document", request.document_id))?;

            let message = ProcessDocumentMessage {
                document_id: request.document_id,
                file_url: request.file_url,
                file_path: request.file_path,
                custom_template_id: request.template_id,
                extract_globals: request.extract_globals.unwrap_or(false),
                attempt: 0,
            };
            let message_id = queue.send(&message).await?;

            tracing::info!(
                document_id = %request.document_id,
                message_id = %message_id,
                "Document queued for processing"
            );

            Ok((
                StatusCode::ACCEPTED,
                Json(QueuedResponse {
                    document_id: request.document_id,
                    status: "queued".to_string(),
                    message_id,
                }),
            )
                .into_response())
        }
    }
}

#[derive(Serialize)]
pub struct MakeCurrentResponse {
    pub document_id: Uuid,
    /// Every document in the version chain
    pub chain: Vec<Uuid>,
}

/// Make a document the current version of its chain
pub async fn make_current(
    State(state): State<AppState>,
    Path(document_id): Path<Uuid>,
) -> Result<Json<MakeCurrentResponse>> {
    let chain = state.repo.mark_current_version(document_id).await?;
    tracing::info!(document_id = %document_id, chain_len = chain.len(), "Current version changed");
    Ok(Json(MakeCurrentResponse { document_id, chain }))
}
