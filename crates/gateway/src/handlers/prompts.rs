//! Prompt administration

use axum::{extract::State, Json};
use serde::Serialize;

use crate::state::AppState;
use clinforge_common::errors::Result;

#[derive(Serialize)]
pub struct ReloadResponse {
    pub status: String,
    pub version: Option<String>,
}

/// Re-read the prompt file; the old prompts stay active if it is invalid
pub async fn reload_prompts(State(state): State<AppState>) -> Result<Json<ReloadResponse>> {
    state.prompts.reload()?;
    Ok(Json(ReloadResponse {
        status: "reloaded".to_string(),
        version: state.prompts.version(),
    }))
}
