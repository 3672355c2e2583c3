//! Session lifecycle endpoints.
//!
//! - `POST /api/sessions`              — create, returns snapshot
//! - `GET  /api/sessions/:sid`         — snapshot
//! - `POST /api/sessions/:sid/clear`   — reset history + model context
//! - `POST /api/sessions/:sid/cancel`  — raise the turn-cancel flag

use axum::extract::{Path, State};
use axum::response::Json;
use serde_json::{json, Value};

use crate::api::ApiResult;
use crate::state::AppState;

pub async fn create_session(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let session = state.sessions.create()?;
    Ok(Json(session.snapshot().await))
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let session = state.sessions.get_or_404(&session_id)?;
    Ok(Json(session.snapshot().await))
}

/// Clears conversation state only; media, uploads, and the store-name
/// sequence survive.
pub async fn clear_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let session = state.sessions.get_or_404(&session_id)?;
    let _turn = session.chat_lock.clone().lock_owned().await;
    session.reset_conversation();
    Ok(Json(json!({"ok": true})))
}

/// Interrupt the in-flight turn, if any. History and context are kept;
/// the streaming side notices the flag and finishes up cleanly.
pub async fn cancel_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let session = state.sessions.get_or_404(&session_id)?;
    session.cancel.raise();
    tracing::info!(session_id, "turn cancel requested");
    Ok(Json(json!({"ok": true})))
}
