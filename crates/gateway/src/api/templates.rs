//! Template CRUD. Presets are listed alongside user templates but can
//! never be created or deleted through the API.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::{json, Value};

use cf_domain::template::EditTemplate;

use crate::api::{api_error, ApiError, ApiResult};
use crate::state::AppState;

pub async fn list_templates(State(state): State<AppState>) -> Json<Value> {
    let templates = state.templates.list_all();
    Json(json!({ "templates": templates }))
}

pub async fn get_template(
    State(state): State<AppState>,
    Path(template_id): Path<String>,
) -> Response {
    match state.templates.get(&template_id) {
        Some(template) => Json(template).into_response(),
        None => api_error(StatusCode::NOT_FOUND, "template not found"),
    }
}

pub async fn save_template(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Response {
    let mut template: EditTemplate = match serde_json::from_value(body) {
        Ok(t) => t,
        Err(e) => return api_error(StatusCode::BAD_REQUEST, e.to_string()),
    };
    // Users cannot mint presets.
    template.is_preset = false;

    match state.templates.save(template) {
        Ok(saved) => Json(saved).into_response(),
        Err(e) => ApiError(e).into_response(),
    }
}

pub async fn delete_template(
    State(state): State<AppState>,
    Path(template_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let deleted = state.templates.delete(&template_id)?;
    if !deleted {
        return Err(ApiError(cf_domain::Error::not_found("template not found")));
    }
    Ok(Json(json!({"ok": true})))
}
