//! Sandboxed preview of server-local files.
//!
//! Tool summaries reference server paths (rendered videos, BGM picks,
//! cached assets); this endpoint turns them into fetchable URLs while
//! confining reads to an allow-list of roots.

use std::path::PathBuf;

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

use cf_domain::config::abs_path;
use cf_media::{guess_media_type, is_under_dir};

use crate::api::{api_error, ApiError};
use crate::api::media::serve_file;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct PreviewQuery {
    pub path: String,
}

pub async fn preview(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<PreviewQuery>,
) -> Response {
    let session = match state.sessions.get_or_404(&session_id) {
        Ok(s) => s,
        Err(e) => return ApiError(e).into_response(),
    };

    let mut raw = query.path.trim().to_string();
    if raw.is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "empty path");
    }
    if raw.contains('\0') {
        return api_error(StatusCode::BAD_REQUEST, "bad path");
    }
    if let Some(stripped) = raw.strip_prefix("file://") {
        raw = stripped.to_string();
    }

    let target = abs_path(&PathBuf::from(&raw));
    let project = &state.config.project;
    let cache_root = abs_path(&project.server_cache_dir);
    let allowed_roots = [
        session.media_dir().clone(),
        abs_path(&project.outputs_dir),
        abs_path(&project.bgm_dir),
        cache_root.clone(),
    ];

    if !allowed_roots.iter().any(|root| is_under_dir(&target, root)) {
        return api_error(StatusCode::FORBIDDEN, "forbidden");
    }
    if !target.exists() || target.is_dir() {
        return api_error(StatusCode::NOT_FOUND, "file not found");
    }

    let mut response = serve_file(&target, guess_media_type(&target), None).await;
    // Cache-dir content is content-addressed; let clients keep it.
    if is_under_dir(&target, &cache_root) {
        if let Ok(value) = "public, max-age=31536000, immutable".parse() {
            response.headers_mut().insert(header::CACHE_CONTROL, value);
        }
    }
    response
}
