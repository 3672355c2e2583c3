//! Media endpoints: multipart upload, the resumable upload lifecycle,
//! the pending list, and thumb/file serving.

use std::net::SocketAddr;
use std::path::{Path as FsPath, PathBuf};

use axum::body::Body;
use axum::extract::{ConnectInfo, Multipart, Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use serde_json::{json, Value};
use tokio_util::io::ReaderStream;

use cf_domain::{short_hex_id, Error};
use cf_media::{guess_media_type, sanitize_filename, thumbs, MediaKind};

use crate::api::{api_error, ApiError, ApiResult};
use crate::limits::rules::{admit_upload_count, client_ip, reject_429};
use crate::state::AppState;

fn upload_busy() -> Response {
    api_error(
        StatusCode::TOO_MANY_REQUESTS,
        "upload concurrency too high, retry shortly",
    )
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /api/sessions/:sid/media — multipart direct upload
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn upload_media(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Response {
    let session = match state.sessions.get_or_404(&session_id) {
        Ok(s) => s,
        Err(e) => return ApiError(e).into_response(),
    };

    if state.uploads.available_permits() == 0 {
        return upload_busy();
    }
    let _permit = match state.uploads.clone().acquire_owned().await {
        Ok(p) => p,
        Err(_) => return upload_busy(),
    };

    // Stage every file to a temp under the session uploads dir first;
    // count checks and name reservation need the full list.
    let mut staged: Vec<(String, PathBuf)> = Vec::new();
    let cleanup_staged = |staged: &[(String, PathBuf)]| {
        for (_, tmp) in staged {
            let _ = std::fs::remove_file(tmp);
        }
    };

    let max_files = state.config.limits.max_upload_files_per_request;
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                cleanup_staged(&staged);
                return api_error(StatusCode::BAD_REQUEST, format!("bad multipart body: {e}"));
            }
        };
        if field.name() != Some("files") {
            continue;
        }
        if max_files > 0 && staged.len() >= max_files {
            cleanup_staged(&staged);
            return api_error(
                StatusCode::BAD_REQUEST,
                format!("at most {max_files} files per upload request"),
            );
        }

        let display = sanitize_filename(field.file_name().unwrap_or("unnamed"));
        let tmp = session
            .media_store
            .uploads_dir()
            .join(format!("direct_{}.tmp", short_hex_id(12)));
        if let Err(e) = stage_field(field, &tmp).await {
            cleanup_staged(&staged);
            let _ = std::fs::remove_file(&tmp);
            return ApiError(e).into_response();
        }
        staged.push((display, tmp));
    }

    if staged.is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "no files");
    }

    // Per-file admission: cost = number of files.
    let ip = client_ip(&headers, Some(peer), state.config.limits.trust_proxy_headers);
    if let Err(retry_after) = admit_upload_count(&state, &ip, staged.len() as f64) {
        cleanup_staged(&staged);
        return reject_429(retry_after);
    }

    let displays: Vec<String> = staged.iter().map(|(name, _)| name.clone()).collect();
    let store_names = match session.begin_direct_upload(&displays).await {
        Ok(names) => names,
        Err(e) => {
            cleanup_staged(&staged);
            return ApiError(e).into_response();
        }
    };

    let mut metas = Vec::new();
    let mut failure: Option<Error> = None;
    for ((display, tmp), store_name) in staged.iter().zip(&store_names) {
        match session
            .media_store
            .save_from_path(tmp, store_name, display)
            .await
        {
            Ok(meta) => metas.push(meta),
            Err(e) => {
                failure = Some(e);
                break;
            }
        }
    }
    session.finish_direct_upload(displays.len()).await;

    if let Some(e) = failure {
        cleanup_staged(&staged);
        return ApiError(e).into_response();
    }

    let media: Vec<Value> = metas.iter().map(|m| session.public_media(m)).collect();
    session.commit_media(metas, true).await;

    Json(json!({
        "media": media,
        "pending_media": session.pending_media_public().await,
    }))
    .into_response()
}

/// Stream one multipart field to disk.
async fn stage_field(mut field: axum::extract::multipart::Field<'_>, tmp: &FsPath) -> Result<(), Error> {
    let mut file = tokio::fs::File::create(tmp).await?;
    loop {
        match field.chunk().await {
            Ok(Some(chunk)) => {
                tokio::io::AsyncWriteExt::write_all(&mut file, &chunk).await?;
            }
            Ok(None) => break,
            Err(e) => return Err(Error::invalid(format!("upload stream failed: {e}"))),
        }
    }
    tokio::io::AsyncWriteExt::flush(&mut file).await?;
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Resumable lifecycle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn init_resumable(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Option<Json<Value>>,
) -> Response {
    let session = match state.sessions.get_or_404(&session_id) {
        Ok(s) => s,
        Err(e) => return ApiError(e).into_response(),
    };

    let body = body.map(|Json(v)| v).unwrap_or(Value::Null);
    let filename = body
        .get("filename")
        .or_else(|| body.get("name"))
        .and_then(Value::as_str)
        .unwrap_or("unnamed");
    let size = body.get("size").and_then(Value::as_u64).unwrap_or(0);
    if size == 0 {
        return api_error(StatusCode::BAD_REQUEST, "invalid size");
    }

    // Init reserves one media slot.
    let ip = client_ip(&headers, Some(peer), state.config.limits.trust_proxy_headers);
    if let Err(retry_after) = admit_upload_count(&state, &ip, 1.0) {
        return reject_429(retry_after);
    }

    match session.init_resumable_upload(filename, size).await {
        Ok(init) => Json(json!({
            "upload_id": init.upload_id,
            "chunk_size": init.chunk_size,
            "total_chunks": init.total_chunks,
            "filename": init.filename,
        }))
        .into_response(),
        Err(e) => ApiError(e).into_response(),
    }
}

pub async fn upload_chunk(
    State(state): State<AppState>,
    Path((session_id, upload_id)): Path<(String, String)>,
    mut multipart: Multipart,
) -> Response {
    let session = match state.sessions.get_or_404(&session_id) {
        Ok(s) => s,
        Err(e) => return ApiError(e).into_response(),
    };

    if state.uploads.available_permits() == 0 {
        return upload_busy();
    }
    let _permit = match state.uploads.clone().acquire_owned().await {
        Ok(p) => p,
        Err(_) => return upload_busy(),
    };

    let Some(upload) = session.resumable(&upload_id).await else {
        return api_error(StatusCode::NOT_FOUND, "upload_id not found or expired");
    };

    // Form fields: index (text) + chunk (binary).
    let mut index: Option<u32> = None;
    let mut chunk: Option<axum::body::Bytes> = None;
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return api_error(StatusCode::BAD_REQUEST, format!("bad multipart body: {e}")),
        };
        match field.name() {
            Some("index") => {
                let text = match field.text().await {
                    Ok(t) => t,
                    Err(e) => {
                        return api_error(StatusCode::BAD_REQUEST, format!("bad index field: {e}"))
                    }
                };
                index = text.trim().parse().ok();
            }
            Some("chunk") => match field.bytes().await {
                Ok(bytes) => chunk = Some(bytes),
                Err(e) => {
                    return api_error(StatusCode::BAD_REQUEST, format!("bad chunk field: {e}"))
                }
            },
            _ => {}
        }
    }
    let (Some(index), Some(chunk)) = (index, chunk) else {
        return api_error(StatusCode::BAD_REQUEST, "index and chunk fields required");
    };

    match upload.write_chunk(index, &chunk).await {
        Ok(received) => Json(json!({
            "ok": true,
            "received_chunks": received,
            "total_chunks": upload.total_chunks,
        }))
        .into_response(),
        Err(e) => ApiError(e).into_response(),
    }
}

pub async fn complete_resumable(
    State(state): State<AppState>,
    Path((session_id, upload_id)): Path<(String, String)>,
) -> Response {
    let session = match state.sessions.get_or_404(&session_id) {
        Ok(s) => s,
        Err(e) => return ApiError(e).into_response(),
    };

    if state.uploads.available_permits() == 0 {
        return upload_busy();
    }
    let _permit = match state.uploads.clone().acquire_owned().await {
        Ok(p) => p,
        Err(_) => return upload_busy(),
    };

    match session.complete_resumable(&upload_id).await {
        Ok(meta) => Json(json!({
            "media": session.public_media(&meta),
            "pending_media": session.pending_media_public().await,
        }))
        .into_response(),
        Err(e) => ApiError(e).into_response(),
    }
}

pub async fn cancel_resumable(
    State(state): State<AppState>,
    Path((session_id, upload_id)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    let session = state.sessions.get_or_404(&session_id)?;
    session.cancel_resumable(&upload_id).await;
    Ok(Json(json!({"ok": true})))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pending list
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn get_pending(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let session = state.sessions.get_or_404(&session_id)?;
    Ok(Json(json!({
        "pending_media": session.pending_media_public().await,
    })))
}

pub async fn delete_pending(
    State(state): State<AppState>,
    Path((session_id, media_id)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    let session = state.sessions.get_or_404(&session_id)?;
    session.delete_pending(&media_id).await?;
    Ok(Json(json!({
        "ok": true,
        "pending_media": session.pending_media_public().await,
    })))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Thumb / file serving
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn get_thumb(
    State(state): State<AppState>,
    Path((session_id, media_id)): Path<(String, String)>,
) -> Response {
    let session = match state.sessions.get_or_404(&session_id) {
        Ok(s) => s,
        Err(e) => return ApiError(e).into_response(),
    };
    let Some(meta) = session.media_meta(&media_id).await else {
        return api_error(StatusCode::NOT_FOUND, "media not found");
    };

    if let Some(thumb) = &meta.thumb_path {
        if thumb.exists() {
            return serve_file(thumb, "image/jpeg", None).await;
        }
    }
    // Videos without an extractable frame get the placeholder.
    if meta.kind == MediaKind::Video {
        return (
            [(header::CONTENT_TYPE, "image/svg+xml")],
            thumbs::video_placeholder_svg(),
        )
            .into_response();
    }
    // Image whose thumbnail failed: serve the original.
    if meta.path.exists() {
        return serve_file(&meta.path, guess_media_type(&meta.path), None).await;
    }
    api_error(StatusCode::NOT_FOUND, "thumb not available")
}

pub async fn get_file(
    State(state): State<AppState>,
    Path((session_id, media_id)): Path<(String, String)>,
) -> Response {
    let session = match state.sessions.get_or_404(&session_id) {
        Ok(s) => s,
        Err(e) => return ApiError(e).into_response(),
    };
    let Some(meta) = session.media_meta(&media_id).await else {
        return api_error(StatusCode::NOT_FOUND, "media not found");
    };
    if !meta.path.exists() {
        return api_error(StatusCode::NOT_FOUND, "file not found");
    }
    if !cf_media::is_under_dir(&meta.path, session.media_store.media_dir()) {
        return api_error(StatusCode::FORBIDDEN, "forbidden");
    }
    serve_file(&meta.path, guess_media_type(&meta.path), Some(&meta.name)).await
}

/// Stream a file with the given content type; used by thumb/file and
/// the preview endpoint.
pub async fn serve_file(path: &FsPath, content_type: &str, filename: Option<&str>) -> Response {
    let file = match tokio::fs::File::open(path).await {
        Ok(f) => f,
        Err(_) => return api_error(StatusCode::NOT_FOUND, "file not found"),
    };
    let stream = ReaderStream::new(file);
    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type);
    if let Some(name) = filename {
        let clean = name.replace(['"', '\r', '\n'], "");
        response = response.header(
            header::CONTENT_DISPOSITION,
            format!("inline; filename=\"{clean}\""),
        );
    }
    response
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| api_error(StatusCode::INTERNAL_SERVER_ERROR, "serve failed"))
}
