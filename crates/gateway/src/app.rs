//! Router assembly.

use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::api::{media, meta, preview, sessions, templates};
use crate::limits::rules::rate_limit_middleware;
use crate::state::AppState;
use crate::ws::chat::chat_ws;

pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/sessions", post(sessions::create_session))
        .route("/sessions/:sid", get(sessions::get_session))
        .route("/sessions/:sid/clear", post(sessions::clear_session))
        .route("/sessions/:sid/cancel", post(sessions::cancel_session))
        .route("/sessions/:sid/media", post(media::upload_media))
        .route("/sessions/:sid/media/init", post(media::init_resumable))
        .route("/sessions/:sid/media/pending", get(media::get_pending))
        .route(
            "/sessions/:sid/media/pending/:mid",
            delete(media::delete_pending),
        )
        .route("/sessions/:sid/media/:mid/chunk", post(media::upload_chunk))
        .route(
            "/sessions/:sid/media/:mid/complete",
            post(media::complete_resumable),
        )
        .route(
            "/sessions/:sid/media/:mid/cancel",
            post(media::cancel_resumable),
        )
        .route("/sessions/:sid/media/:mid/thumb", get(media::get_thumb))
        .route("/sessions/:sid/media/:mid/file", get(media::get_file))
        .route("/sessions/:sid/preview", get(preview::preview))
        .route(
            "/templates",
            get(templates::list_templates).post(templates::save_template),
        )
        .route(
            "/templates/:tid",
            get(templates::get_template).delete(templates::delete_template),
        )
        .route("/meta/tts", get(meta::tts_schema));

    Router::new()
        .nest("/api", api)
        .route("/ws/sessions/:sid/chat", get(chat_ws))
        // Direct multipart uploads carry whole assets; the per-size
        // admission cost in the rate limiter is the real guard.
        .layer(DefaultBodyLimit::max(1024 * 1024 * 1024))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit_middleware,
        ))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
